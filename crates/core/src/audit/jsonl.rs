use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::chain::{AuditChain, SealedAuditRecord};
use super::{AuditError, AuditEvent, AuditEventKind, AuditSink};

/// Tool whose invocations and outcomes are kept when `log_all_tools` is off.
pub const DEFAULT_LOGGED_TOOL: &str = "run_sql";

/// Appends sealed audit records to a JSON-lines file.
///
/// The file is the tamper-evident artifact; it cannot be queried in place, so
/// `query` keeps the unsupported default.
pub struct JsonlAuditSink {
    path: PathBuf,
    log_all_tools: bool,
    chain: Mutex<AuditChain>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct JsonlContents {
    pub records: Vec<SealedAuditRecord>,
    /// 1-based line numbers that did not parse as a sealed record.
    pub malformed_lines: Vec<usize>,
}

impl JsonlAuditSink {
    pub async fn open(
        path: impl Into<PathBuf>,
        signing_key: impl AsRef<[u8]>,
        log_all_tools: bool,
    ) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(write_error)?;
        }

        let existing = if fs::try_exists(&path).await.unwrap_or(false) {
            read_records(&path).await?
        } else {
            info!(
                event_name = "audit.jsonl.created",
                path = %path.display(),
                "creating audit log file"
            );
            JsonlContents::default()
        };

        let chain = AuditChain::resume(signing_key, existing.records.last());
        Ok(Self { path, log_all_tools, chain: Mutex::new(chain) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn keeps(&self, event: &AuditEvent) -> bool {
        if self.log_all_tools {
            return true;
        }
        match &event.kind {
            AuditEventKind::Invocation { tool_name, .. }
            | AuditEventKind::Outcome { tool_name, .. } => tool_name == DEFAULT_LOGGED_TOOL,
            _ => true,
        }
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        if !self.keeps(&event) {
            return Ok(());
        }

        // Held across the write so sequence order matches file order.
        let mut chain = self.chain.lock().await;
        let mut staged = chain.clone();
        let sealed = staged.seal(event)?;
        let mut line = serde_json::to_string(&sealed)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(write_error)?;
        let previous_len = file.metadata().await.map_err(write_error)?.len();
        if previous_len > 0 && !ends_with_newline(&mut file, previous_len).await? {
            line.insert(0, '\n');
        }

        if let Err(error) = append(&mut file, line.as_bytes()).await {
            // A partial line would glue itself to the next record.
            if let Err(truncate_error) = file.set_len(previous_len).await {
                warn!(
                    event_name = "audit.jsonl.truncate_failed",
                    path = %self.path.display(),
                    error = %truncate_error,
                    "could not roll back a partial audit line"
                );
            }
            return Err(write_error(error));
        }

        *chain = staged;
        Ok(())
    }
}

async fn ends_with_newline(file: &mut File, len: u64) -> Result<bool, AuditError> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1)).await.map_err(write_error)?;
    file.read_exact(&mut last).await.map_err(write_error)?;
    Ok(last[0] == b'\n')
}

async fn append(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}

fn write_error(error: std::io::Error) -> AuditError {
    AuditError::Write(error.to_string())
}

pub async fn read_records(path: impl AsRef<Path>) -> Result<JsonlContents, AuditError> {
    let raw = fs::read_to_string(path.as_ref())
        .await
        .map_err(|error| AuditError::Write(format!("{}: {error}", path.as_ref().display())))?;

    let mut contents = JsonlContents::default();
    for (index, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<SealedAuditRecord>(trimmed) {
            Ok(record) => contents.records.push(record),
            Err(_) => contents.malformed_lines.push(index + 1),
        }
    }
    Ok(contents)
}
