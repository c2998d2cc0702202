use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use tollgate_core::audit::jsonl::{read_records, JsonlContents};
use tollgate_core::audit::report::{export_successful_usages, summarize, AuditSummary};
use tollgate_core::audit::verify_chain;
use tollgate_core::config::{AppConfig, LoadOptions};
use tollgate_core::AuditEvent;

use crate::commands::seed::{SeedFile, SeedUsage};
use crate::commands::{finish, load_config, runtime, CommandResult, Failure};

pub fn summary(options: &LoadOptions, log: Option<&Path>) -> CommandResult {
    with_log("audit summary", options, log, |_, contents| {
        let events: Vec<&AuditEvent> =
            contents.records.iter().map(|record| &record.event).collect();
        Ok(render_summary(&summarize(events), &contents.malformed_lines))
    })
}

pub fn export(
    options: &LoadOptions,
    log: Option<&Path>,
    tool_name: &str,
    output: Option<&Path>,
) -> CommandResult {
    with_log("audit export", options, log, |_, contents| {
        let usages = export_successful_usages(
            contents.records.iter().map(|record| &record.event),
            tool_name,
        );
        let seed = SeedFile {
            usage: usages
                .into_iter()
                .map(|usage| SeedUsage {
                    question: usage.question,
                    tool_name: usage.tool_name,
                    args: usage.arguments,
                    category: None,
                    success: true,
                })
                .collect(),
            text: Vec::new(),
        };
        let rendered = toml::to_string(&seed)
            .map_err(|error| ("export_serialization", error.to_string(), 7u8))?;

        match output {
            Some(path) => {
                fs::write(path, &rendered).map_err(|error| {
                    ("export_write", format!("could not write `{}`: {error}", path.display()), 7u8)
                })?;
                info!(
                    event_name = "cli.audit.exported",
                    tool_name,
                    exported = seed.usage.len(),
                    path = %path.display(),
                    "exported successful usages"
                );
                Ok(format!(
                    "exported {} successful `{tool_name}` usage(s) to {}",
                    seed.usage.len(),
                    path.display()
                ))
            }
            None => Ok(rendered),
        }
    })
}

pub fn verify(options: &LoadOptions, log: Option<&Path>) -> CommandResult {
    with_log("audit verify", options, log, |config, contents| {
        let key = config.audit.signing_key_bytes();
        if key.is_empty() {
            return Err((
                "config_validation",
                "audit.signing_key is required to verify a chain (set TOLLGATE_AUDIT_SIGNING_KEY)"
                    .to_string(),
                2,
            ));
        }

        let verification = verify_chain(&contents.records, &key);
        let mut message = format!("verified {} entries", verification.verified_entries);
        if let Some(hash) = &verification.latest_hash {
            let _ = write!(message, ", latest hash {hash}");
        }
        if !contents.malformed_lines.is_empty() {
            let _ = write!(message, ", malformed lines {:?}", contents.malformed_lines);
        }

        if verification.valid {
            Ok(message)
        } else {
            let reason = verification.failure_reason.unwrap_or_else(|| "unknown".to_string());
            Err(("chain_invalid", format!("{message}; chain broken: {reason}"), 8))
        }
    })
}

fn with_log(
    command: &str,
    options: &LoadOptions,
    log: Option<&Path>,
    handler: impl FnOnce(&AppConfig, JsonlContents) -> Result<String, Failure>,
) -> CommandResult {
    let config = match load_config(command, options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime(command) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let path: PathBuf =
        log.map(Path::to_path_buf).unwrap_or_else(|| config.audit.jsonl_path.clone());
    let contents = match runtime.block_on(read_records(&path)) {
        Ok(contents) => contents,
        Err(error) => {
            return CommandResult::failure(command, "audit_log", error.to_string(), 6);
        }
    };

    finish(command, handler(&config, contents))
}

fn render_summary(summary: &AuditSummary, malformed_lines: &[usize]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "tool outcomes: {}", summary.total_outcomes);
    let _ = writeln!(out, "successful: {}", summary.successful);
    let _ = writeln!(out, "failed: {}", summary.failed);
    if let Some(rate) = summary.success_rate() {
        let _ = writeln!(out, "success rate: {:.1}%", rate * 100.0);
    }
    let _ = writeln!(out, "denied access checks: {}", summary.denied_access_checks);
    let _ = writeln!(out, "unique principals: {}", summary.unique_principals);

    if !summary.tool_usage.is_empty() {
        let _ = writeln!(out, "tool usage:");
        for (tool, count) in &summary.tool_usage {
            let _ = writeln!(out, "  - {tool}: {count}");
        }
    }
    if !summary.top_errors.is_empty() {
        let _ = writeln!(out, "top errors:");
        for (error, count) in &summary.top_errors {
            let _ = writeln!(out, "  - {error} ({count})");
        }
    }
    if !summary.sample_questions.is_empty() {
        let _ = writeln!(out, "sample questions:");
        for question in &summary.sample_questions {
            let _ = writeln!(out, "  - {question}");
        }
    }
    if !malformed_lines.is_empty() {
        let _ = writeln!(out, "skipped malformed lines: {malformed_lines:?}");
    }

    out.trim_end().to_string()
}
