use std::fmt::Write as _;

use clap::ValueEnum;
use serde_json::Value;

use tollgate_core::config::{AppConfig, LoadOptions};
use tollgate_core::memory::{MemoryError, MemoryStore, ScoredRecord, TextRecord, UsageRecord};

use crate::commands::{
    finish, load_config, memory_store, open_database, runtime, CommandResult, Failure,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RecordKind {
    Usage,
    Text,
}

enum Operation<'q> {
    SearchUsage {
        query: &'q str,
        limit: usize,
        threshold: Option<f32>,
        tool_name: Option<&'q str>,
    },
    SearchText { query: &'q str, limit: usize, threshold: Option<f32> },
    Recent { kind: RecordKind, limit: usize },
}

pub fn search_usage(
    options: &LoadOptions,
    query: &str,
    limit: usize,
    threshold: Option<f32>,
    tool_name: Option<&str>,
) -> CommandResult {
    execute(
        "memory search-usage",
        options,
        Operation::SearchUsage { query, limit, threshold, tool_name },
    )
}

pub fn search_text(
    options: &LoadOptions,
    query: &str,
    limit: usize,
    threshold: Option<f32>,
) -> CommandResult {
    execute("memory search-text", options, Operation::SearchText { query, limit, threshold })
}

pub fn recent(options: &LoadOptions, kind: RecordKind, limit: usize) -> CommandResult {
    execute("memory recent", options, Operation::Recent { kind, limit })
}

fn execute(command: &str, options: &LoadOptions, operation: Operation<'_>) -> CommandResult {
    let config = match load_config(command, options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime(command) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let store = memory_store(&config, &pool)?;
        let outcome = perform(store.as_ref(), &config, operation).await;
        pool.close().await;
        outcome
    });

    finish(command, result)
}

async fn perform(
    store: &dyn MemoryStore,
    config: &AppConfig,
    operation: Operation<'_>,
) -> Result<String, Failure> {
    let default_threshold = config.memory.similarity_threshold;
    match operation {
        Operation::SearchUsage { query, limit, threshold, tool_name } => {
            let hits = store
                .search_usage(query, limit, threshold.unwrap_or(default_threshold), tool_name)
                .await
                .map_err(memory_failure)?;
            Ok(render_usage_hits(&hits))
        }
        Operation::SearchText { query, limit, threshold } => {
            let hits = store
                .search_text(query, limit, threshold.unwrap_or(default_threshold))
                .await
                .map_err(memory_failure)?;
            Ok(render_text_hits(&hits))
        }
        Operation::Recent { kind: RecordKind::Usage, limit } => {
            let records = store.recent_usage(limit).await.map_err(memory_failure)?;
            Ok(render_usage_records(&records))
        }
        Operation::Recent { kind: RecordKind::Text, limit } => {
            let records = store.recent_text(limit).await.map_err(memory_failure)?;
            Ok(render_text_records(&records))
        }
    }
}

fn memory_failure(error: MemoryError) -> Failure {
    match error {
        MemoryError::Unsupported(operation) => {
            ("unsupported", format!("memory backend does not support `{operation}`"), 7)
        }
        MemoryError::InvalidInput(_) => ("invalid_input", error.to_string(), 2),
        other => ("memory_backend", other.to_string(), 7),
    }
}

fn render_usage_hits(hits: &[ScoredRecord<UsageRecord>]) -> String {
    if hits.is_empty() {
        return "no matching usage records".to_string();
    }
    let mut out = String::new();
    for hit in hits {
        let _ = writeln!(
            out,
            "[{:.3}] {} -> {} {}",
            hit.score,
            hit.record.question,
            hit.record.tool_name,
            Value::Object(hit.record.arguments.clone())
        );
    }
    out.trim_end().to_string()
}

fn render_text_hits(hits: &[ScoredRecord<TextRecord>]) -> String {
    if hits.is_empty() {
        return "no matching text memories".to_string();
    }
    let mut out = String::new();
    for hit in hits {
        let _ = writeln!(out, "[{:.3}] {}", hit.score, hit.record.content);
    }
    out.trim_end().to_string()
}

fn render_usage_records(records: &[UsageRecord]) -> String {
    if records.is_empty() {
        return "no usage records".to_string();
    }
    let mut out = String::new();
    for record in records {
        let _ = writeln!(
            out,
            "{} {} -> {}{}",
            record.timestamp.to_rfc3339(),
            record.question,
            record.tool_name,
            if record.success { "" } else { " (failed)" }
        );
    }
    out.trim_end().to_string()
}

fn render_text_records(records: &[TextRecord]) -> String {
    if records.is_empty() {
        return "no text memories".to_string();
    }
    let mut out = String::new();
    for record in records {
        let _ = writeln!(out, "{} {}", record.timestamp.to_rfc3339(), record.content);
    }
    out.trim_end().to_string()
}
