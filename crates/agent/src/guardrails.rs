//! Read-only guard for warehouse SQL and the `run_sql` tool built on it.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::tools::{Tool, ToolContext};

pub const RUN_SQL_TOOL: &str = "run_sql";

pub const DEFAULT_ALLOWED_STATEMENTS: [&str; 5] = ["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];

pub const BLOCKED_KEYWORDS: [&str; 28] = [
    "INSERT", "UPDATE", "DELETE", "REPLACE", "MERGE", "UPSERT", "DROP", "ALTER", "CREATE",
    "TRUNCATE", "RENAME", "GRANT", "REVOKE", "LOCK", "UNLOCK", "CALL", "LOAD", "IMPORT", "SET",
    "KILL", "FLUSH", "RESET", "PURGE", "HANDLER", "DO", "PREPARE", "EXECUTE", "DEALLOCATE",
];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReadOnlyViolation {
    #[error("SQL query cannot be empty")]
    Empty,
    #[error("SQL query contains only comments")]
    EmptyAfterComments,
    #[error("multiple SQL statements are not allowed, found {0}")]
    MultipleStatements(usize),
    #[error("statement type `{found}` is not allowed, allowed types: {allowed}")]
    DisallowedStatement { found: String, allowed: String },
    #[error("blocked keyword `{0}` is not allowed in read-only mode")]
    BlockedKeyword(String),
}

impl ReadOnlyViolation {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Empty => "sql_empty",
            Self::EmptyAfterComments => "sql_only_comments",
            Self::MultipleStatements(_) => "sql_multiple_statements",
            Self::DisallowedStatement { .. } => "sql_statement_not_allowed",
            Self::BlockedKeyword(_) => "sql_blocked_keyword",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReadOnlySqlGuard {
    allowed: BTreeSet<String>,
    blocked: Regex,
}

impl ReadOnlySqlGuard {
    pub fn new<I, S>(allowed_statements: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed: BTreeSet<String> = allowed_statements
            .into_iter()
            .map(|statement| statement.as_ref().trim().to_ascii_uppercase())
            .filter(|statement| !statement.is_empty())
            .collect();
        let blocked = Regex::new(&format!(r"\b({})\b", BLOCKED_KEYWORDS.join("|")))?;
        Ok(Self { allowed, blocked })
    }

    pub fn standard() -> Result<Self, regex::Error> {
        Self::new(DEFAULT_ALLOWED_STATEMENTS)
    }

    /// Checks run in order: emptiness, comment-only input, statement count,
    /// leading statement type, then blocked keywords anywhere in the text.
    pub fn validate(&self, sql: &str) -> Result<(), ReadOnlyViolation> {
        if sql.trim().is_empty() {
            return Err(ReadOnlyViolation::Empty);
        }

        let stripped = strip_comments(sql);
        if stripped.trim().is_empty() {
            return Err(ReadOnlyViolation::EmptyAfterComments);
        }

        let statements = split_statements(&stripped);
        if statements.len() > 1 {
            return Err(ReadOnlyViolation::MultipleStatements(statements.len()));
        }
        let statement = statements.first().map(String::as_str).unwrap_or_default();

        let normalized =
            statement.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
        let statement_type = leading_statement_type(&normalized);
        if !self.allowed.contains(&statement_type) {
            return Err(ReadOnlyViolation::DisallowedStatement {
                found: statement_type,
                allowed: self.allowed.iter().cloned().collect::<Vec<_>>().join(", "),
            });
        }

        if let Some(found) = self.blocked.find(&normalized) {
            return Err(ReadOnlyViolation::BlockedKeyword(found.as_str().to_string()));
        }

        Ok(())
    }
}

/// `WITH` takes the type of the statement after its common table expressions.
fn leading_statement_type(normalized: &str) -> String {
    let mut words = normalized
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty());
    match words.next() {
        Some("WITH") => {
            const BODY: [&str; 5] = ["SELECT", "INSERT", "UPDATE", "DELETE", "MERGE"];
            words.find(|word| BODY.contains(word)).unwrap_or("WITH").to_string()
        }
        Some(word) => word.to_string(),
        None => "UNKNOWN".to_string(),
    }
}

/// Removes `--`, `#` and `/* */` comments outside of quoted text.
fn strip_comments(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut output = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut index = 0;

    while index < chars.len() {
        let current = chars[index];
        let next = chars.get(index + 1).copied();

        if let Some(open) = quote {
            output.push(current);
            if current == open {
                quote = None;
            }
            index += 1;
            continue;
        }

        match (current, next) {
            ('\'' | '"' | '`', _) => {
                quote = Some(current);
                output.push(current);
                index += 1;
            }
            ('-', Some('-')) | ('#', _) => {
                while index < chars.len() && chars[index] != '\n' {
                    index += 1;
                }
            }
            ('/', Some('*')) => {
                index += 2;
                while index < chars.len()
                    && !(chars[index] == '*' && chars.get(index + 1) == Some(&'/'))
                {
                    index += 1;
                }
                index += 2;
                output.push(' ');
            }
            _ => {
                output.push(current);
                index += 1;
            }
        }
    }

    output
}

/// Splits on semicolons outside of quoted text, dropping empty statements.
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for character in sql.chars() {
        match quote {
            Some(open) => {
                if character == open {
                    quote = None;
                }
                current.push(character);
            }
            None if matches!(character, '\'' | '"' | '`') => {
                quote = Some(character);
                current.push(character);
            }
            None if character == ';' => {
                statements.push(std::mem::take(&mut current));
            }
            None => current.push(character),
        }
    }
    statements.push(current);

    statements
        .into_iter()
        .map(|statement| statement.trim().to_string())
        .filter(|statement| !statement.is_empty())
        .collect()
}

/// Executes already-validated SQL against the warehouse.
#[async_trait]
pub trait SqlRunner: Send + Sync {
    async fn run(&self, sql: &str) -> Result<Value>;
}

#[derive(Debug, Deserialize)]
struct RunSqlArgs {
    sql: String,
}

pub struct RunSqlTool<R> {
    runner: R,
    guard: ReadOnlySqlGuard,
}

impl<R: SqlRunner> RunSqlTool<R> {
    pub fn new(runner: R, guard: ReadOnlySqlGuard) -> Self {
        Self { runner, guard }
    }
}

#[async_trait]
impl<R: SqlRunner> Tool for RunSqlTool<R> {
    fn name(&self) -> &str {
        RUN_SQL_TOOL
    }

    fn description(&self) -> &str {
        "Run a read-only SQL query against the warehouse and return the rows"
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sql": {"type": "string", "description": "A single read-only SQL statement"}
            },
            "required": ["sql"]
        })
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<Value> {
        let RunSqlArgs { sql } = serde_json::from_value(arguments)?;
        if let Err(violation) = self.guard.validate(&sql) {
            warn!(
                event_name = "tool.run_sql.rejected",
                reason_code = violation.reason_code(),
                request_id = %context.request_id,
                "read-only guard rejected query"
            );
            return Err(violation.into());
        }
        self.runner.run(&sql).await
    }
}
