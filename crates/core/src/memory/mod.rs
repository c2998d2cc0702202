//! Similarity-searchable agent memory.
//!
//! Two record kinds share one set of search semantics: structured tool-usage
//! records (question, tool, arguments) for reusing proven calls, and free-text
//! records for domain knowledge. Results are ranked by descending similarity,
//! ties broken most-recent-first, and anything under the caller's threshold is
//! dropped.

pub mod embedding;
pub mod in_memory;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub use embedding::{cosine_similarity, Embedder, HashingEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use in_memory::InMemoryMemoryStore;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory backend does not support `{0}`")]
    Unsupported(&'static str),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("memory backend failure: {0}")]
    Backend(String),
    #[error("invalid memory input: {0}")]
    InvalidInput(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryId(pub String);

impl MemoryId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: MemoryId,
    pub question: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub success: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub embedding: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextRecord {
    pub id: MemoryId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub embedding: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryRecord {
    StructuredUsage(UsageRecord),
    FreeText(TextRecord),
}

impl MemoryRecord {
    pub fn id(&self) -> &MemoryId {
        match self {
            Self::StructuredUsage(record) => &record.id,
            Self::FreeText(record) => &record.id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::StructuredUsage(record) => record.timestamp,
            Self::FreeText(record) => record.timestamp,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord<T> {
    pub record: T,
    pub score: f32,
}

/// Bulk-delete filter. An empty filter matches every record of the kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClearFilter {
    pub tool_name: Option<String>,
    pub before: Option<DateTime<Utc>>,
}

impl ClearFilter {
    pub fn matches_usage(&self, record: &UsageRecord) -> bool {
        self.tool_name.as_deref().map_or(true, |name| name == record.tool_name)
            && self.before.map_or(true, |before| record.timestamp < before)
    }

    pub fn matches_text(&self, record: &TextRecord) -> bool {
        self.before.map_or(true, |before| record.timestamp < before)
    }
}

/// Arguments of a structured usage write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewUsage {
    pub question: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub success: bool,
    pub metadata: BTreeMap<String, Value>,
}

impl NewUsage {
    pub fn new(
        question: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            question: question.into(),
            tool_name: tool_name.into(),
            arguments,
            success: true,
            metadata: BTreeMap::new(),
        }
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn write_usage(&self, usage: NewUsage) -> Result<UsageRecord, MemoryError>;

    async fn write_text(&self, content: &str) -> Result<TextRecord, MemoryError>;

    async fn search_usage(
        &self,
        question: &str,
        limit: usize,
        similarity_threshold: f32,
        tool_name: Option<&str>,
    ) -> Result<Vec<ScoredRecord<UsageRecord>>, MemoryError>;

    async fn search_text(
        &self,
        query: &str,
        limit: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<ScoredRecord<TextRecord>>, MemoryError>;

    async fn recent_usage(&self, _limit: usize) -> Result<Vec<UsageRecord>, MemoryError> {
        Err(MemoryError::Unsupported("recent_usage"))
    }

    async fn recent_text(&self, _limit: usize) -> Result<Vec<TextRecord>, MemoryError> {
        Err(MemoryError::Unsupported("recent_text"))
    }

    async fn delete_usage(&self, id: &MemoryId) -> Result<bool, MemoryError>;

    async fn delete_text(&self, id: &MemoryId) -> Result<bool, MemoryError>;

    /// Returns how many records were removed.
    async fn clear_usage(&self, filter: &ClearFilter) -> Result<usize, MemoryError>;

    async fn clear_text(&self, before: Option<DateTime<Utc>>) -> Result<usize, MemoryError>;
}

/// Records that carry an embedding and a write time.
pub trait Embedded {
    fn embedding(&self) -> &[f32];
    fn written_at(&self) -> DateTime<Utc>;
}

impl Embedded for UsageRecord {
    fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    fn written_at(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Embedded for TextRecord {
    fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    fn written_at(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Scores `candidates` against `query`, drops scores under the threshold and
/// returns at most `limit` hits, best first, newest first on ties.
pub fn rank_by_similarity<T, I>(
    query: &[f32],
    candidates: I,
    limit: usize,
    similarity_threshold: f32,
) -> Vec<ScoredRecord<T>>
where
    T: Embedded,
    I: IntoIterator<Item = T>,
{
    let mut hits: Vec<ScoredRecord<T>> = candidates
        .into_iter()
        .map(|record| {
            let score = cosine_similarity(query, record.embedding());
            ScoredRecord { record, score }
        })
        .filter(|hit| hit.score >= similarity_threshold)
        .collect();

    hits.sort_by(|left, right| {
        right
            .score
            .partial_cmp(&left.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| right.record.written_at().cmp(&left.record.written_at()))
    });
    hits.truncate(limit);
    hits
}

/// Newest first, at most `limit`.
pub fn most_recent<T, I>(records: I, limit: usize) -> Vec<T>
where
    T: Embedded,
    I: IntoIterator<Item = T>,
{
    let mut records: Vec<T> = records.into_iter().collect();
    records.sort_by(|left, right| right.written_at().cmp(&left.written_at()));
    records.truncate(limit);
    records
}
