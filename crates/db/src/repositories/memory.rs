use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{sqlite::SqliteRow, Row};

use tollgate_core::memory::{
    rank_by_similarity, ClearFilter, Embedder, MemoryError, MemoryId, MemoryStore,
    NewUsage, ScoredRecord, TextRecord, UsageRecord,
};

use super::{format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

const USAGE_COLUMNS: &str =
    "id, question, tool_name, arguments_json, success, metadata_json, embedding_json, created_at";
const TEXT_COLUMNS: &str = "id, content, embedding_json, created_at";

/// SQLite-backed memory. Embeddings are stored as JSON arrays and scored in
/// process; the table is the source of truth for every capability.
pub struct SqlMemoryStore {
    pool: DbPool,
    embedder: Arc<dyn Embedder>,
}

impl SqlMemoryStore {
    pub fn new(pool: DbPool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    async fn usage_rows(
        &self,
        tool_name: Option<&str>,
    ) -> Result<Vec<UsageRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_memory WHERE (?1 IS NULL OR tool_name = ?1)"
        ))
        .bind(tool_name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(usage_from_row).collect()
    }

    async fn text_rows(&self) -> Result<Vec<TextRecord>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {TEXT_COLUMNS} FROM text_memory"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(text_from_row).collect()
    }

    /// Newest rows first; fixed-width timestamps sort chronologically as text.
    async fn latest_rows(
        &self,
        table: &'static str,
        columns: &'static str,
        limit: usize,
    ) -> Result<Vec<SqliteRow>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {columns} FROM {table} ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_usage(&self, record: &UsageRecord) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO usage_memory ({USAGE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&record.id.0)
        .bind(&record.question)
        .bind(&record.tool_name)
        .bind(serde_json::to_string(&record.arguments)?)
        .bind(record.success)
        .bind(serde_json::to_string(&record.metadata)?)
        .bind(serde_json::to_string(&record.embedding)?)
        .bind(format_timestamp(record.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_text(&self, record: &TextRecord) -> Result<(), RepositoryError> {
        sqlx::query(&format!("INSERT INTO text_memory ({TEXT_COLUMNS}) VALUES (?, ?, ?, ?)"))
            .bind(&record.id.0)
            .bind(&record.content)
            .bind(serde_json::to_string(&record.embedding)?)
            .bind(format_timestamp(record.timestamp))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_from(
        &self,
        table: &'static str,
        id: &MemoryId,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl MemoryStore for SqlMemoryStore {
    async fn write_usage(&self, usage: NewUsage) -> Result<UsageRecord, MemoryError> {
        if usage.tool_name.trim().is_empty() {
            return Err(MemoryError::InvalidInput("tool name must not be empty".to_string()));
        }
        let record = UsageRecord {
            id: MemoryId::generate(),
            embedding: self.embedder.embed(&usage.question)?,
            question: usage.question,
            tool_name: usage.tool_name,
            arguments: usage.arguments,
            success: usage.success,
            metadata: usage.metadata,
            timestamp: Utc::now(),
        };
        self.insert_usage(&record).await?;
        Ok(record)
    }

    async fn write_text(&self, content: &str) -> Result<TextRecord, MemoryError> {
        let record = TextRecord {
            id: MemoryId::generate(),
            content: content.to_string(),
            timestamp: Utc::now(),
            embedding: self.embedder.embed(content)?,
        };
        self.insert_text(&record).await?;
        Ok(record)
    }

    async fn search_usage(
        &self,
        question: &str,
        limit: usize,
        similarity_threshold: f32,
        tool_name: Option<&str>,
    ) -> Result<Vec<ScoredRecord<UsageRecord>>, MemoryError> {
        let query = self.embedder.embed(question)?;
        let candidates = self.usage_rows(tool_name).await?;
        Ok(rank_by_similarity(&query, candidates, limit, similarity_threshold))
    }

    async fn search_text(
        &self,
        query: &str,
        limit: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<ScoredRecord<TextRecord>>, MemoryError> {
        let query = self.embedder.embed(query)?;
        let candidates = self.text_rows().await?;
        Ok(rank_by_similarity(&query, candidates, limit, similarity_threshold))
    }

    async fn recent_usage(&self, limit: usize) -> Result<Vec<UsageRecord>, MemoryError> {
        let rows = self.latest_rows("usage_memory", USAGE_COLUMNS, limit).await?;
        let records = rows.iter().map(usage_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn recent_text(&self, limit: usize) -> Result<Vec<TextRecord>, MemoryError> {
        let rows = self.latest_rows("text_memory", TEXT_COLUMNS, limit).await?;
        let records = rows.iter().map(text_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn delete_usage(&self, id: &MemoryId) -> Result<bool, MemoryError> {
        Ok(self.delete_from("usage_memory", id).await?)
    }

    async fn delete_text(&self, id: &MemoryId) -> Result<bool, MemoryError> {
        Ok(self.delete_from("text_memory", id).await?)
    }

    async fn clear_usage(&self, filter: &ClearFilter) -> Result<usize, MemoryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM usage_memory
            WHERE (?1 IS NULL OR tool_name = ?1)
              AND (?2 IS NULL OR created_at < ?2)
            "#,
        )
        .bind(filter.tool_name.as_deref())
        .bind(filter.before.map(format_timestamp))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(result.rows_affected() as usize)
    }

    async fn clear_text(&self, before: Option<DateTime<Utc>>) -> Result<usize, MemoryError> {
        let result = sqlx::query("DELETE FROM text_memory WHERE (?1 IS NULL OR created_at < ?1)")
            .bind(before.map(format_timestamp))
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(result.rows_affected() as usize)
    }
}

fn usage_from_row(row: &SqliteRow) -> Result<UsageRecord, RepositoryError> {
    let arguments: String = row.try_get("arguments_json")?;
    let metadata: String = row.try_get("metadata_json")?;
    let embedding: String = row.try_get("embedding_json")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(UsageRecord {
        id: MemoryId(row.try_get("id")?),
        question: row.try_get("question")?,
        tool_name: row.try_get("tool_name")?,
        arguments: serde_json::from_str::<Map<String, Value>>(&arguments)?,
        success: row.try_get("success")?,
        metadata: serde_json::from_str::<BTreeMap<String, Value>>(&metadata)?,
        timestamp: parse_timestamp("created_at", &created_at)?,
        embedding: serde_json::from_str::<Vec<f32>>(&embedding)?,
    })
}

fn text_from_row(row: &SqliteRow) -> Result<TextRecord, RepositoryError> {
    let embedding: String = row.try_get("embedding_json")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(TextRecord {
        id: MemoryId(row.try_get("id")?),
        content: row.try_get("content")?,
        timestamp: parse_timestamp("created_at", &created_at)?,
        embedding: serde_json::from_str::<Vec<f32>>(&embedding)?,
    })
}
