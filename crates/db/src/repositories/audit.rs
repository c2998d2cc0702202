use async_trait::async_trait;
use sqlx::Row;
use tracing::debug;

use tollgate_core::audit::{AuditError, AuditEvent, AuditQuery, AuditSink};

use super::{format_timestamp, RepositoryError};
use crate::DbPool;

/// Queryable audit sink. The full event is kept as JSON; the envelope fields
/// are duplicated into columns for filtering.
pub struct SqlAuditSink {
    pool: DbPool,
}

impl SqlAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, event: &AuditEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO audit_event (
                event_id, event_type, occurred_at, principal_id, conversation_id,
                request_id, tool_name, payload_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.event_id)
        .bind(event.event_type())
        .bind(format_timestamp(event.timestamp))
        .bind(&event.principal_id)
        .bind(&event.conversation_id)
        .bind(&event.request_id)
        .bind(event.kind.tool_name())
        .bind(serde_json::to_string(event)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, RepositoryError> {
        let limit = if query.limit == 0 { -1 } else { query.limit as i64 };
        let rows = sqlx::query(
            r#"
            SELECT payload_json
            FROM audit_event
            WHERE (?1 IS NULL OR event_type = ?1)
              AND (?2 IS NULL OR principal_id = ?2)
              AND (?3 IS NULL OR conversation_id = ?3)
              AND (?4 IS NULL OR occurred_at >= ?4)
              AND (?5 IS NULL OR occurred_at < ?5)
            ORDER BY occurred_at DESC, rowid DESC
            LIMIT ?6
            "#,
        )
        .bind(query.event_type.as_deref())
        .bind(query.principal_id.as_deref())
        .bind(query.conversation_id.as_deref())
        .bind(query.since.map(format_timestamp))
        .bind(query.until.map(format_timestamp))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let payload: String = row.try_get("payload_json")?;
                Ok(serde_json::from_str::<AuditEvent>(&payload)?)
            })
            .collect()
    }
}

#[async_trait]
impl AuditSink for SqlAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.insert(&event).await?;
        debug!(
            event_name = "audit.sql.recorded",
            audit_event_type = event.event_type(),
            request_id = %event.request_id,
            "audit event stored"
        );
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self.select(query).await?)
    }
}
