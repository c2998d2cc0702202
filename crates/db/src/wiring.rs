//! Builds the configured audit sink and memory store.

use std::sync::Arc;

use tracing::info;

use tollgate_core::audit::{AuditError, AuditSink, InMemoryAuditSink, JsonlAuditSink};
use tollgate_core::config::{AuditConfig, AuditSinkKind, MemoryBackend, MemoryConfig};
use tollgate_core::memory::{HashingEmbedder, InMemoryMemoryStore, MemoryError, MemoryStore};

use crate::{DbPool, SqlAuditSink, SqlMemoryStore};

pub async fn audit_sink_from_config(
    config: &AuditConfig,
    pool: &DbPool,
) -> Result<Arc<dyn AuditSink>, AuditError> {
    let sink: Arc<dyn AuditSink> = match config.sink {
        AuditSinkKind::InMemory => Arc::new(InMemoryAuditSink::default()),
        AuditSinkKind::Jsonl => {
            let key = config.signing_key_bytes();
            if key.is_empty() {
                return Err(AuditError::Write(
                    "audit.signing_key is required for the jsonl sink".to_string(),
                ));
            }
            let sink =
                JsonlAuditSink::open(config.jsonl_path.clone(), key, config.log_all_tools).await?;
            Arc::new(sink)
        }
        AuditSinkKind::Sqlite => Arc::new(SqlAuditSink::new(pool.clone())),
    };
    info!(event_name = "wiring.audit_sink", sink = ?config.sink, "audit sink ready");
    Ok(sink)
}

pub fn memory_store_from_config(
    config: &MemoryConfig,
    pool: &DbPool,
) -> Result<Arc<dyn MemoryStore>, MemoryError> {
    let embedder = Arc::new(HashingEmbedder::new(config.embedding_dimensions)?);
    let store: Arc<dyn MemoryStore> = match config.backend {
        MemoryBackend::InMemory => Arc::new(InMemoryMemoryStore::new(embedder)),
        MemoryBackend::Sqlite => Arc::new(SqlMemoryStore::new(pool.clone(), embedder)),
    };
    info!(event_name = "wiring.memory_store", backend = ?config.backend, "memory store ready");
    Ok(store)
}
