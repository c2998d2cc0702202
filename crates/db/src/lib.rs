pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod wiring;

pub use connection::{connect, connect_from_config, connect_with_settings, DbPool};
pub use repositories::{RepositoryError, SqlAuditSink, SqlConversationStore, SqlMemoryStore};
pub use wiring::{audit_sink_from_config, memory_store_from_config};
