pub mod access;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod memory;
pub mod store;

pub use access::{grant, FeatureGate};
pub use audit::{
    record_soft, AuditContext, AuditError, AuditEvent, AuditEventKind, AuditQuery, AuditSink,
    InMemoryAuditSink,
};
pub use config::{AppConfig, ConfigError, LoadOptions};
pub use domain::conversation::{Conversation, ConversationId, Message, Role};
pub use domain::principal::Principal;
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use memory::{
    ClearFilter, Embedder, HashingEmbedder, InMemoryMemoryStore, MemoryError, MemoryId,
    MemoryRecord, MemoryStore, NewUsage, ScoredRecord, TextRecord, UsageRecord,
};
pub use store::{ConversationStore, InMemoryConversationStore, StoreError};
