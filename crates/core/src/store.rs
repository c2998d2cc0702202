//! Conversation persistence contract.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::conversation::{Conversation, ConversationId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation store failure: {0}")]
    Backend(String),
    #[error("stored conversation `{id}` could not be decoded: {reason}")]
    Decode { id: String, reason: String },
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError>;
    /// Replaces the stored history with `conversation.messages`.
    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(&id.0).cloned())
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        conversations.insert(conversation.id.0.clone(), conversation.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::conversation::{Conversation, ConversationId, Message};

    use super::{ConversationStore, InMemoryConversationStore};

    #[tokio::test]
    async fn save_then_load_returns_latest_history() {
        let store = InMemoryConversationStore::default();
        let id = ConversationId("conv-1".to_string());
        assert!(store.load(&id).await.expect("load").is_none());

        let mut conversation = Conversation::new(id.clone(), "u-1");
        conversation.append(Message::user("hello"));
        store.save(&conversation).await.expect("save");

        conversation.append(Message::assistant("hi"));
        store.save(&conversation).await.expect("save again");

        let loaded = store.load(&id).await.expect("load").expect("present");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.owner_id, "u-1");
    }
}
