use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use tollgate_core::domain::conversation::{Conversation, ConversationId, Message, Role};
use tollgate_core::store::{ConversationStore, StoreError};

use super::{format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

pub struct SqlConversationStore {
    pool: DbPool,
}

impl SqlConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let Some(row) = sqlx::query(
            "SELECT id, owner_id, created_at, updated_at FROM conversation WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let messages = sqlx::query(
            r#"
            SELECT role, content, created_at
            FROM conversation_message
            WHERE conversation_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(message_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(Some(Conversation {
            id: ConversationId(row.try_get("id")?),
            owner_id: row.try_get("owner_id")?,
            messages,
            created_at: parse_timestamp("created_at", &created_at)?,
            updated_at: parse_timestamp("updated_at", &updated_at)?,
        }))
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO conversation (id, owner_id, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&conversation.id.0)
        .bind(&conversation.owner_id)
        .bind(format_timestamp(conversation.created_at))
        .bind(format_timestamp(conversation.updated_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM conversation_message WHERE conversation_id = ?")
            .bind(&conversation.id.0)
            .execute(&mut *tx)
            .await?;

        for (position, message) in conversation.messages.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO conversation_message
                    (conversation_id, position, role, content, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&conversation.id.0)
            .bind(position as i64)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(format_timestamp(message.timestamp))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqlConversationStore {
    async fn load(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        self.load_conversation(id).await.map_err(|error| match error {
            RepositoryError::Decode(reason) => StoreError::Decode { id: id.0.clone(), reason },
            other => other.into(),
        })
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        Ok(self.save_conversation(conversation).await?)
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message, RepositoryError> {
    let role: String = row.try_get("role")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Message {
        role: role.parse::<Role>().map_err(RepositoryError::Decode)?,
        content: row.try_get("content")?,
        timestamp: parse_timestamp("created_at", &created_at)?,
    })
}
