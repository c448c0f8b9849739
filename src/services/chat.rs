//! Chat relay — append-only room messages.
//!
//! Messages are validated, persisted, then broadcast to ALL members
//! including the sender. Echoing the sender is deliberate and differs from
//! the whiteboard engine: chat clients render their own message as it
//! arrives through the same channel as everyone else's, which keeps display
//! order identical on every screen. Typing indicators are ephemeral: never
//! persisted, broadcast to others only.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::frame::now_ms;
use crate::services::identity::Identity;

/// Hard cap on message length, in characters.
pub const MAX_CONTENT_LEN: usize = 4000;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub author_id: Uuid,
    pub author_name: String,
    pub content: String,
    pub kind: String,
    pub created_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("message content exceeds {MAX_CONTENT_LEN} characters")]
    ContentTooLong,
    #[error(transparent)]
    Store(#[from] ChatStoreError),
}

impl crate::frame::ErrorCode for ChatError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyContent | Self::ContentTooLong => "E_VALIDATION",
            Self::Store(_) => "E_STORE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatStoreError {
    #[error("chat store failed: {0}")]
    Store(#[from] sqlx::Error),
}

// =============================================================================
// STORE
// =============================================================================

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append(&self, message: &ChatMessage) -> Result<(), ChatStoreError>;
}

pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn append(&self, message: &ChatMessage) -> Result<(), ChatStoreError> {
        sqlx::query(
            "INSERT INTO chat_messages (id, room_id, author_id, author_name, content, kind, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(message.id)
        .bind(message.room_id)
        .bind(message.author_id)
        .bind(&message.author_name)
        .bind(&message.content)
        .bind(&message.kind)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Process-local chat log for tests.
#[derive(Default)]
pub struct MemoryChatStore {
    messages: Mutex<HashMap<Uuid, Vec<ChatMessage>>>,
}

impl MemoryChatStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages appended for a room, in append order.
    #[must_use]
    pub fn room_messages(&self, room_id: Uuid) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&room_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn append(&self, message: &ChatMessage) -> Result<(), ChatStoreError> {
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(message.room_id)
            .or_default()
            .push(message.clone());
        Ok(())
    }
}

// =============================================================================
// SERVICE
// =============================================================================

/// Validate and assemble a message. Pure; the caller persists and
/// broadcasts.
///
/// # Errors
///
/// `EmptyContent` / `ContentTooLong` on validation failure.
pub fn build_message(
    room_id: Uuid,
    author: &Identity,
    content: &str,
    kind: Option<&str>,
) -> Result<ChatMessage, ChatError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::EmptyContent);
    }
    if trimmed.chars().count() > MAX_CONTENT_LEN {
        return Err(ChatError::ContentTooLong);
    }

    Ok(ChatMessage {
        id: Uuid::new_v4(),
        room_id,
        author_id: author.id,
        author_name: author.name.clone(),
        content: trimmed.to_string(),
        kind: kind.unwrap_or("text").to_string(),
        created_at: now_ms(),
    })
}
