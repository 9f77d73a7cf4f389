//! Document-store collaborator.
//!
//! The real-time core only talks to persistence through [`ChatStore`]. Two
//! adapters exist: [`PgStore`] for deployments and [`MemoryStore`] for
//! single-process development and the test suite.

use crate::models::{Conversation, Message, NewMessage, PresenceStatus, WriteBehindEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Uniqueness violation on (sender, client_id). Callers treat it as "already sent".
    #[error("duplicate client message id")]
    Duplicate,

    #[error("record not found")]
    NotFound,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Identity record the principal resolver looks up after verifying a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub display_name: String,
    pub verified: bool,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn find_user(&self, user_id: Uuid) -> StoreResult<Option<UserProfile>>;

    async fn get_conversation(&self, conversation_id: Uuid) -> StoreResult<Option<Conversation>>;

    /// Live conversations where `user_id` is an active participant, most recent first.
    async fn list_user_conversations(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<Conversation>>;

    /// Idempotent: at most one live direct conversation per unordered pair.
    async fn find_or_create_direct(&self, user_a: Uuid, user_b: Uuid)
        -> StoreResult<Conversation>;

    async fn touch_conversation(
        &self,
        conversation_id: Uuid,
        last_message_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Moves `last_read_at` forward only.
    async fn update_last_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn find_by_client_id(
        &self,
        sender_id: Uuid,
        client_id: &str,
    ) -> StoreResult<Option<Message>>;

    /// Assigns id and the next sequence number of the conversation.
    /// Returns [`StoreError::Duplicate`] on a (sender, client_id) collision.
    async fn insert_message(&self, new: NewMessage) -> StoreResult<Message>;

    /// Unordered bulk insert used by the write-behind consumer. Entries that
    /// already exist are skipped. Returns the number of rows written.
    async fn bulk_insert(&self, entries: &[WriteBehindEntry]) -> StoreResult<u64>;

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>>;

    /// Page of messages ordered newest first, strictly below `before` when given.
    async fn history(
        &self,
        conversation_id: Uuid,
        before: Option<i64>,
        limit: usize,
    ) -> StoreResult<Vec<Message>>;

    /// Returns true when the receipt was newly recorded.
    async fn mark_delivered(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Returns true when the receipt was newly recorded.
    async fn mark_read(&self, message_id: Uuid, user_id: Uuid, at: DateTime<Utc>)
        -> StoreResult<bool>;

    /// Messages not authored by `user_id` and not yet read by them, in sequence order.
    async fn unread_for(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<Vec<Message>>;

    async fn set_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<Message>;

    async fn edit_message(
        &self,
        message_id: Uuid,
        content: String,
        at: DateTime<Utc>,
    ) -> StoreResult<Message>;

    async fn delete_for_everyone(&self, message_id: Uuid, at: DateTime<Utc>)
        -> StoreResult<Message>;

    async fn delete_for_user(&self, message_id: Uuid, user_id: Uuid) -> StoreResult<()>;

    async fn update_presence(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> StoreResult<()>;
}
