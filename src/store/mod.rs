//! Collaborator seams: the persistent row store and blob storage.
//!
//! The core only talks to these traits. `memory` backs tests and local runs,
//! `postgres` and `s3` are the production adapters.

use crate::error::AppResult;
use crate::models::{
    Conversation, ConversationSnapshot, MemberFlags, MemberState, Message, MessagePatch,
    NewMessage, Participant,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod memory;
pub mod postgres;
pub mod s3;

/// Conversation, membership and message rows reachable over the network
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Conversations `user_id` belongs to, optionally limited to one business scope
    async fn list_conversations(
        &self,
        user_id: Uuid,
        scope: Option<Uuid>,
    ) -> AppResult<Vec<ConversationSnapshot>>;

    /// Return the direct conversation for this scope and pair, creating it if absent
    async fn find_or_create_direct(
        &self,
        scope: Option<Uuid>,
        initiator: Participant,
        recipient: Participant,
    ) -> AppResult<Conversation>;

    async fn create_group(
        &self,
        scope: Option<Uuid>,
        name: &str,
        members: Vec<Participant>,
    ) -> AppResult<Conversation>;

    /// Most recent `limit` messages, oldest first
    async fn fetch_messages(&self, conversation_id: Uuid, limit: usize) -> AppResult<Vec<Message>>;

    async fn fetch_members(&self, conversation_id: Uuid) -> AppResult<Vec<MemberState>>;

    /// Insert a message; the server assigns id and timestamp and echoes `client_token`.
    /// Inserting the same token twice returns the first row.
    async fn insert_message(&self, message: NewMessage) -> AppResult<Message>;

    async fn update_message(&self, message_id: Uuid, patch: MessagePatch) -> AppResult<Message>;

    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> AppResult<()>;

    async fn mark_delivered(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn set_member_flags(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        flags: MemberFlags,
    ) -> AppResult<()>;
}

/// Binary storage addressed by path
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `path` and return a stable retrievable reference
    async fn put(&self, path: &str, content_type: &str, bytes: Bytes) -> AppResult<String>;

    async fn delete(&self, path: &str) -> AppResult<()>;
}
