//! Test Harness Module
//!
//! Provides the shared fixtures for integration tests:
//! - An in-memory backend (row store, change feed, blob store)
//! - Session construction for named participants
//! - Helpers that play the server side or another user's device

#![allow(dead_code)]

use messaging_core::config::SessionConfig;
use messaging_core::models::{Message, MessageKind, NewMessage, Participant};
use messaging_core::services::delivery_status::DeliveryStatus;
use messaging_core::services::{Backends, ChatSession};
use messaging_core::store::memory::{MemoryBlobStore, MemoryChangeFeed, MemoryRemoteStore};
use messaging_core::store::RemoteStore;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound for waiting on background work in a test
pub const SETTLE: Duration = Duration::from_secs(5);

/// Test Environment
pub struct TestEnvironment {
    pub store: Arc<MemoryRemoteStore>,
    pub blobs: Arc<MemoryBlobStore>,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryRemoteStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
        }
    }

    pub fn feed(&self) -> MemoryChangeFeed {
        self.store.feed()
    }

    pub fn backends(&self) -> Backends {
        Backends {
            remote: self.store.clone(),
            feed: Arc::new(self.store.feed()),
            blobs: self.blobs.clone(),
        }
    }

    pub async fn session(&self, who: &Participant) -> ChatSession {
        self.session_with(who, SessionConfig::default()).await
    }

    pub async fn session_with(&self, who: &Participant, config: SessionConfig) -> ChatSession {
        ChatSession::start(who.clone(), None, self.backends(), config)
            .await
            .expect("session should start")
    }

    /// Direct conversation between `a` and `b`, created server-side
    pub async fn direct(&self, a: &Participant, b: &Participant) -> Uuid {
        self.store
            .find_or_create_direct(None, a.clone(), b.clone())
            .await
            .expect("direct conversation")
            .id
    }

    /// A message written by `sender` from some other device
    pub async fn inbound(&self, conversation_id: Uuid, sender: &Participant, body: &str) -> Message {
        self.store
            .insert_message(NewMessage {
                conversation_id,
                sender_id: sender.user_id,
                body: Some(body.to_string()),
                kind: MessageKind::Text,
                reply_to: None,
                attachments: vec![],
                client_token: Uuid::new_v4(),
            })
            .await
            .expect("inbound insert")
    }
}

pub fn participant(name: &str) -> Participant {
    Participant {
        user_id: Uuid::new_v4(),
        display_name: name.to_string(),
    }
}

/// Status of the viewer's own message whose body is `body`
pub fn status_of(session: &ChatSession, body: &str) -> Option<DeliveryStatus> {
    session
        .view()
        .messages
        .into_iter()
        .find(|m| m.message.body.as_deref() == Some(body))
        .and_then(|m| m.status)
}

pub fn unread(session: &ChatSession, conversation_id: Uuid) -> u32 {
    session
        .directory()
        .preview(conversation_id)
        .map_or(0, |p| p.unread_count)
}

pub fn bodies(session: &ChatSession) -> Vec<String> {
    session
        .view()
        .messages
        .into_iter()
        .filter_map(|m| m.message.visible_body().map(str::to_string))
        .collect()
}
