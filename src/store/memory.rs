//! In-process adapters.
//!
//! `MemoryRemoteStore` keeps rows in maps and publishes change events on a broadcast
//! bus, which `MemoryChangeFeed` turns into scoped subscriptions. Used by tests and
//! by the headless client when no database is configured.

use super::{BlobStore, RemoteStore};
use crate::error::{AppError, AppResult, ValidationError};
use crate::models::{
    Conversation, ConversationKind, ConversationSnapshot, MemberFlags, MemberState, Message,
    MessagePatch, NewMessage, Participant, TypingSignal,
};
use crate::realtime::events::{conversation_channel, fanout_channels};
use crate::realtime::{ChangeEvent, ChangeFeed, FeedEvent, Subscription, SubscriptionScope};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum BusItem {
    Event { channel: String, event: ChangeEvent },
    /// Simulated connection loss; every listener emits a resync
    Reset,
}

#[derive(Default)]
struct State {
    conversations: HashMap<Uuid, Conversation>,
    direct_keys: HashMap<String, Uuid>,
    members: HashMap<(Uuid, Uuid), MemberState>,
    /// Per conversation, sorted by `(created_at, id)`
    messages: HashMap<Uuid, Vec<Message>>,
    /// client_token -> message id
    tokens: HashMap<Uuid, Uuid>,
}

impl State {
    fn member_ids(&self, conversation_id: Uuid) -> Vec<Uuid> {
        self.conversations
            .get(&conversation_id)
            .map(|c| c.participants.iter().map(|p| p.user_id).collect())
            .unwrap_or_default()
    }

    fn unread_for(&self, conversation_id: Uuid, user_id: Uuid, last_read_at: Option<DateTime<Utc>>) -> u32 {
        self.messages
            .get(&conversation_id)
            .map(|rows| {
                rows.iter()
                    .filter(|m| m.sender_id != user_id && !m.is_deleted)
                    .filter(|m| last_read_at.map_or(true, |read| m.created_at > read))
                    .count() as u32
            })
            .unwrap_or(0)
    }

    fn find_message(&self, message_id: Uuid) -> Option<&Message> {
        self.messages
            .values()
            .flat_map(|rows| rows.iter())
            .find(|m| m.id == message_id)
    }

    fn find_message_mut(&mut self, message_id: Uuid) -> Option<&mut Message> {
        self.messages
            .values_mut()
            .flat_map(|rows| rows.iter_mut())
            .find(|m| m.id == message_id)
    }

    fn add_conversation(&mut self, conversation: Conversation) {
        for participant in &conversation.participants {
            self.members.insert(
                (conversation.id, participant.user_id),
                MemberState::new(conversation.id, participant.user_id),
            );
        }
        self.messages.entry(conversation.id).or_default();
        self.conversations.insert(conversation.id, conversation);
    }
}

/// Row store held in memory
pub struct MemoryRemoteStore {
    state: RwLock<State>,
    bus: broadcast::Sender<BusItem>,
    offline: Arc<AtomicBool>,
    insert_delay: Mutex<Option<Duration>>,
    listeners: Arc<AtomicUsize>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            bus,
            offline: Arc::new(AtomicBool::new(false)),
            insert_delay: Mutex::new(None),
            listeners: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Change feed wired to this store's writes
    pub fn feed(&self) -> MemoryChangeFeed {
        MemoryChangeFeed {
            bus: self.bus.clone(),
            offline: self.offline.clone(),
            listeners: self.listeners.clone(),
        }
    }

    /// While offline every call fails with a transport error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold every insert for `delay` before committing
    pub fn set_insert_delay(&self, delay: Option<Duration>) {
        *lock(&self.insert_delay) = delay;
    }

    pub async fn message_count(&self, conversation_id: Uuid) -> usize {
        self.state
            .read()
            .await
            .messages
            .get(&conversation_id)
            .map_or(0, Vec::len)
    }

    fn check_online(&self) -> AppResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::Transport("store unreachable".into()));
        }
        Ok(())
    }

    fn publish(&self, event: ChangeEvent, members: &[Uuid]) {
        for channel in fanout_channels(&event, members) {
            // no receivers is fine
            let _ = self.bus.send(BusItem::Event {
                channel,
                event: event.clone(),
            });
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn list_conversations(
        &self,
        user_id: Uuid,
        scope: Option<Uuid>,
    ) -> AppResult<Vec<ConversationSnapshot>> {
        self.check_online()?;
        let state = self.state.read().await;
        let snapshots = state
            .conversations
            .values()
            .filter(|c| c.is_member(user_id))
            .filter(|c| scope.is_none() || c.business_id == scope)
            .filter_map(|c| {
                let mut membership = state.members.get(&(c.id, user_id))?.clone();
                membership.unread_count = state.unread_for(c.id, user_id, membership.last_read_at);
                Some(ConversationSnapshot {
                    conversation: c.clone(),
                    membership,
                })
            })
            .collect();
        Ok(snapshots)
    }

    async fn find_or_create_direct(
        &self,
        scope: Option<Uuid>,
        initiator: Participant,
        recipient: Participant,
    ) -> AppResult<Conversation> {
        self.check_online()?;
        if initiator.user_id == recipient.user_id {
            return Err(AppError::Conflict("cannot start a conversation with yourself".into()));
        }
        let key = Conversation::direct_key(scope, initiator.user_id, recipient.user_id);
        let mut state = self.state.write().await;
        if let Some(existing) = state.direct_keys.get(&key).and_then(|id| state.conversations.get(id)) {
            return Ok(existing.clone());
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Direct,
            business_id: scope,
            name: None,
            participants: vec![initiator, recipient],
            last_message_id: None,
            last_message_preview: None,
            last_message_at: None,
            created_at: Utc::now(),
        };
        state.direct_keys.insert(key, conversation.id);
        state.add_conversation(conversation.clone());
        let members = state.member_ids(conversation.id);
        drop(state);

        self.publish(
            ChangeEvent::ConversationUpserted {
                conversation: conversation.clone(),
            },
            &members,
        );
        Ok(conversation)
    }

    async fn create_group(
        &self,
        scope: Option<Uuid>,
        name: &str,
        members: Vec<Participant>,
    ) -> AppResult<Conversation> {
        self.check_online()?;
        let mut participants: Vec<Participant> = Vec::with_capacity(members.len());
        for member in members {
            if !participants.iter().any(|p| p.user_id == member.user_id) {
                participants.push(member);
            }
        }
        let name = name.trim();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Group,
            business_id: scope,
            name: (!name.is_empty()).then(|| name.to_string()),
            participants,
            last_message_id: None,
            last_message_preview: None,
            last_message_at: None,
            created_at: Utc::now(),
        };
        let mut state = self.state.write().await;
        state.add_conversation(conversation.clone());
        let members = state.member_ids(conversation.id);
        drop(state);

        self.publish(
            ChangeEvent::ConversationUpserted {
                conversation: conversation.clone(),
            },
            &members,
        );
        Ok(conversation)
    }

    async fn fetch_messages(&self, conversation_id: Uuid, limit: usize) -> AppResult<Vec<Message>> {
        self.check_online()?;
        let state = self.state.read().await;
        let rows = state.messages.get(&conversation_id).ok_or(AppError::NotFound)?;
        let skip = rows.len().saturating_sub(limit);
        Ok(rows[skip..].to_vec())
    }

    async fn fetch_members(&self, conversation_id: Uuid) -> AppResult<Vec<MemberState>> {
        self.check_online()?;
        let state = self.state.read().await;
        if !state.conversations.contains_key(&conversation_id) {
            return Err(AppError::NotFound);
        }
        Ok(state
            .members
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn insert_message(&self, message: NewMessage) -> AppResult<Message> {
        let delay = *lock(&self.insert_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_online()?;

        let mut state = self.state.write().await;
        let known = state.tokens.get(&message.client_token).copied();
        if let Some(existing) = known.and_then(|id| state.find_message(id)) {
            return Ok(existing.clone());
        }

        let conversation = state
            .conversations
            .get(&message.conversation_id)
            .ok_or(AppError::NotFound)?;
        if !conversation.is_member(message.sender_id) {
            return Err(AppError::NotFound);
        }
        let rows = state.messages.entry(message.conversation_id).or_default();
        if let Some(reply_to) = message.reply_to {
            if !rows.iter().any(|m| m.id == reply_to) {
                return Err(ValidationError::InvalidReply(reply_to).into());
            }
        }

        // commit order is timestamp order, even within one clock tick
        let now = Utc::now();
        let created_at = match rows.last() {
            Some(tail) if tail.created_at >= now => tail.created_at + chrono::Duration::microseconds(1),
            _ => now,
        };
        let row = Message {
            id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            body: message.body,
            kind: message.kind,
            reply_to: message.reply_to,
            attachments: message.attachments,
            client_token: Some(message.client_token),
            created_at,
            edited_at: None,
            is_deleted: false,
            is_pinned: false,
            local: None,
        };
        let idx = rows.partition_point(|m| m.ordering_key() < row.ordering_key());
        rows.insert(idx, row.clone());
        state.tokens.insert(message.client_token, row.id);

        let conversation = match state.conversations.get_mut(&row.conversation_id) {
            Some(conversation) => {
                conversation.last_message_id = Some(row.id);
                conversation.last_message_at = Some(row.created_at);
                conversation.last_message_preview = Some(row.preview_text());
                conversation.clone()
            }
            None => return Err(AppError::NotFound),
        };
        let members = state.member_ids(row.conversation_id);
        drop(state);

        self.publish(ChangeEvent::MessageInserted { message: row.clone() }, &members);
        self.publish(ChangeEvent::ConversationUpserted { conversation }, &members);
        Ok(row)
    }

    async fn update_message(&self, message_id: Uuid, patch: MessagePatch) -> AppResult<Message> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let row = state.find_message_mut(message_id).ok_or(AppError::NotFound)?;
        match patch {
            MessagePatch::Edit { body, edited_at } => {
                if row.is_deleted {
                    return Err(AppError::NotFound);
                }
                row.body = Some(body);
                row.edited_at = Some(edited_at);
            }
            MessagePatch::SoftDelete => row.tombstone(),
            MessagePatch::Pin(pinned) => row.is_pinned = pinned,
        }
        let row = row.clone();
        if let Some(conversation) = state.conversations.get_mut(&row.conversation_id) {
            if conversation.last_message_id == Some(row.id) {
                conversation.last_message_preview = Some(row.preview_text());
            }
        }
        let members = state.member_ids(row.conversation_id);
        drop(state);

        self.publish(ChangeEvent::MessageUpdated { message: row.clone() }, &members);
        Ok(row)
    }

    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        self.check_online()?;
        self.update_member(conversation_id, user_id, |member| {
            member.last_read_at = Some(member.last_read_at.map_or(at, |current| current.max(at)));
            member.delivered_at = Some(member.delivered_at.map_or(at, |current| current.max(at)));
        })
        .await
    }

    async fn mark_delivered(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.check_online()?;
        self.update_member(conversation_id, user_id, |member| {
            member.delivered_at = Some(member.delivered_at.map_or(at, |current| current.max(at)));
        })
        .await
    }

    async fn set_member_flags(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        flags: MemberFlags,
    ) -> AppResult<()> {
        self.check_online()?;
        self.update_member(conversation_id, user_id, |member| {
            if let Some(archived) = flags.archived {
                member.archived = archived;
            }
            if let Some(muted) = flags.muted {
                member.muted = muted;
            }
        })
        .await
    }
}

impl MemoryRemoteStore {
    async fn update_member(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        apply: impl FnOnce(&mut MemberState),
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        let member = state
            .members
            .get_mut(&(conversation_id, user_id))
            .ok_or(AppError::NotFound)?;
        apply(member);
        let mut member = member.clone();
        member.unread_count = state.unread_for(conversation_id, user_id, member.last_read_at);
        let members = state.member_ids(conversation_id);
        drop(state);

        self.publish(ChangeEvent::MemberUpdated { member }, &members);
        Ok(())
    }
}

/// Change feed backed by the store's broadcast bus
#[derive(Clone)]
pub struct MemoryChangeFeed {
    bus: broadcast::Sender<BusItem>,
    offline: Arc<AtomicBool>,
    listeners: Arc<AtomicUsize>,
}

impl MemoryChangeFeed {
    /// Listener tasks currently alive
    pub fn listener_count(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    /// Simulate a dropped connection: every live subscription yields a resync
    pub fn interrupt(&self) {
        let _ = self.bus.send(BusItem::Reset);
    }
}

struct ListenerGuard(Arc<AtomicUsize>);

impl ListenerGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn subscribe(&self, scope: SubscriptionScope) -> AppResult<Subscription> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::Transport("feed unreachable".into()));
        }
        let channel = scope.channel();
        let mut bus = self.bus.subscribe();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let guard = ListenerGuard::new(self.listeners.clone());

        let listener = tokio::spawn(async move {
            let _guard = guard;
            loop {
                let event = match bus.recv().await {
                    Ok(BusItem::Event { channel: target, event }) if target == channel => {
                        FeedEvent::Change(event)
                    }
                    Ok(BusItem::Event { .. }) => continue,
                    Ok(BusItem::Reset) => FeedEvent::Resync,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%channel, skipped, "feed listener lagged");
                        FeedEvent::Resync
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(scope, rx, listener))
    }

    async fn broadcast_typing(&self, signal: TypingSignal) -> AppResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::Transport("feed unreachable".into()));
        }
        let _ = self.bus.send(BusItem::Event {
            channel: conversation_channel(signal.conversation_id),
            event: ChangeEvent::TypingChanged { signal },
        });
        Ok(())
    }
}

/// Blob store held in memory
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, (String, Bytes)>>,
    fail_patterns: Mutex<Vec<String>>,
    stalled: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put whose path contains `pattern` fail
    pub fn fail_on(&self, pattern: &str) {
        lock(&self.fail_patterns).push(pattern.to_string());
    }

    /// Make every put hang until the caller gives up
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &str) -> bool {
        lock(&self.objects).contains_key(path)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, content_type: &str, bytes: Bytes) -> AppResult<String> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if lock(&self.fail_patterns).iter().any(|p| path.contains(p.as_str())) {
            return Err(AppError::Transport(format!("upload rejected: {path}")));
        }
        lock(&self.objects).insert(path.to_string(), (content_type.to_string(), bytes));
        Ok(format!("memory://{path}"))
    }

    async fn delete(&self, path: &str) -> AppResult<()> {
        lock(&self.objects).remove(path);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
