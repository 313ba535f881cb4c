//! One signed-in user's view of the messaging core.
//!
//! `ChatSession` owns the directory, the active conversation's log and receipts,
//! typing state, the realtime subscriptions and the send queue. Every operation
//! applies its local change first and then talks to the network; the presentation
//! layer reads a consistent [`SessionView`] between calls.

use super::attachment_pipeline::{AttachmentPipeline, UploadProgress};
use super::conversation_directory::{ConversationDirectory, RecordOutcome};
use super::delivery_status::{compute_status, DeliveryStatus, ReceiptLedger};
use super::message_log::MessageLog;
use super::outbox::{Outbox, SendJob, SendOutcome};
use super::typing_presence::TypingPresence;
use crate::config::SessionConfig;
use crate::error::{AppError, AppResult, ErrorKind, ValidationError};
use crate::models::{
    ConversationPreview, Message, MessageDraft, MessagePatch, Participant, TypingSignal,
};
use crate::realtime::sync::{apply_event, SyncTargets};
use crate::realtime::{ChangeFeed, FeedEvent, RealtimeSync, SyncEffect, SyncSource};
use crate::store::{BlobStore, RemoteStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// The three collaborators a session is wired to
#[derive(Clone)]
pub struct Backends {
    pub remote: Arc<dyn RemoteStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub blobs: Arc<dyn BlobStore>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    pub message: Message,
    /// Only set for the viewer's own messages
    pub status: Option<DeliveryStatus>,
}

/// Snapshot of everything the presentation layer renders
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub conversations: Vec<ConversationPreview>,
    pub active_conversation: Option<Uuid>,
    pub messages: Vec<MessageView>,
    pub typing_users: Vec<Uuid>,
    pub upload_progress: Option<UploadProgress>,
    pub total_unread: u32,
    pub loading: bool,
    pub error: Option<String>,
}

pub struct ChatSession {
    me: Participant,
    scope: Option<Uuid>,
    config: SessionConfig,
    remote: Arc<dyn RemoteStore>,
    pipeline: Arc<AttachmentPipeline>,
    directory: ConversationDirectory,
    directory_loaded: bool,
    log: Option<MessageLog>,
    log_loaded: bool,
    ledger: ReceiptLedger,
    typing: TypingPresence,
    sync: RealtimeSync,
    outbox: Outbox,
    outcomes: UnboundedReceiver<SendOutcome>,
    /// Drafts behind unconfirmed local entries, kept so a failed send can be resent
    drafts: HashMap<Uuid, MessageDraft>,
    error: Option<String>,
}

impl ChatSession {
    /// Subscribe to the viewer's directory channel and load the conversation list.
    ///
    /// A failed subscription is an error. A failed list load is not: the session
    /// starts empty with the error recorded, and `refresh` can be retried.
    pub async fn start(
        me: Participant,
        scope: Option<Uuid>,
        backends: Backends,
        config: SessionConfig,
    ) -> AppResult<Self> {
        let Backends { remote, feed, blobs } = backends;
        let pipeline = Arc::new(AttachmentPipeline::new(config.attachment_policy.clone(), blobs));
        let (outbox, outcomes) = Outbox::new(
            remote.clone(),
            pipeline.clone(),
            config.send_timeout,
            config.attachment_failure,
        );

        let mut session = Self {
            directory: ConversationDirectory::new(me.user_id, scope, remote.clone()),
            typing: TypingPresence::new(me.user_id, config.typing_ttl),
            me,
            scope,
            config,
            remote,
            pipeline,
            directory_loaded: false,
            log: None,
            log_loaded: false,
            ledger: ReceiptLedger::new(),
            sync: RealtimeSync::new(feed),
            outbox,
            outcomes,
            drafts: HashMap::new(),
            error: None,
        };

        // subscribe before the snapshot so nothing published in between is missed
        session.sync.subscribe_directory(session.me.user_id).await?;
        if let Err(e) = session.refresh().await {
            tracing::warn!(user_id = %session.me.user_id, error = %e, "initial directory load failed");
        }
        tracing::info!(
            user_id = %session.me.user_id,
            conversations = session.directory.len(),
            "session started"
        );
        Ok(session)
    }

    pub fn me(&self) -> &Participant {
        &self.me
    }

    pub fn scope(&self) -> Option<Uuid> {
        self.scope
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    pub fn active_conversation(&self) -> Option<Uuid> {
        self.log.as_ref().map(MessageLog::conversation_id)
    }

    pub fn log(&self) -> Option<&MessageLog> {
        self.log.as_ref()
    }

    pub fn upload_progress(&self) -> watch::Receiver<Option<UploadProgress>> {
        self.pipeline.progress()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Reload the conversation list. On failure the previous list stays.
    pub async fn refresh(&mut self) -> AppResult<()> {
        let result = self.directory.refresh().await;
        self.directory_loaded |= result.is_ok();
        if result.is_ok() {
            // snapshot counts cover messages whose events are then ignored; ack them here
            for (conversation_id, at) in self.directory.pending_delivery() {
                self.ack_delivered(conversation_id, at).await;
            }
        }
        self.note(result)
    }

    /// Make `conversation_id` the active conversation.
    ///
    /// The old message subscription is released and the new one opened before the
    /// history is fetched; events that race the fetch are reconciled afterwards.
    pub async fn select_conversation(&mut self, conversation_id: Uuid) -> AppResult<()> {
        if self.directory.conversation(conversation_id).is_none() {
            return Err(AppError::NotFound);
        }
        self.stop_typing_everywhere().await;

        self.log = Some(MessageLog::new(conversation_id));
        self.log_loaded = false;
        self.ledger = ReceiptLedger::new();
        self.sync.switch_conversation(Some(conversation_id)).await?;

        self.reload_log(conversation_id).await?;
        // a failed read marker is surfaced in the view, the selection still stands
        let at = self.read_watermark(conversation_id);
        let read = self.directory.mark_read(conversation_id, at).await;
        let _ = self.note(read);
        let messages = self.log.as_ref().map_or(0, MessageLog::len);
        tracing::debug!(%conversation_id, messages, "conversation selected");
        Ok(())
    }

    pub async fn clear_selection(&mut self) -> AppResult<()> {
        self.stop_typing_everywhere().await;
        self.log = None;
        self.log_loaded = false;
        self.ledger = ReceiptLedger::new();
        self.sync.switch_conversation(None).await
    }

    /// Queue a message for the active conversation. Returns the id of the optimistic entry.
    pub async fn send(&mut self, draft: MessageDraft) -> AppResult<Uuid> {
        let log = match self.log.as_ref() {
            Some(log) if log.conversation_id() == draft.conversation_id => log,
            _ => return Err(AppError::NotFound),
        };
        if draft.normalized_body().is_none() && draft.files.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        self.pipeline.validate(&draft.files)?;
        if let Some(reply_to) = draft.reply_to {
            if !log.get(reply_to).is_some_and(Message::is_confirmed) {
                return Err(ValidationError::InvalidReply(reply_to).into());
            }
        }

        if let Some(stop) = self.typing.set_typing(draft.conversation_id, false, Instant::now()) {
            self.broadcast_typing(stop).await;
        }

        let Some(log) = self.log.as_mut() else {
            return Err(AppError::NotFound);
        };
        let local = log.append(self.me.user_id, &draft, !draft.files.is_empty());
        self.outbox.enqueue(SendJob {
            local_id: local.id,
            sender_id: self.me.user_id,
            kind: local.kind,
            draft: draft.clone(),
        });
        self.drafts.insert(local.id, draft);
        Ok(local.id)
    }

    /// Send a failed message again as a brand-new attempt with a new token.
    ///
    /// If the timed-out attempt reached the server after all, the failed entry is
    /// dropped and the id of the row that landed is returned; nothing is sent twice.
    pub async fn resend(&mut self, local_id: Uuid) -> AppResult<Uuid> {
        let failed_token = self
            .log
            .as_ref()
            .and_then(|log| log.get(local_id))
            .filter(|m| m.is_failed())
            .and_then(|m| m.client_token);
        let Some(token) = failed_token else {
            return Err(AppError::Conflict("only failed messages can be resent".into()));
        };
        let landed = self
            .log
            .as_ref()
            .and_then(|log| log.confirmed_by_token(token))
            .map(|m| m.id);
        if let Some(message_id) = landed {
            self.drafts.remove(&local_id);
            if let Some(log) = self.log.as_mut() {
                log.remove_local(local_id);
            }
            tracing::debug!(%local_id, %message_id, "failed attempt landed late, not resending");
            return Ok(message_id);
        }

        let draft = self.drafts.remove(&local_id).ok_or(AppError::NotFound)?;
        if let Some(log) = self.log.as_mut() {
            log.remove_local(local_id);
        }
        self.send(draft.resubmit()).await
    }

    /// Drop a failed message without resending it
    pub fn discard_failed(&mut self, local_id: Uuid) -> bool {
        let Some(log) = self.log.as_mut() else {
            return false;
        };
        if !log.get(local_id).is_some_and(Message::is_failed) {
            return false;
        }
        self.drafts.remove(&local_id);
        log.remove_local(local_id).is_some()
    }

    pub async fn edit(&mut self, message_id: Uuid, body: &str) -> AppResult<()> {
        let log = self.log.as_mut().ok_or(AppError::NotFound)?;
        let previous = log.edit(message_id, self.me.user_id, body)?;
        let patch = match log.get(message_id) {
            Some(edited) => MessagePatch::Edit {
                body: edited.body.clone().unwrap_or_default(),
                edited_at: edited.edited_at.unwrap_or_else(Utc::now),
            },
            None => return Err(AppError::NotFound),
        };
        self.push_update(message_id, patch, previous).await
    }

    /// Soft-delete one of the viewer's messages. Deleting twice is a no-op.
    pub async fn delete(&mut self, message_id: Uuid) -> AppResult<()> {
        let log = self.log.as_mut().ok_or(AppError::NotFound)?;
        match log.soft_delete(message_id, self.me.user_id)? {
            Some(previous) => self.push_update(message_id, MessagePatch::SoftDelete, previous).await,
            None => Ok(()),
        }
    }

    pub async fn toggle_pin(&mut self, message_id: Uuid) -> AppResult<()> {
        let log = self.log.as_mut().ok_or(AppError::NotFound)?;
        let previous = log.toggle_pin(message_id)?;
        let patch = MessagePatch::Pin(!previous.is_pinned);
        self.push_update(message_id, patch, previous).await
    }

    pub async fn mark_read(&mut self, conversation_id: Uuid) -> AppResult<()> {
        let at = self.read_watermark(conversation_id);
        let result = self.directory.mark_read(conversation_id, at).await;
        self.note(result)
    }

    pub async fn archive(&mut self, conversation_id: Uuid, archived: bool) -> AppResult<()> {
        let active = self.active_conversation();
        let effect = self.directory.archive(conversation_id, archived, active).await;
        if self.note(effect)?.clear_selection {
            self.clear_selection().await?;
        }
        Ok(())
    }

    pub async fn mute(&mut self, conversation_id: Uuid, muted: bool) -> AppResult<()> {
        let result = self.directory.mute(conversation_id, muted).await;
        self.note(result)
    }

    /// Local composer activity in the active conversation
    pub async fn set_typing(&mut self, is_typing: bool) -> AppResult<()> {
        let conversation_id = self.active_conversation().ok_or(AppError::NotFound)?;
        if let Some(signal) = self.typing.set_typing(conversation_id, is_typing, Instant::now()) {
            self.broadcast_typing(signal).await;
        }
        Ok(())
    }

    pub fn typing_users(&self) -> Vec<Uuid> {
        match self.active_conversation() {
            Some(id) => self.typing.typing_users(id, Instant::now()),
            None => Vec::new(),
        }
    }

    /// Open (or find) the direct conversation with `other`
    pub async fn start_direct(&mut self, other: Participant) -> AppResult<Uuid> {
        if other.user_id == self.me.user_id {
            return Err(AppError::Conflict("cannot start a conversation with yourself".into()));
        }
        let result = self.directory.open_direct(self.me.clone(), other).await;
        self.note(result)
    }

    /// Create a group; the viewer is always a member
    pub async fn create_group(&mut self, name: &str, mut members: Vec<Participant>) -> AppResult<Uuid> {
        if !members.iter().any(|m| m.user_id == self.me.user_id) {
            members.insert(0, self.me.clone());
        }
        let result = self.directory.create_group(name, members).await;
        self.note(result)
    }

    pub async fn start_call(&mut self, _conversation_id: Uuid) -> AppResult<()> {
        Err(AppError::Unsupported("voice and video calls"))
    }

    pub fn search_conversations(&self, term: &str) -> Vec<ConversationPreview> {
        self.directory.search(term)
    }

    pub fn search_messages(&self, term: &str) -> Vec<Message> {
        self.log
            .as_ref()
            .map(|log| log.search(term).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn view(&self) -> SessionView {
        let viewer = self.me.user_id;
        let messages = self
            .log
            .iter()
            .flat_map(|log| log.messages())
            .map(|message| MessageView {
                status: compute_status(message, viewer, &self.ledger),
                message: message.clone(),
            })
            .collect();

        let upload_progress = self.pipeline.progress().borrow().clone();

        SessionView {
            conversations: self.directory.list(self.scope),
            active_conversation: self.active_conversation(),
            messages,
            typing_users: self.typing_users(),
            upload_progress,
            total_unread: self.directory.total_unread(),
            loading: !self.directory_loaded || (self.log.is_some() && !self.log_loaded),
            error: self.error.clone(),
        }
    }

    /// Wait for the next piece of background work (a send result, a feed event or a
    /// typing expiry) and apply it.
    pub async fn run_once(&mut self) {
        let deadline = self.typing.next_deadline();
        tokio::select! {
            Some(outcome) = self.outcomes.recv() => self.apply_outcome(outcome).await,
            Some((source, event)) = self.sync.next() => self.apply_feed(source, event).await,
            _ = sleep_until(deadline) => self.expire_typing().await,
            else => {}
        }
    }

    /// Apply everything that is already waiting, without blocking
    pub async fn drain(&mut self) {
        loop {
            if let Ok(outcome) = self.outcomes.try_recv() {
                self.apply_outcome(outcome).await;
                continue;
            }
            if let Some((source, event)) = self.sync.try_next() {
                self.apply_feed(source, event).await;
                continue;
            }
            break;
        }
        self.expire_typing().await;
    }

    /// Keep running background work until `done` holds or `limit` elapses.
    /// Returns whether `done` held.
    pub async fn run_until<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&ChatSession) -> bool,
    {
        let deadline = Instant::now() + limit;
        loop {
            if done(&*self) {
                return true;
            }
            if tokio::time::timeout_at(deadline, self.run_once()).await.is_err() {
                return done(&*self);
            }
        }
    }

    /// Release subscriptions and announce that the viewer stopped typing
    pub async fn close(&mut self) {
        self.stop_typing_everywhere().await;
        self.sync.close().await;
        tracing::info!(user_id = %self.me.user_id, "session closed");
    }

    async fn apply_outcome(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Confirmed { local_id, message } => {
                self.drafts.remove(&local_id);
                if let Some(log) = self.log.as_mut() {
                    log.reconcile(message.clone());
                }
                let active = self.active_conversation();
                let recorded = self.directory.record_message(&message, active);
                if recorded == RecordOutcome::UnknownConversation {
                    let _ = self.refresh().await;
                }
            }
            SendOutcome::Failed {
                local_id,
                conversation_id,
                error,
            } => {
                let marked = self
                    .log
                    .as_mut()
                    .filter(|log| log.conversation_id() == conversation_id)
                    .is_some_and(|log| log.mark_failed(local_id, error.to_string()));
                if marked {
                    self.error = Some(format!("message not sent: {error}"));
                } else {
                    // already confirmed through the feed, or the conversation was left
                    self.drafts.remove(&local_id);
                }
            }
        }
    }

    async fn apply_feed(&mut self, source: SyncSource, event: FeedEvent) {
        if let SyncSource::Messages(id) = source {
            if self.active_conversation() != Some(id) {
                return;
            }
        }
        let mut targets = SyncTargets {
            directory: &mut self.directory,
            log: self.log.as_mut(),
            ledger: &mut self.ledger,
            typing: &mut self.typing,
        };
        let effects = apply_event(source, event, &mut targets, Instant::now());
        self.forget_confirmed_drafts();

        for effect in effects {
            self.run_effect(effect).await;
        }
    }

    async fn run_effect(&mut self, effect: SyncEffect) {
        match effect {
            SyncEffect::RefreshDirectory => {
                let _ = self.refresh().await;
            }
            SyncEffect::ReloadLog(conversation_id) => {
                if self.active_conversation() == Some(conversation_id) {
                    let _ = self.reload_log(conversation_id).await;
                }
            }
            SyncEffect::AckDelivered { conversation_id, at } => {
                self.ack_delivered(conversation_id, at).await;
            }
            SyncEffect::MarkRead { conversation_id, at } => {
                let result = self.directory.mark_read(conversation_id, at.max(Utc::now())).await;
                let _ = self.note(result);
            }
        }
    }

    async fn ack_delivered(&self, conversation_id: Uuid, at: DateTime<Utc>) {
        let at = at.max(Utc::now());
        if let Err(e) = self.remote.mark_delivered(conversation_id, self.me.user_id, at).await {
            tracing::warn!(%conversation_id, error = %e, "delivery ack failed");
        }
    }

    /// Fetch history and receipts for the active conversation and merge them in,
    /// keeping optimistic entries that have not been confirmed yet.
    async fn reload_log(&mut self, conversation_id: Uuid) -> AppResult<()> {
        let page = self.config.history_page_size;
        let fetched = tokio::try_join!(
            self.remote.fetch_messages(conversation_id, page),
            self.remote.fetch_members(conversation_id),
        );
        let (rows, members) = self.note(fetched)?;

        let Some(log) = self.log.as_mut().filter(|log| log.conversation_id() == conversation_id) else {
            return Ok(());
        };
        log.resync(rows);
        self.ledger = ReceiptLedger::from_members(&members);
        for member in &members {
            self.directory.apply_member(member);
        }
        self.log_loaded = true;
        self.forget_confirmed_drafts();
        Ok(())
    }

    /// Drop drafts whose optimistic entry has been replaced by a confirmed row
    fn forget_confirmed_drafts(&mut self) {
        if self.drafts.is_empty() {
            return;
        }
        let Some(log) = self.log.as_ref() else {
            return;
        };
        let active = log.conversation_id();
        self.drafts
            .retain(|local_id, draft| draft.conversation_id != active || log.contains(*local_id));
    }

    async fn push_update(&mut self, message_id: Uuid, patch: MessagePatch, previous: Message) -> AppResult<()> {
        match self.remote.update_message(message_id, patch).await {
            Ok(row) => {
                if let Some(log) = self.log.as_mut() {
                    log.reconcile(row.clone());
                }
                self.directory.record_message_update(&row);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%message_id, error = %e, "message update rejected, restoring");
                if let Some(log) = self.log.as_mut() {
                    log.restore(previous);
                }
                if e.kind() == ErrorKind::Benign {
                    if let Some(active) = self.active_conversation() {
                        let _ = self.reload_log(active).await;
                    }
                }
                self.note(Err(e))
            }
        }
    }

    async fn expire_typing(&mut self) {
        let now = Instant::now();
        if let Some(stop) = self.typing.poll_local(now) {
            self.broadcast_typing(stop).await;
        }
        self.typing.prune(now);
    }

    async fn stop_typing_everywhere(&mut self) {
        if let Some(stop) = self.typing.clear() {
            self.broadcast_typing(stop).await;
        }
    }

    async fn broadcast_typing(&self, signal: TypingSignal) {
        if let Err(e) = self.sync.feed().broadcast_typing(signal).await {
            tracing::debug!(conversation_id = %signal.conversation_id, error = %e, "typing broadcast failed");
        }
    }

    /// Read marker covering the newest known message even when the local clock lags the server's
    fn read_watermark(&self, conversation_id: Uuid) -> DateTime<Utc> {
        let newest = self
            .directory
            .conversation(conversation_id)
            .and_then(|c| c.last_message_at);
        let in_log = self
            .log
            .as_ref()
            .filter(|log| log.conversation_id() == conversation_id)
            .and_then(|log| log.messages().iter().rev().find(|m| m.is_confirmed()))
            .map(|m| m.created_at);
        let now = Utc::now();
        newest.max(in_log).map_or(now, |at| at.max(now))
    }

    /// Surface transport failures in the view; local errors go to the caller only
    fn note<T>(&mut self, result: AppResult<T>) -> AppResult<T> {
        match &result {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Transport => self.error = Some(e.to_string()),
            Err(_) => {}
        }
        result
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
