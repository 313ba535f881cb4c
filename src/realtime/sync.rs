//! Subscription lifecycle and event routing.
//!
//! At most one directory subscription and one message subscription are live at any
//! time. Switching conversations closes the old message subscription before the new
//! one is opened, so events from the previous conversation cannot leak into the new
//! log.

use super::{ChangeEvent, ChangeFeed, FeedEvent, Polled, Subscription, SubscriptionScope};
use crate::error::AppResult;
use crate::services::conversation_directory::{ConversationDirectory, RecordOutcome};
use crate::services::delivery_status::ReceiptLedger;
use crate::services::message_log::{MessageLog, ReconcileOutcome};
use crate::services::typing_presence::TypingPresence;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// Which subscription an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    Directory,
    Messages(Uuid),
}

/// Follow-up work that needs the network; the caller runs these after the
/// synchronous state change is visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEffect {
    RefreshDirectory,
    ReloadLog(Uuid),
    AckDelivered {
        conversation_id: Uuid,
        at: DateTime<Utc>,
    },
    MarkRead {
        conversation_id: Uuid,
        at: DateTime<Utc>,
    },
}

pub struct RealtimeSync {
    feed: Arc<dyn ChangeFeed>,
    directory: Option<Subscription>,
    messages: Option<Subscription>,
}

impl RealtimeSync {
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            feed,
            directory: None,
            messages: None,
        }
    }

    pub fn feed(&self) -> &Arc<dyn ChangeFeed> {
        &self.feed
    }

    pub async fn subscribe_directory(&mut self, user_id: Uuid) -> AppResult<()> {
        if let Some(previous) = self.directory.take() {
            previous.close().await;
        }
        let subscription = self
            .feed
            .subscribe(SubscriptionScope::UserConversations { user_id })
            .await?;
        self.directory = Some(subscription);
        Ok(())
    }

    /// Release the current message subscription, then acquire one for `conversation_id`.
    ///
    /// The old subscription is gone even when acquiring the new one fails.
    pub async fn switch_conversation(&mut self, conversation_id: Option<Uuid>) -> AppResult<()> {
        if let Some(previous) = self.messages.take() {
            previous.close().await;
        }
        let Some(conversation_id) = conversation_id else {
            return Ok(());
        };
        let subscription = self
            .feed
            .subscribe(SubscriptionScope::ConversationMessages { conversation_id })
            .await?;
        tracing::debug!(%conversation_id, "message subscription switched");
        self.messages = Some(subscription);
        Ok(())
    }

    /// Conversation the message subscription is bound to
    pub fn active_subscription(&self) -> Option<Uuid> {
        self.messages.as_ref().and_then(|s| match s.scope() {
            SubscriptionScope::ConversationMessages { conversation_id } => Some(conversation_id),
            SubscriptionScope::UserConversations { .. } => None,
        })
    }

    pub fn has_directory_subscription(&self) -> bool {
        self.directory.is_some()
    }

    /// Wait for the next event from either subscription. `None` when nothing is subscribed.
    pub async fn next(&mut self) -> Option<(SyncSource, FeedEvent)> {
        loop {
            if self.directory.is_none() && self.messages.is_none() {
                return None;
            }
            let active = self.active_subscription();
            let (source, event) = tokio::select! {
                event = recv_from(self.directory.as_mut()) => (SyncSource::Directory, event),
                event = recv_from(self.messages.as_mut()) => (messages_source(active), event),
            };
            match event {
                Some(event) => return Some((source, event)),
                None => self.drop_closed(source),
            }
        }
    }

    /// Non-blocking variant of [`next`](Self::next)
    pub fn try_next(&mut self) -> Option<(SyncSource, FeedEvent)> {
        if let Some(subscription) = self.directory.as_mut() {
            match subscription.try_recv() {
                Polled::Event(event) => return Some((SyncSource::Directory, event)),
                Polled::Closed => self.drop_closed(SyncSource::Directory),
                Polled::Empty => {}
            }
        }
        let active = self.active_subscription();
        if let Some(subscription) = self.messages.as_mut() {
            match subscription.try_recv() {
                Polled::Event(event) => return Some((messages_source(active), event)),
                Polled::Closed => self.drop_closed(messages_source(active)),
                Polled::Empty => {}
            }
        }
        None
    }

    pub async fn close(&mut self) {
        if let Some(subscription) = self.messages.take() {
            subscription.close().await;
        }
        if let Some(subscription) = self.directory.take() {
            subscription.close().await;
        }
    }

    fn drop_closed(&mut self, source: SyncSource) {
        tracing::warn!(?source, "subscription listener stopped");
        match source {
            SyncSource::Directory => self.directory = None,
            SyncSource::Messages(_) => self.messages = None,
        }
    }
}

fn messages_source(active: Option<Uuid>) -> SyncSource {
    SyncSource::Messages(active.unwrap_or_else(Uuid::nil))
}

async fn recv_from(subscription: Option<&mut Subscription>) -> Option<FeedEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Local state a feed event is routed into
pub struct SyncTargets<'a> {
    pub directory: &'a mut ConversationDirectory,
    /// Log of the active conversation, if one is selected
    pub log: Option<&'a mut MessageLog>,
    pub ledger: &'a mut ReceiptLedger,
    pub typing: &'a mut TypingPresence,
}

impl SyncTargets<'_> {
    fn active(&self) -> Option<Uuid> {
        self.log.as_ref().map(|log| log.conversation_id())
    }
}

/// Apply one feed event. Every local change happens before this returns; the
/// returned effects are the network follow-ups.
pub fn apply_event(
    source: SyncSource,
    event: FeedEvent,
    targets: &mut SyncTargets<'_>,
    now: Instant,
) -> Vec<SyncEffect> {
    let change = match event {
        FeedEvent::Resync => {
            return match source {
                SyncSource::Directory => vec![SyncEffect::RefreshDirectory],
                SyncSource::Messages(conversation_id) => vec![SyncEffect::ReloadLog(conversation_id)],
            }
        }
        FeedEvent::Change(change) => change,
    };

    let viewer = targets.directory.viewer();
    let active = targets.active();
    let mut effects = Vec::new();

    match change {
        ChangeEvent::MessageInserted { message } => {
            let conversation_id = message.conversation_id;
            let logged = match targets.log.as_deref_mut() {
                Some(log) => log.reconcile(message.clone()),
                None => ReconcileOutcome::Ignored,
            };
            let recorded = targets.directory.record_message(&message, active);
            if recorded == RecordOutcome::UnknownConversation {
                effects.push(SyncEffect::RefreshDirectory);
            }

            let fresh = logged == ReconcileOutcome::Inserted
                || matches!(recorded, RecordOutcome::Counted | RecordOutcome::Recorded);
            if message.sender_id != viewer && fresh {
                targets.typing.clear_user(conversation_id, message.sender_id);
                effects.push(SyncEffect::AckDelivered {
                    conversation_id,
                    at: message.created_at,
                });
                if active == Some(conversation_id) {
                    effects.push(SyncEffect::MarkRead {
                        conversation_id,
                        at: message.created_at,
                    });
                }
            }
        }
        ChangeEvent::MessageUpdated { message } => {
            if let Some(log) = targets.log.as_deref_mut() {
                log.reconcile(message.clone());
            }
            targets.directory.record_message_update(&message);
        }
        ChangeEvent::ConversationUpserted { conversation } => {
            targets.directory.upsert_conversation(conversation);
        }
        ChangeEvent::MemberUpdated { member } => {
            targets.directory.apply_member(&member);
            if active == Some(member.conversation_id) {
                targets.ledger.record(&member);
            }
        }
        ChangeEvent::TypingChanged { signal } => {
            if active == Some(signal.conversation_id) {
                targets.typing.receive(signal, now);
            }
        }
    }
    effects
}
