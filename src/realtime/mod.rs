//! Realtime synchronization: scoped change subscriptions with guaranteed release.

use crate::error::AppResult;
use crate::models::TypingSignal;
use async_trait::async_trait;
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};
use tokio::task::JoinHandle;

pub mod events;
pub mod pubsub;
pub mod sync;

pub use events::{ChangeEvent, FeedEvent, SubscriptionScope};
pub use sync::{RealtimeSync, SyncEffect, SyncSource};

/// Source of server-pushed changes and sink for ephemeral typing signals
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, scope: SubscriptionScope) -> AppResult<Subscription>;

    async fn broadcast_typing(&self, signal: TypingSignal) -> AppResult<()>;
}

#[derive(Debug, PartialEq)]
pub enum Polled {
    Event(FeedEvent),
    Empty,
    /// The listener stopped for good
    Closed,
}

/// Live subscription handle.
///
/// Owns the background listener. Dropping the handle aborts the listener, so a
/// subscription can never outlive the view that acquired it. `close` additionally
/// waits until the listener has stopped.
pub struct Subscription {
    scope: SubscriptionScope,
    receiver: UnboundedReceiver<FeedEvent>,
    listener: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        scope: SubscriptionScope,
        receiver: UnboundedReceiver<FeedEvent>,
        listener: JoinHandle<()>,
    ) -> Self {
        Self {
            scope,
            receiver,
            listener: Some(listener),
        }
    }

    pub fn scope(&self) -> SubscriptionScope {
        self.scope
    }

    /// Next event; `None` once the listener is gone
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking poll
    pub fn try_recv(&mut self) -> Polled {
        match self.receiver.try_recv() {
            Ok(event) => Polled::Event(event),
            Err(TryRecvError::Empty) => Polled::Empty,
            Err(TryRecvError::Disconnected) => Polled::Closed,
        }
    }

    /// Tear down and wait for the listener to finish
    pub async fn close(mut self) {
        self.receiver.close();
        if let Some(listener) = self.listener.take() {
            listener.abort();
            let _ = listener.await;
        }
        tracing::debug!(scope = ?self.scope, "subscription closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}
