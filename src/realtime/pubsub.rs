//! Redis pub/sub change feed.
//!
//! Each subscription owns a dedicated pub/sub connection (pub/sub cannot share the
//! multiplexed connection). When the connection drops the listener reconnects with a
//! fixed backoff and emits `FeedEvent::Resync`: pub/sub does not replay what was
//! published during the gap.

use super::events::{conversation_channel, fanout_channels};
use super::{ChangeEvent, ChangeFeed, FeedEvent, Subscription, SubscriptionScope};
use crate::error::AppResult;
use crate::models::TypingSignal;
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::PubSub;
use redis::{Client, RedisResult};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use uuid::Uuid;

/// Publish `event` to the conversation channel and every member's user channel
pub async fn publish_event(redis: &RedisClient, event: &ChangeEvent, members: &[Uuid]) -> AppResult<()> {
    let payload = event.to_json()?;
    for channel in fanout_channels(event, members) {
        redis.publish(&channel, &payload).await?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct RedisChangeFeed {
    redis: RedisClient,
    reconnect: Duration,
}

impl RedisChangeFeed {
    pub fn new(redis: RedisClient, reconnect: Duration) -> Self {
        Self { redis, reconnect }
    }
}

#[async_trait]
impl ChangeFeed for RedisChangeFeed {
    async fn subscribe(&self, scope: SubscriptionScope) -> AppResult<Subscription> {
        let channel = scope.channel();
        let client = self.redis.client().clone();
        let pubsub = open(&client, &channel).await?;
        tracing::debug!(%channel, "subscribed");

        let (tx, rx) = unbounded_channel();
        let listener = tokio::spawn(listen(client, channel, pubsub, tx, self.reconnect));
        Ok(Subscription::new(scope, rx, listener))
    }

    async fn broadcast_typing(&self, signal: TypingSignal) -> AppResult<()> {
        let event = ChangeEvent::TypingChanged { signal };
        self.redis
            .publish(&conversation_channel(signal.conversation_id), &event.to_json()?)
            .await?;
        Ok(())
    }
}

async fn open(client: &Client, channel: &str) -> RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

#[derive(Debug, PartialEq, Eq)]
enum Drained {
    ConnectionLost,
    ReceiverGone,
}

async fn listen(
    client: Client,
    channel: String,
    mut pubsub: PubSub,
    tx: UnboundedSender<FeedEvent>,
    reconnect: Duration,
) {
    loop {
        if drain(&mut pubsub, &channel, &tx).await == Drained::ReceiverGone {
            return;
        }
        tracing::warn!(%channel, "pub/sub connection lost, reconnecting");

        pubsub = loop {
            tokio::time::sleep(reconnect).await;
            if tx.is_closed() {
                return;
            }
            match open(&client, &channel).await {
                Ok(pubsub) => break pubsub,
                Err(e) => tracing::warn!(%channel, error = %e, "pub/sub reconnect failed"),
            }
        };

        tracing::info!(%channel, "pub/sub reconnected");
        if tx.send(FeedEvent::Resync).is_err() {
            return;
        }
    }
}

async fn drain(pubsub: &mut PubSub, channel: &str, tx: &UnboundedSender<FeedEvent>) -> Drained {
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(%channel, error = %e, "unreadable pub/sub payload");
                continue;
            }
        };
        let Some(event) = decode(&payload) else {
            tracing::warn!(%channel, "dropping malformed change event");
            continue;
        };
        if tx.send(event).is_err() {
            return Drained::ReceiverGone;
        }
    }
    Drained::ConnectionLost
}

fn decode(payload: &str) -> Option<FeedEvent> {
    ChangeEvent::from_json(payload).ok().map(FeedEvent::Change)
}
