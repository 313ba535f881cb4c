//! Realtime Sync Integration Tests
//!
//! Purpose: Verify subscription lifecycle and live event routing between sessions
//!
//! Test Coverage:
//! 1. Switching conversations releases the previous message subscription
//! 2. Events from a previously active conversation do not reach the new log
//! 3. Typing indicators appear, clear on send and expire without a stop signal
//! 4. A feed interruption reloads the active log
//! 5. Unread counts stay exact when a resync races buffered message events
//!
//! Run: cargo test --test realtime_sync_test

mod test_harness;

use messaging_core::models::MessageDraft;
use messaging_core::services::delivery_status::DeliveryStatus;
use std::time::Duration;
use test_harness::{bodies, participant, status_of, unread, TestEnvironment, SETTLE};

#[tokio::test]
async fn test_switching_conversations_keeps_one_message_subscription() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let carol = participant("carol");
    let with_bob = env.direct(&alice, &bob).await;
    let with_carol = env.direct(&alice, &carol).await;
    let feed = env.feed();

    let mut a = env.session(&alice).await;
    assert_eq!(feed.listener_count(), 1, "directory subscription only");

    for _ in 0..5 {
        a.select_conversation(with_bob).await.unwrap();
        a.select_conversation(with_carol).await.unwrap();
    }
    assert_eq!(feed.listener_count(), 2);

    a.clear_selection().await.unwrap();
    assert_eq!(feed.listener_count(), 1);

    a.close().await;
    assert_eq!(feed.listener_count(), 0);
}

#[tokio::test]
async fn test_previous_conversation_events_do_not_leak() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let carol = participant("carol");
    let with_bob = env.direct(&alice, &bob).await;
    let with_carol = env.direct(&alice, &carol).await;

    let mut a = env.session(&alice).await;
    a.select_conversation(with_bob).await.unwrap();
    a.select_conversation(with_carol).await.unwrap();

    env.inbound(with_bob, &bob, "for the other thread").await;
    env.inbound(with_carol, &carol, "for this thread").await;

    assert!(a.run_until(SETTLE, |s| unread(s, with_bob) == 1).await);
    assert!(
        a.run_until(SETTLE, |s| bodies(s).contains(&"for this thread".to_string()))
            .await
    );
    a.drain().await;
    assert_eq!(bodies(&a), vec!["for this thread".to_string()]);
    assert_eq!(unread(&a, with_carol), 0);
}

#[tokio::test(start_paused = true)]
async fn test_typing_indicator_expires_after_abrupt_disconnect() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let conv = env.direct(&alice, &bob).await;

    let mut a = env.session(&alice).await;
    let mut b = env.session(&bob).await;
    a.select_conversation(conv).await.unwrap();
    b.select_conversation(conv).await.unwrap();

    a.set_typing(true).await.unwrap();
    assert!(b.run_until(SETTLE, |s| s.typing_users() == vec![alice.user_id]).await);

    // no stop signal: the session simply goes away
    drop(a);

    tokio::time::advance(Duration::from_millis(2_000)).await;
    b.drain().await;
    assert_eq!(b.typing_users(), vec![alice.user_id]);

    tokio::time::advance(Duration::from_millis(1_100)).await;
    b.drain().await;
    assert!(b.typing_users().is_empty());
    assert!(b.view().typing_users.is_empty());
}

#[tokio::test]
async fn test_sending_clears_typing_for_observers() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let conv = env.direct(&alice, &bob).await;

    let mut a = env.session(&alice).await;
    let mut b = env.session(&bob).await;
    a.select_conversation(conv).await.unwrap();
    b.select_conversation(conv).await.unwrap();

    a.set_typing(true).await.unwrap();
    assert!(b.run_until(SETTLE, |s| !s.typing_users().is_empty()).await);

    a.send(MessageDraft::text(conv, "done typing")).await.unwrap();
    let cleared = b
        .run_until(SETTLE, |s| {
            s.typing_users().is_empty() && bodies(s).contains(&"done typing".to_string())
        })
        .await;
    assert!(cleared);
}

#[tokio::test]
async fn test_interrupted_feed_reloads_active_log() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let conv = env.direct(&alice, &bob).await;

    let mut a = env.session(&alice).await;
    a.select_conversation(conv).await.unwrap();

    env.inbound(conv, &bob, "before the drop").await;
    env.feed().interrupt();
    env.inbound(conv, &bob, "after the drop").await;

    let caught_up = a
        .run_until(SETTLE, |s| {
            bodies(s) == vec!["before the drop".to_string(), "after the drop".to_string()]
        })
        .await;
    assert!(caught_up);
    a.drain().await;
    assert_eq!(a.log().map(|l| l.len()), Some(2));
    assert!(!a.view().loading);
    assert_eq!(a.view().error, None);
}

#[tokio::test]
async fn test_unread_survives_resync_without_double_counting() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let conv = env.direct(&alice, &bob).await;

    let mut a = env.session(&alice).await;
    let mut b = env.session(&bob).await;
    b.select_conversation(conv).await.unwrap();

    // the events for x and y queue up behind the resync
    env.feed().interrupt();
    env.inbound(conv, &bob, "x").await;
    env.inbound(conv, &bob, "y").await;

    assert!(a.run_until(SETTLE, |s| unread(s, conv) == 2).await);
    a.drain().await;
    assert_eq!(unread(&a, conv), 2, "snapshot counts must not be recounted");
    assert_eq!(a.view().total_unread, 2);

    env.inbound(conv, &bob, "z").await;
    assert!(a.run_until(SETTLE, |s| unread(s, conv) == 3).await);
    a.drain().await;
    assert_eq!(unread(&a, conv), 3);

    // messages covered by the snapshot are still acknowledged as delivered
    let delivered = b
        .run_until(SETTLE, |s| status_of(s, "y") == Some(DeliveryStatus::Delivered))
        .await;
    assert!(delivered);
}

