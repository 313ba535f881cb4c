//! Send Reliability Integration Tests
//!
//! Purpose: Verify optimistic sends, reconciliation and failure handling end to end
//!
//! Test Coverage:
//! 1. Rapid sends land on the server in send order
//! 2. A failed send is isolated and can be resent as a new attempt
//! 3. A row landing after the local timeout never turns a failed entry back into sent
//! 4. A stalled upload fails within the send timeout without blocking later sends
//! 5. Attachment validation runs before any upload; valid files are uploaded
//! 6. Duplicate and interleaved reconciliation keeps the log sorted and unique
//!
//! Run: cargo test --test send_reliability_test

mod test_harness;

use chrono::{Duration as ChronoDuration, Utc};
use messaging_core::config::SessionConfig;
use messaging_core::error::{AppError, ValidationError};
use messaging_core::models::{Message, MessageDraft, MessageKind, PendingFile};
use messaging_core::services::delivery_status::DeliveryStatus;
use messaging_core::services::message_log::{MessageLog, ReconcileOutcome};
use messaging_core::services::ChatSession;
use messaging_core::store::RemoteStore;
use std::time::Duration;
use test_harness::{bodies, participant, status_of, TestEnvironment, SETTLE};
use uuid::Uuid;

#[tokio::test]
async fn test_rapid_sends_keep_send_order() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let conv = env.direct(&alice, &bob).await;

    let mut a = env.session(&alice).await;
    a.select_conversation(conv).await.unwrap();

    let expected: Vec<String> = (0..20).map(|i| format!("message {i}")).collect();
    for body in &expected {
        a.send(MessageDraft::text(conv, body.as_str())).await.unwrap();
    }
    assert_eq!(bodies(&a), expected, "optimistic entries keep send order");

    let all_sent = a
        .run_until(SETTLE, |s| {
            s.view()
                .messages
                .iter()
                .all(|m| m.status == Some(DeliveryStatus::Sent))
        })
        .await;
    assert!(all_sent);
    assert_eq!(bodies(&a), expected);

    let rows = env.store.fetch_messages(conv, 100).await.unwrap();
    let server: Vec<String> = rows.into_iter().filter_map(|m| m.body).collect();
    assert_eq!(server, expected);
}

#[tokio::test]
async fn test_failed_send_is_isolated_and_resendable() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let conv = env.direct(&alice, &bob).await;

    let mut a = env.session(&alice).await;
    a.select_conversation(conv).await.unwrap();

    a.send(MessageDraft::text(conv, "first")).await.unwrap();
    assert!(a.run_until(SETTLE, |s| status_of(s, "first") == Some(DeliveryStatus::Sent)).await);

    env.store.set_offline(true);
    let failed_id = a.send(MessageDraft::text(conv, "second")).await.unwrap();
    assert!(
        a.run_until(SETTLE, |s| status_of(s, "second") == Some(DeliveryStatus::Failed))
            .await
    );
    assert!(a.view().error.is_some());
    env.store.set_offline(false);

    a.send(MessageDraft::text(conv, "third")).await.unwrap();
    assert!(a.run_until(SETTLE, |s| status_of(s, "third") == Some(DeliveryStatus::Sent)).await);
    assert_eq!(status_of(&a, "first"), Some(DeliveryStatus::Sent));
    assert_eq!(status_of(&a, "second"), Some(DeliveryStatus::Failed));

    let retry_id = a.resend(failed_id).await.unwrap();
    assert_ne!(retry_id, failed_id);
    assert!(a.log().is_some_and(|log| !log.contains(failed_id)));
    assert!(a.run_until(SETTLE, |s| status_of(s, "second") == Some(DeliveryStatus::Sent)).await);
    assert_eq!(env.store.message_count(conv).await, 3);

    // resending something that is not failed is refused
    let confirmed = a.view().messages[0].message.id;
    assert!(matches!(a.resend(confirmed).await, Err(AppError::Conflict(_))));
}

#[tokio::test(start_paused = true)]
async fn test_late_row_does_not_revive_timed_out_entry() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let conv = env.direct(&alice, &bob).await;

    let config = SessionConfig {
        send_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    };
    let mut a = env.session_with(&alice, config).await;
    a.select_conversation(conv).await.unwrap();

    env.store.set_insert_delay(Some(Duration::from_secs(5)));
    let local_id = a.send(MessageDraft::text(conv, "slow")).await.unwrap();

    let status_of_entry = |s: &ChatSession| {
        s.view()
            .messages
            .into_iter()
            .find(|m| m.message.id == local_id)
            .and_then(|m| m.status)
    };
    let mut seen = vec![status_of_entry(&a)];
    // the write was still in flight and lands later as its own row
    let landed = a
        .run_until(Duration::from_secs(10), |s| {
            let status = status_of_entry(s);
            if seen.last() != Some(&status) {
                seen.push(status);
            }
            s.view().messages.len() == 2
        })
        .await;
    assert!(landed);
    a.drain().await;
    assert_eq!(
        seen,
        vec![Some(DeliveryStatus::Sending), Some(DeliveryStatus::Failed)]
    );
    assert_eq!(status_of_entry(&a), Some(DeliveryStatus::Failed));

    let statuses: Vec<_> = a.view().messages.iter().map(|m| m.status).collect();
    assert!(statuses.contains(&Some(DeliveryStatus::Sent)));

    // resending absorbs the landed row instead of writing a second copy
    let landed_id = a.resend(local_id).await.unwrap();
    assert_ne!(landed_id, local_id);
    a.drain().await;
    assert_eq!(a.log().map(|l| l.len()), Some(1));
    assert!(a.log().is_some_and(|l| l.contains(landed_id)));
    assert_eq!(env.store.message_count(conv).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_upload_fails_within_timeout_and_unblocks_queue() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let conv = env.direct(&alice, &bob).await;

    let config = SessionConfig {
        send_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    };
    let mut a = env.session_with(&alice, config).await;
    a.select_conversation(conv).await.unwrap();

    env.blobs.set_stalled(true);
    let files = vec![PendingFile::new("scan.png", "image/png", vec![5u8; 64])];
    a.send(MessageDraft::text(conv, "with scan").with_files(files))
        .await
        .unwrap();
    a.send(MessageDraft::text(conv, "after scan")).await.unwrap();

    let settled = a
        .run_until(Duration::from_secs(10), |s| {
            status_of(s, "with scan") == Some(DeliveryStatus::Failed)
                && status_of(s, "after scan") == Some(DeliveryStatus::Sent)
        })
        .await;
    assert!(settled);
    assert!(env.blobs.is_empty());
    assert_eq!(env.store.message_count(conv).await, 1);
}

#[tokio::test]
async fn test_oversized_file_rejects_whole_batch_before_upload() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let conv = env.direct(&alice, &bob).await;

    let mut config = SessionConfig::default();
    config.attachment_policy.max_bytes = 1024;
    let mut a = env.session_with(&alice, config).await;
    a.select_conversation(conv).await.unwrap();

    let files = vec![
        PendingFile::new("one.png", "image/png", vec![1u8; 100]),
        PendingFile::new("two.png", "image/png", vec![2u8; 4096]),
        PendingFile::new("three.pdf", "application/pdf", vec![3u8; 100]),
    ];
    let err = a
        .send(MessageDraft::text(conv, "photos").with_files(files))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AppError::Validation(ValidationError::FileTooLarge { ref name, .. }) if name == "two.png"
    ));
    assert!(env.blobs.is_empty(), "nothing may be uploaded");
    assert!(a.view().messages.is_empty());
    assert_eq!(*a.upload_progress().borrow(), None);
}

#[tokio::test]
async fn test_attachments_upload_then_message_confirms() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let conv = env.direct(&alice, &bob).await;

    let mut a = env.session(&alice).await;
    a.select_conversation(conv).await.unwrap();

    let files = vec![
        PendingFile::new("front.jpg", "image/jpeg", vec![7u8; 64]),
        PendingFile::new("back.jpg", "image/jpeg", vec![8u8; 64]),
    ];
    let draft = MessageDraft::text(conv, "").with_files(files);
    a.send(draft).await.unwrap();

    let confirmed = a
        .run_until(SETTLE, |s| {
            s.view()
                .messages
                .first()
                .is_some_and(|m| m.status == Some(DeliveryStatus::Sent))
        })
        .await;
    assert!(confirmed);

    let message = a.view().messages[0].message.clone();
    assert_eq!(message.kind, MessageKind::Image);
    assert_eq!(message.attachments.len(), 2);
    assert_eq!(message.attachments[0].name(), "front.jpg");
    assert_eq!(env.blobs.len(), 2);

    let progress = a.upload_progress().borrow().clone().unwrap();
    assert_eq!(progress.file_count, 2);
    assert_eq!(progress.file_index, 1);
}

#[tokio::test]
async fn test_reply_must_target_confirmed_message() {
    let env = TestEnvironment::new();
    let alice = participant("alice");
    let bob = participant("bob");
    let conv = env.direct(&alice, &bob).await;
    let original = env.inbound(conv, &bob, "question?").await;

    let mut a = env.session(&alice).await;
    a.select_conversation(conv).await.unwrap();
    a.send(MessageDraft::text(conv, "answer").with_reply_to(original.id))
        .await
        .unwrap();
    assert!(a.run_until(SETTLE, |s| status_of(s, "answer") == Some(DeliveryStatus::Sent)).await);

    let pending = a.send(MessageDraft::text(conv, "pending")).await.unwrap();
    let err = a
        .send(MessageDraft::text(conv, "reply to pending").with_reply_to(pending))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(ValidationError::InvalidReply(_))));
}

fn row(conversation_id: Uuid, seconds: i64, body: &str) -> Message {
    Message {
        id: Uuid::new_v4(),
        conversation_id,
        sender_id: Uuid::new_v4(),
        body: Some(body.to_string()),
        kind: MessageKind::Text,
        reply_to: None,
        attachments: vec![],
        client_token: None,
        created_at: Utc::now() + ChronoDuration::seconds(seconds),
        edited_at: None,
        is_deleted: false,
        is_pinned: false,
        local: None,
    }
}

fn assert_sorted_unique(log: &MessageLog) {
    let keys: Vec<_> = log.messages().iter().map(Message::ordering_key).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(keys, sorted);
}

#[test]
fn test_duplicate_reconcile_keeps_one_copy() {
    let conv = Uuid::new_v4();
    let mut log = MessageLog::new(conv);
    let m1 = row(conv, 0, "m1");

    assert_eq!(log.reconcile(m1.clone()), ReconcileOutcome::Inserted);
    let once = log.messages().to_vec();
    assert_eq!(log.reconcile(m1.clone()), ReconcileOutcome::Duplicate);
    assert_eq!(log.messages(), once.as_slice());
    assert_eq!(log.messages().iter().filter(|m| m.id == m1.id).count(), 1);
}

#[test]
fn test_interleaved_appends_and_reconciles_stay_ordered() {
    let conv = Uuid::new_v4();
    let me = Uuid::new_v4();
    let mut log = MessageLog::new(conv);

    // out-of-order server rows mixed with local appends and their confirmations
    let offsets = [5, -3, 12, 0, -7, 8, 3, -1, 20, 6];
    let mut drafts = Vec::new();
    for (i, offset) in offsets.iter().enumerate() {
        let server = row(conv, *offset, &format!("server {i}"));
        log.reconcile(server.clone());
        if i % 3 == 0 {
            log.reconcile(server);
        }
        let draft = MessageDraft::text(conv, format!("local {i}"));
        log.append(me, &draft, false);
        drafts.push(draft);
        assert_sorted_unique(&log);
    }

    for (i, draft) in drafts.iter().enumerate().rev() {
        let mut confirmed = row(conv, -(i as i64), &format!("local {i}"));
        confirmed.sender_id = me;
        confirmed.client_token = Some(draft.client_token);
        assert!(matches!(log.reconcile(confirmed.clone()), ReconcileOutcome::Replaced { .. }));
        assert_eq!(log.reconcile(confirmed), ReconcileOutcome::Duplicate);
        assert_sorted_unique(&log);
    }

    assert_eq!(log.len(), offsets.len() * 2);
    assert!(log.messages().iter().all(Message::is_confirmed));
}
