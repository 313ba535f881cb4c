//! Delivery status is derived, never stored.
//!
//! Status is a pure function of facts: the local optimistic flag on the message and
//! the delivery/read watermarks of the other members. Watermarks only move forward,
//! which is what makes the computed status monotonic.

use crate::models::{LocalState, MemberState, Message};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// Whether `next` may be observed after `self` for the same message
    pub fn may_advance_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        match (self, next) {
            (Failed, Failed) => true,
            (Failed, _) | (_, Failed) if self != Sending => false,
            (Sending, Failed) => true,
            _ => self.rank() <= next.rank(),
        }
    }

    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Sending | DeliveryStatus::Failed => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Watermarks {
    delivered_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
}

/// Receipt facts for one conversation, keyed by member
#[derive(Debug, Clone, Default)]
pub struct ReceiptLedger {
    members: HashMap<Uuid, Watermarks>,
}

impl ReceiptLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members(members: &[MemberState]) -> Self {
        let mut ledger = Self::new();
        for member in members {
            ledger.record(member);
        }
        ledger
    }

    /// Merge a membership row. Returns true when any watermark advanced.
    pub fn record(&mut self, member: &MemberState) -> bool {
        let delivered = member
            .delivered_at
            .map(|at| self.record_delivered(member.user_id, at))
            .unwrap_or(false);
        let read = member
            .last_read_at
            .map(|at| self.record_read(member.user_id, at))
            .unwrap_or(false);
        delivered || read
    }

    pub fn record_delivered(&mut self, user_id: Uuid, at: DateTime<Utc>) -> bool {
        let entry = self.members.entry(user_id).or_default();
        advance(&mut entry.delivered_at, at)
    }

    /// A read implies delivery up to the same point.
    pub fn record_read(&mut self, user_id: Uuid, at: DateTime<Utc>) -> bool {
        let entry = self.members.entry(user_id).or_default();
        let read = advance(&mut entry.read_at, at);
        let delivered = advance(&mut entry.delivered_at, at);
        read || delivered
    }

    fn any_other(&self, viewer: Uuid, pick: impl Fn(&Watermarks) -> Option<DateTime<Utc>>, at: DateTime<Utc>) -> bool {
        self.members
            .iter()
            .filter(|(user_id, _)| **user_id != viewer)
            .any(|(_, w)| pick(w).is_some_and(|mark| mark >= at))
    }

    pub fn delivered_by_other(&self, viewer: Uuid, at: DateTime<Utc>) -> bool {
        self.any_other(viewer, |w| w.delivered_at, at)
    }

    pub fn read_by_other(&self, viewer: Uuid, at: DateTime<Utc>) -> bool {
        self.any_other(viewer, |w| w.read_at, at)
    }
}

fn advance(slot: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) -> bool {
    match slot {
        Some(current) if *current >= at => false,
        _ => {
            *slot = Some(at);
            true
        }
    }
}

/// Status of `message` as seen by `viewer`. `None` means "not applicable":
/// status is only shown for the viewer's own messages.
pub fn compute_status(message: &Message, viewer: Uuid, receipts: &ReceiptLedger) -> Option<DeliveryStatus> {
    if message.sender_id != viewer {
        return None;
    }

    let status = match &message.local {
        Some(LocalState::Pending) => DeliveryStatus::Sending,
        Some(LocalState::Failed { .. }) => DeliveryStatus::Failed,
        None if receipts.read_by_other(viewer, message.created_at) => DeliveryStatus::Read,
        None if receipts.delivered_by_other(viewer, message.created_at) => DeliveryStatus::Delivered,
        None => DeliveryStatus::Sent,
    };
    Some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;
    use chrono::Duration;

    fn message(sender: Uuid, at: DateTime<Utc>, local: Option<LocalState>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: sender,
            body: Some("hi".into()),
            kind: MessageKind::Text,
            reply_to: None,
            attachments: vec![],
            client_token: None,
            created_at: at,
            edited_at: None,
            is_deleted: false,
            is_pinned: false,
            local,
        }
    }

    #[test]
    fn test_other_senders_have_no_status() {
        let me = Uuid::new_v4();
        let m = message(Uuid::new_v4(), Utc::now(), None);
        assert_eq!(compute_status(&m, me, &ReceiptLedger::new()), None);
    }

    #[test]
    fn test_local_flags_win() {
        let me = Uuid::new_v4();
        let ledger = ReceiptLedger::new();
        let pending = message(me, Utc::now(), Some(LocalState::Pending));
        let failed = message(me, Utc::now(), Some(LocalState::Failed { reason: "x".into() }));
        assert_eq!(compute_status(&pending, me, &ledger), Some(DeliveryStatus::Sending));
        assert_eq!(compute_status(&failed, me, &ledger), Some(DeliveryStatus::Failed));
    }

    #[test]
    fn test_sent_delivered_read_progression() {
        let (me, other) = (Uuid::new_v4(), Uuid::new_v4());
        let t = Utc::now();
        let m = message(me, t, None);
        let mut ledger = ReceiptLedger::new();
        assert_eq!(compute_status(&m, me, &ledger), Some(DeliveryStatus::Sent));

        // an older delivery watermark does not cover this message
        ledger.record_delivered(other, t - Duration::seconds(5));
        assert_eq!(compute_status(&m, me, &ledger), Some(DeliveryStatus::Sent));

        ledger.record_delivered(other, t);
        assert_eq!(compute_status(&m, me, &ledger), Some(DeliveryStatus::Delivered));

        ledger.record_read(other, t + Duration::seconds(1));
        assert_eq!(compute_status(&m, me, &ledger), Some(DeliveryStatus::Read));
    }

    #[test]
    fn test_own_receipts_do_not_count() {
        let me = Uuid::new_v4();
        let t = Utc::now();
        let m = message(me, t, None);
        let mut ledger = ReceiptLedger::new();
        ledger.record_read(me, t + Duration::seconds(10));
        assert_eq!(compute_status(&m, me, &ledger), Some(DeliveryStatus::Sent));
    }

    #[test]
    fn test_watermarks_never_move_backwards() {
        let (me, other) = (Uuid::new_v4(), Uuid::new_v4());
        let t = Utc::now();
        let m = message(me, t, None);
        let mut ledger = ReceiptLedger::new();
        assert!(ledger.record_read(other, t));
        // stale membership row replayed out of order
        assert!(!ledger.record(&MemberState {
            last_read_at: Some(t - Duration::minutes(1)),
            delivered_at: Some(t - Duration::minutes(1)),
            ..MemberState::new(m.conversation_id, other)
        }));
        assert_eq!(compute_status(&m, me, &ledger), Some(DeliveryStatus::Read));
    }

    #[test]
    fn test_edits_do_not_regress_status() {
        let (me, other) = (Uuid::new_v4(), Uuid::new_v4());
        let t = Utc::now();
        let mut m = message(me, t, None);
        let mut ledger = ReceiptLedger::new();
        ledger.record_read(other, t);
        m.body = Some("edited".into());
        m.edited_at = Some(t + Duration::minutes(5));
        assert_eq!(compute_status(&m, me, &ledger), Some(DeliveryStatus::Read));
    }

    #[test]
    fn test_transition_table() {
        use DeliveryStatus::*;
        assert!(Sending.may_advance_to(Sent));
        assert!(Sending.may_advance_to(Failed));
        assert!(Sent.may_advance_to(Read));
        assert!(!Read.may_advance_to(Sent));
        assert!(!Sent.may_advance_to(Failed));
        assert!(!Failed.may_advance_to(Sent));
    }
}
