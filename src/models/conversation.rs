use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// Exactly two participants
    Direct,
    /// Named, N participants
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "group" => ConversationKind::Group,
            _ => ConversationKind::Direct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub business_id: Option<Uuid>,
    /// Set for groups; direct conversations derive their title from the other participant
    pub name: Option<String>,
    pub participants: Vec<Participant>,
    pub last_message_id: Option<Uuid>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_member(&self, user_id: Uuid) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    /// The participant that is not `viewer` (direct conversations only)
    pub fn counterpart(&self, viewer: Uuid) -> Option<&Participant> {
        match self.kind {
            ConversationKind::Direct => self.participants.iter().find(|p| p.user_id != viewer),
            ConversationKind::Group => None,
        }
    }

    pub fn title_for(&self, viewer: Uuid) -> String {
        match self.kind {
            ConversationKind::Group => self.name.clone().unwrap_or_else(|| "Group".to_string()),
            ConversationKind::Direct => self
                .counterpart(viewer)
                .map(|p| p.display_name.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }

    /// Uniqueness key for direct conversations: scope plus the unordered pair
    pub fn direct_key(business_id: Option<Uuid>, a: Uuid, b: Uuid) -> String {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        match business_id {
            Some(scope) => format!("{scope}:{lo}:{hi}"),
            None => format!("-:{lo}:{hi}"),
        }
    }
}

/// One member's view of a conversation: read/delivery watermarks and per-member flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberState {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub last_read_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub unread_count: u32,
}

impl MemberState {
    pub fn new(conversation_id: Uuid, user_id: Uuid) -> Self {
        Self {
            conversation_id,
            user_id,
            last_read_at: None,
            delivered_at: None,
            archived: false,
            muted: false,
            unread_count: 0,
        }
    }
}

/// A conversation together with the requesting user's membership row
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub conversation: Conversation,
    pub membership: MemberState,
}

/// Per-member flag update; `None` leaves a flag untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberFlags {
    pub archived: Option<bool>,
    pub muted: Option<bool>,
}

/// Row handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationPreview {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub business_id: Option<Uuid>,
    pub title: String,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub archived: bool,
    pub muted: bool,
    /// Reserved; always false until pinning conversations exists
    pub pinned: bool,
}
