use super::attachment::{Attachment, PendingFile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What deleted messages render as
pub const TOMBSTONE: &str = "This message was deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::System => "system",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "image" => MessageKind::Image,
            "system" => MessageKind::System,
            _ => MessageKind::Text,
        }
    }
}

/// Client-only state of an optimistic entry. Server rows never carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalState {
    /// Inserted locally, not acknowledged by the server yet
    Pending,
    /// The write failed or timed out; terminal for this attempt
    Failed { reason: String },
}

/// Message row as the core sees it.
///
/// Ordering key is `(created_at, id)`. `client_token` is the correlation token the
/// sending client generated for its optimistic entry; the server echoes it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: Option<String>,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub client_token: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(skip)]
    pub local: Option<LocalState>,
}

impl Message {
    pub fn ordering_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.local, Some(LocalState::Pending))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.local, Some(LocalState::Failed { .. }))
    }

    /// Confirmed by the server (not an optimistic entry)
    pub fn is_confirmed(&self) -> bool {
        self.local.is_none()
    }

    /// Body to render; deleted messages render the tombstone.
    pub fn visible_body(&self) -> Option<&str> {
        if self.is_deleted {
            Some(TOMBSTONE)
        } else {
            self.body.as_deref()
        }
    }

    pub fn visible_attachments(&self) -> &[Attachment] {
        if self.is_deleted {
            &[]
        } else {
            &self.attachments
        }
    }

    /// One-line text for conversation previews
    pub fn preview_text(&self) -> String {
        if self.is_deleted {
            return TOMBSTONE.to_string();
        }
        match (self.body.as_deref(), self.attachments.first()) {
            (Some(body), _) if !body.trim().is_empty() => body.lines().next().unwrap_or("").to_string(),
            (_, Some(attachment)) => format!("[attachment] {}", attachment.name()),
            _ => String::new(),
        }
    }

    /// Clear visible content, keep identity and position.
    pub fn tombstone(&mut self) {
        self.is_deleted = true;
        self.body = None;
        self.attachments.clear();
    }
}

/// What the composer hands to the session.
///
/// `client_token` correlates the optimistic entry with the server's confirmation.
/// A resubmit builds a new draft and therefore a new token.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub conversation_id: Uuid,
    pub client_token: Uuid,
    pub body: Option<String>,
    pub reply_to: Option<Uuid>,
    pub files: Vec<PendingFile>,
}

impl MessageDraft {
    pub fn text(conversation_id: Uuid, body: impl Into<String>) -> Self {
        Self {
            conversation_id,
            client_token: Uuid::new_v4(),
            body: Some(body.into()),
            reply_to: None,
            files: Vec::new(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: Uuid) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_files(mut self, files: Vec<PendingFile>) -> Self {
        self.files = files;
        self
    }

    /// Body with surrounding whitespace stripped; blank bodies count as absent
    pub fn normalized_body(&self) -> Option<String> {
        self.body
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string)
    }

    /// Same content, fresh identity
    pub fn resubmit(&self) -> Self {
        Self {
            client_token: Uuid::new_v4(),
            ..self.clone()
        }
    }
}

/// Row the network layer writes on send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: Option<String>,
    pub kind: MessageKind,
    pub reply_to: Option<Uuid>,
    pub attachments: Vec<Attachment>,
    pub client_token: Uuid,
}

/// Mutations of an existing message row
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePatch {
    Edit {
        body: String,
        edited_at: DateTime<Utc>,
    },
    SoftDelete,
    Pin(bool),
}
