//! Change events pushed by the server.
//!
//! All events use the "object.action" naming convention and serialize as an
//! internally tagged JSON object:
//!
//! ```json
//! { "type": "message.inserted", "message": { ... } }
//! ```

use crate::models::{Conversation, MemberState, Message, TypingSignal};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChangeEvent {
    #[serde(rename = "message.inserted")]
    MessageInserted { message: Message },

    /// Edit, soft delete or pin toggle; carries the full row
    #[serde(rename = "message.updated")]
    MessageUpdated { message: Message },

    #[serde(rename = "conversation.upserted")]
    ConversationUpserted { conversation: Conversation },

    /// Read/delivery watermarks or per-member flags changed
    #[serde(rename = "member.updated")]
    MemberUpdated { member: MemberState },

    /// Ephemeral; never persisted
    #[serde(rename = "typing.changed")]
    TypingChanged { signal: TypingSignal },
}

impl ChangeEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageInserted { .. } => "message.inserted",
            Self::MessageUpdated { .. } => "message.updated",
            Self::ConversationUpserted { .. } => "conversation.upserted",
            Self::MemberUpdated { .. } => "member.updated",
            Self::TypingChanged { .. } => "typing.changed",
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::MessageInserted { message } | Self::MessageUpdated { message } => {
                message.conversation_id
            }
            Self::ConversationUpserted { conversation } => conversation.id,
            Self::MemberUpdated { member } => member.conversation_id,
            Self::TypingChanged { signal } => signal.conversation_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// What a subscription yields
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(ChangeEvent),
    /// The connection dropped and came back; events in the gap are lost, re-fetch a snapshot
    Resync,
}

/// The two subscription scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionScope {
    /// Conversation-level changes for every conversation the user belongs to
    UserConversations { user_id: Uuid },
    /// Message-level changes for a single conversation
    ConversationMessages { conversation_id: Uuid },
}

impl SubscriptionScope {
    pub fn channel(&self) -> String {
        match self {
            Self::UserConversations { user_id } => user_channel(*user_id),
            Self::ConversationMessages { conversation_id } => conversation_channel(*conversation_id),
        }
    }
}

pub fn user_channel(user_id: Uuid) -> String {
    format!("chat:user:{user_id}")
}

pub fn conversation_channel(conversation_id: Uuid) -> String {
    format!("chat:conversation:{conversation_id}")
}

/// Channels an event is published to: the conversation channel for everything,
/// plus each member's user channel for everything except typing.
pub fn fanout_channels(event: &ChangeEvent, members: &[Uuid]) -> Vec<String> {
    let mut channels = vec![conversation_channel(event.conversation_id())];
    if !matches!(event, ChangeEvent::TypingChanged { .. }) {
        channels.extend(members.iter().map(|m| user_channel(*m)));
    }
    channels
}
