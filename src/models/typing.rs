use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ephemeral "is typing" signal. Never persisted; the receiver applies its own expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub is_typing: bool,
}
