pub mod attachment;
pub mod conversation;
pub mod message;
pub mod typing;

pub use attachment::{Attachment, PendingFile};
pub use conversation::{
    Conversation, ConversationKind, ConversationPreview, ConversationSnapshot, MemberFlags,
    MemberState, Participant,
};
pub use message::{LocalState, Message, MessageDraft, MessageKind, MessagePatch, NewMessage};
pub use typing::TypingSignal;
