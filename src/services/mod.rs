pub mod attachment_pipeline;
pub mod conversation_directory;
pub mod delivery_status;
pub mod message_log;
pub mod outbox;
pub mod session;
pub mod typing_presence;

pub use session::{Backends, ChatSession, MessageView, SessionView};
