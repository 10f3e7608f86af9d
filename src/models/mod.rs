pub mod auth;
pub mod conversation;
pub mod file;
pub mod message;

pub use auth::{AuthState, AuthUser};
pub use conversation::{new_conversation_id, Conversation, DEFAULT_TOPIC};
pub use file::{FileDescriptor, StoredFile};
pub use message::{new_message_id, MessageKind, MessageRecord, VersionKey};
