//! Chat session manager
//!
//! Text and voice-note conversations with users and groups, presence, and
//! group membership. Calls are placed from a selected direct conversation
//! through [`CallEngine`](crate::CallEngine).

pub mod cache;
pub mod service;
pub mod session;
pub mod types;

pub use cache::MessageCache;
pub use service::ChatService;
pub use session::ChatSession;
pub use types::{
    ChatError, ChatEvent, ChatMessage, ChatNotification, ConversationKey, MessageContent,
    StoredMessage, VoiceNote,
};
