// Chat data model

use crate::signal::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use web_time::{SystemTime, UNIX_EPOCH};

/// A conversation is either with one user or with a named group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "kebab-case")]
pub enum ConversationKey {
    Direct(String),
    Group(String),
}

impl ConversationKey {
    pub fn name(&self) -> &str {
        match self {
            ConversationKey::Direct(name) | ConversationKey::Group(name) => name,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ConversationKey::Group(_))
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Direct(user) => write!(f, "@{}", user),
            ConversationKey::Group(group) => write!(f, "#{}", group),
        }
    }
}

/// Recorded audio; the bytes are opaque to the client core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceNote {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl VoiceNote {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "kebab-case")]
pub enum MessageContent {
    Text(String),
    Voice(VoiceNote),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: String,
    pub conversation: ConversationKey,
    pub content: MessageContent,
    /// Milliseconds since the Unix epoch, stamped on arrival or send
    pub timestamp_ms: u64,
}

impl ChatMessage {
    pub fn new(from: impl Into<String>, conversation: ConversationKey, content: MessageContent) -> Self {
        Self {
            from: from.into(),
            conversation,
            content,
            timestamp_ms: now_ms(),
        }
    }
}

/// A text message as the chat service stored it, returned by history and
/// pending-message queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub from: String,
    /// A user name for direct messages, the group name otherwise
    pub to: String,
    pub content: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

impl StoredMessage {
    /// Conversation this message belongs to, as seen by `user`
    pub fn conversation_for(&self, user: &str) -> ConversationKey {
        if self.is_group {
            ConversationKey::Group(self.to.clone())
        } else if self.from == user {
            ConversationKey::Direct(self.to.clone())
        } else {
            ConversationKey::Direct(self.from.clone())
        }
    }

    pub fn into_message(self, user: &str) -> ChatMessage {
        let conversation = self.conversation_for(user);
        ChatMessage {
            from: self.from,
            conversation,
            content: MessageContent::Text(self.content),
            timestamp_ms: self.timestamp.unwrap_or_else(now_ms),
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Pushed to a logged-in user by the chat service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatNotification {
    /// `to` is our own name for a direct message, the group name otherwise
    NewMessage {
        from: String,
        to: String,
        text: String,
        is_group: bool,
    },
    VoiceNote {
        from: String,
        to: String,
        note: VoiceNote,
        is_group: bool,
    },
    UserStatusChanged { user: String, online: bool },
    GroupMemberAdded { group: String, user: String },
}

impl ChatNotification {
    /// Conversation an inbound message belongs to, from the receiver's view
    pub fn conversation(&self) -> Option<ConversationKey> {
        match self {
            ChatNotification::NewMessage { from, to, is_group, .. }
            | ChatNotification::VoiceNote { from, to, is_group, .. } => Some(if *is_group {
                ConversationKey::Group(to.clone())
            } else {
                ConversationKey::Direct(from.clone())
            }),
            _ => None,
        }
    }
}

/// UI-facing chat events
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    MessageAdded(ChatMessage),
    PresenceChanged { user: String, online: bool },
    GroupJoined { group: String, user: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("Not logged in")]
    NotLoggedIn,
    #[error("No conversation selected")]
    NoConversation,
    #[error("Message is empty")]
    EmptyMessage,
    #[error(transparent)]
    Transport(#[from] TransportError),
}
