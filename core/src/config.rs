// Client configuration
//
// Every field has a default so a partial JSON document (or none at all) is a
// valid configuration.

use crate::media::MediaKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// What to capture when a call starts
    pub media_kind: MediaKind,

    /// How long a call may sit in `Negotiating` before the watchdog ends it
    pub negotiation_timeout_ms: u64,

    /// Remote candidates kept while waiting for the remote description;
    /// anything beyond is dropped with a warning
    pub max_pending_candidates: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            media_kind: MediaKind::Audio,
            negotiation_timeout_ms: 30_000,
            max_pending_candidates: 64,
        }
    }
}

impl CallConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Messages kept per conversation
    pub cache_limit: usize,

    /// MIME type attached to recorded voice notes
    pub voice_note_mime: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            cache_limit: 200,
            voice_note_mime: "audio/webm".to_string(),
        }
    }
}

/// One STUN/TURN server handed to the browser's peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub call: CallConfig,
    pub chat: ChatConfig,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call: CallConfig::default(),
            chat: ChatConfig::default(),
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
