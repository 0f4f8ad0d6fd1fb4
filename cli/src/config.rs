// Configuration management for the parley CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/parley/config.json
// - Linux: ~/.config/parley/config.json
// - Windows: %APPDATA%\parley\config.json

use anyhow::{Context, Result};
use parley_core::{ClientConfig, IceServerConfig, MediaKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings shared with the browser client
    pub client: ClientConfig,

    /// How often the simulator drives the negotiation watchdog
    pub watchdog_tick_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            watchdog_tick_ms: 250,
        }
    }
}

fn parse_media_kind(value: &str) -> Result<MediaKind> {
    match value {
        "audio" => Ok(MediaKind::Audio),
        "audio-video" | "video" => Ok(MediaKind::AudioVideo),
        other => anyhow::bail!("Invalid media kind: {} (expected audio or audio-video)", other),
    }
}

fn media_kind_name(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::AudioVideo => "audio-video",
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("parley");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the platform location, creating the default if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. The caller decides when to save.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "media_kind" => {
                self.client.call.media_kind = parse_media_kind(value)?;
            }
            "negotiation_timeout_ms" => {
                self.client.call.negotiation_timeout_ms =
                    value.parse().context("Invalid number")?;
            }
            "max_pending_candidates" => {
                self.client.call.max_pending_candidates =
                    value.parse().context("Invalid number")?;
            }
            "cache_limit" => {
                self.client.chat.cache_limit = value.parse().context("Invalid number")?;
            }
            "voice_note_mime" => {
                self.client.chat.voice_note_mime = value.to_string();
            }
            "ice_servers" => {
                // Comma-separated STUN URLs; empty clears the list.
                self.client.ice_servers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(IceServerConfig::stun)
                    .collect();
            }
            "watchdog_tick_ms" => {
                let tick: u64 = value.parse().context("Invalid number")?;
                anyhow::ensure!(tick > 0, "watchdog_tick_ms must be positive");
                self.watchdog_tick_ms = tick;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn list(&self) -> Vec<(String, String)> {
        let call = &self.client.call;
        let chat = &self.client.chat;
        let ice_servers = self
            .client
            .ice_servers
            .iter()
            .flat_map(|server| server.urls.iter().cloned())
            .collect::<Vec<_>>()
            .join(",");

        vec![
            ("media_kind".to_string(), media_kind_name(call.media_kind).to_string()),
            ("negotiation_timeout_ms".to_string(), call.negotiation_timeout_ms.to_string()),
            ("max_pending_candidates".to_string(), call.max_pending_candidates.to_string()),
            ("cache_limit".to_string(), chat.cache_limit.to_string()),
            ("voice_note_mime".to_string(), chat.voice_note_mime.clone()),
            ("ice_servers".to_string(), ice_servers),
            ("watchdog_tick_ms".to_string(), self.watchdog_tick_ms.to_string()),
        ]
    }
}
