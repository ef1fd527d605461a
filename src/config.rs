use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChatError, Result};

const CONFIG_DIR_NAME: &str = "portal-chat";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub transport: TransportConfig,
    pub sync: SyncConfig,
}

/// Endpoints and connection-lifecycle tuning for the transport client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub gateway_url: String,
    pub api_base_url: String,
    /// User-directory service used for display-name lookups. Falls back to
    /// `api_base_url` when unset.
    pub directory_url: Option<String>,
    pub max_reconnect_attempts: u32,
    /// Backoff delay is `backoff_base * 2^attempt`.
    pub backoff_base_ms: u64,
    pub liveness_interval_ms: u64,
    /// How long a block or unblock sent over the socket waits for the
    /// gateway's block-status echo before retrying through REST.
    pub block_ack_timeout_ms: u64,
    /// Capacity of the event-bus channels.
    pub event_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            gateway_url: "ws://localhost:3001".to_string(),
            api_base_url: "http://localhost:3000/api/chat".to_string(),
            directory_url: None,
            max_reconnect_attempts: 5,
            backoff_base_ms: 1000,
            liveness_interval_ms: 5000,
            block_ack_timeout_ms: 3000,
            event_buffer: 256,
        }
    }
}

impl TransportConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn block_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.block_ack_timeout_ms)
    }

    pub fn directory_base(&self) -> &str {
        self.directory_url.as_deref().unwrap_or(&self.api_base_url)
    }
}

/// Timing windows used by the conversation synchronizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub history_page_size: u32,
    pub unread_debounce_ms: u64,
    pub typing_idle_ms: u64,
    pub typing_expiry_ms: u64,
    pub duplicate_window_ms: u64,
    pub pending_gc_ms: u64,
    pub confirm_refetch_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            history_page_size: 50,
            unread_debounce_ms: 300,
            typing_idle_ms: 3000,
            typing_expiry_ms: 5000,
            duplicate_window_ms: 5000,
            pending_gc_ms: 10_000,
            confirm_refetch_delay_ms: 500,
        }
    }
}

impl SyncConfig {
    pub fn unread_debounce(&self) -> Duration {
        Duration::from_millis(self.unread_debounce_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }

    pub fn pending_gc(&self) -> Duration {
        Duration::from_millis(self.pending_gc_ms)
    }

    pub fn confirm_refetch_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_refetch_delay_ms)
    }
}

impl ChatConfig {
    /// Load from `path`, else from the per-user config file, else defaults.
    /// Environment variables win over both.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };

        let mut config = match candidate {
            Some(p) if p.exists() => {
                let contents = fs::read_to_string(&p)?;
                let config: ChatConfig = serde_json::from_str(&contents)?;
                info!("Loaded chat configuration from {}", p.display());
                config
            }
            Some(p) if path.is_some() => {
                return Err(ChatError::Config(format!("{} does not exist", p.display())));
            }
            _ => ChatConfig::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CHAT_GATEWAY_URL") {
            self.transport.gateway_url = url;
        }
        if let Some(url) = lookup("CHAT_API_URL") {
            self.transport.api_base_url = url;
        }
        if let Some(url) = lookup("CHAT_DIRECTORY_URL") {
            self.transport.directory_url = Some(url);
        }
    }
}

pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME))
}

fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(CONFIG_FILE_NAME))
}
