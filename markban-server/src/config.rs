/// Configuration for the markban server.
/// Reads server.json from ~/.config/markban/server.json (or platform equivalent).
use std::fs;
use std::path::{Path, PathBuf};

use markban_core::config::{HeartbeatSettings, HistorySettings, WatcherSettings};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Root directory holding one folder per project.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default)]
    pub watcher: WatcherSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    pub history: HistorySettings,
}

fn default_port() -> u16 {
    3001
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_workspace() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("markban")
        .join("workspace")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            workspace: default_workspace(),
            watcher: WatcherSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            history: HistorySettings::default(),
        }
    }
}

/// Default config path: ~/.config/markban/server.json
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("markban")
        .join("server.json")
}

/// Load config from path. Returns defaults if the file doesn't exist or
/// cannot be parsed.
pub fn load_config(path: &Path) -> ServerConfig {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!("Failed to parse config {}: {}", path.display(), e);
            ServerConfig::default()
        }),
        Err(_) => {
            log::info!("No config at {}, using defaults", path.display());
            ServerConfig::default()
        }
    }
}
