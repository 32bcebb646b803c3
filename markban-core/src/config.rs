/// Tuning knobs shared by the core components and the server config file.
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherSettings {
    /// Debounce window for raw filesystem notifications.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// How long a vanished card waits for a same-slug reappearance before it
    /// is reported as deleted.
    #[serde(default = "default_move_window_ms")]
    pub move_window_ms: u64,
    /// Drop notifications caused by the store's own writes.
    #[serde(default = "default_true")]
    pub suppress_self_writes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySettings {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_move_window_ms() -> u64 {
    500
}

fn default_interval_secs() -> u64 {
    30
}

fn default_pong_timeout_secs() -> u64 {
    10
}

fn default_max_entries() -> usize {
    500
}

fn default_flush_delay_ms() -> u64 {
    1000
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            move_window_ms: default_move_window_ms(),
            suppress_self_writes: true,
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
        }
    }
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            flush_delay_ms: default_flush_delay_ms(),
        }
    }
}

impl WatcherSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn move_window(&self) -> Duration {
        Duration::from_millis(self.move_window_ms)
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

impl HistorySettings {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}
