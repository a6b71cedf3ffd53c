use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Overrides `home_keyserver_id` when set.
pub const HOME_ID_ENV: &str = "KEYSERVER_CONN_HOME_ID";
/// Overrides `timeouts.ping_frequency_ms` when set.
pub const PING_FREQUENCY_ENV: &str = "KEYSERVER_CONN_PING_FREQUENCY_MS";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// The keyserver that is reset rather than removed on logout.
    #[serde(default = "default_home_keyserver_id")]
    pub home_keyserver_id: String,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Automatic retries after a failed initial sync.
    #[serde(default = "default_initial_sync_retries")]
    pub initial_sync_retries: u32,
    /// Consecutive handshake failures after policy acknowledgment that
    /// trigger crash-loop recovery.
    #[serde(default = "default_policy_failure_threshold")]
    pub policy_failure_threshold: u32,
    /// Capacity of the action and connection event broadcast channels.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Timer settings, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Timeouts {
    #[serde(default = "default_ping_frequency_ms")]
    pub ping_frequency_ms: u64,
    #[serde(default = "default_client_request_visual_timeout_ms")]
    pub client_request_visual_timeout_ms: u64,
    #[serde(default = "default_client_request_socket_timeout_ms")]
    pub client_request_socket_timeout_ms: u64,
    #[serde(default = "default_server_request_socket_timeout_ms")]
    pub server_request_socket_timeout_ms: u64,
    #[serde(default = "default_reconnect_throttle_ms")]
    pub reconnect_throttle_ms: u64,
    #[serde(default = "default_recent_activity_window_ms")]
    pub recent_activity_window_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ping_frequency_ms: default_ping_frequency_ms(),
            client_request_visual_timeout_ms: default_client_request_visual_timeout_ms(),
            client_request_socket_timeout_ms: default_client_request_socket_timeout_ms(),
            server_request_socket_timeout_ms: default_server_request_socket_timeout_ms(),
            reconnect_throttle_ms: default_reconnect_throttle_ms(),
            recent_activity_window_ms: default_recent_activity_window_ms(),
        }
    }
}

impl Timeouts {
    pub fn ping_frequency(&self) -> Duration {
        Duration::from_millis(self.ping_frequency_ms)
    }

    pub fn client_request_visual_timeout(&self) -> Duration {
        Duration::from_millis(self.client_request_visual_timeout_ms)
    }

    pub fn client_request_socket_timeout(&self) -> Duration {
        Duration::from_millis(self.client_request_socket_timeout_ms)
    }

    pub fn server_request_socket_timeout(&self) -> Duration {
        Duration::from_millis(self.server_request_socket_timeout_ms)
    }

    pub fn reconnect_throttle(&self) -> Duration {
        Duration::from_millis(self.reconnect_throttle_ms)
    }

    pub fn recent_activity_window(&self) -> Duration {
        Duration::from_millis(self.recent_activity_window_ms)
    }
}

fn default_home_keyserver_id() -> String {
    "256".to_string()
}

fn default_initial_sync_retries() -> u32 {
    1
}

fn default_policy_failure_threshold() -> u32 {
    2
}

fn default_event_buffer() -> usize {
    256
}

fn default_ping_frequency_ms() -> u64 {
    3_000
}

fn default_client_request_visual_timeout_ms() -> u64 {
    5_000
}

fn default_client_request_socket_timeout_ms() -> u64 {
    10_000
}

fn default_server_request_socket_timeout_ms() -> u64 {
    120_000
}

fn default_reconnect_throttle_ms() -> u64 {
    2_000
}

fn default_recent_activity_window_ms() -> u64 {
    3_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            home_keyserver_id: default_home_keyserver_id(),
            timeouts: Timeouts::default(),
            initial_sync_retries: default_initial_sync_retries(),
            policy_failure_threshold: default_policy_failure_threshold(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl ConnectionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(home) = std::env::var(HOME_ID_ENV) {
            if !home.trim().is_empty() {
                self.home_keyserver_id = home.trim().to_string();
            }
        }
        if let Ok(raw) = std::env::var(PING_FREQUENCY_ENV) {
            self.timeouts.ping_frequency_ms = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of milliseconds", PING_FREQUENCY_ENV))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.home_keyserver_id.is_empty() {
            anyhow::bail!("home_keyserver_id must not be empty");
        }
        let t = &self.timeouts;
        let named = [
            ("ping_frequency_ms", t.ping_frequency_ms),
            ("client_request_visual_timeout_ms", t.client_request_visual_timeout_ms),
            ("client_request_socket_timeout_ms", t.client_request_socket_timeout_ms),
            ("server_request_socket_timeout_ms", t.server_request_socket_timeout_ms),
            ("reconnect_throttle_ms", t.reconnect_throttle_ms),
            ("recent_activity_window_ms", t.recent_activity_window_ms),
        ];
        for (name, value) in named {
            if value == 0 {
                anyhow::bail!("timeouts.{} must be greater than zero", name);
            }
        }
        if t.client_request_visual_timeout_ms >= t.client_request_socket_timeout_ms {
            anyhow::bail!(
                "client_request_visual_timeout_ms ({}) must be shorter than client_request_socket_timeout_ms ({})",
                t.client_request_visual_timeout_ms,
                t.client_request_socket_timeout_ms
            );
        }
        if self.event_buffer == 0 {
            anyhow::bail!("event_buffer must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
