//! Client configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/tether/config.toml)
//! 3. Environment variables (TETHER_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "TETHER";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for durable state (offline queue, sync checkpoint)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Relay websocket URL
    #[serde(default)]
    pub relay_url: Option<String>,

    /// Local user id, as known to the relay
    #[serde(default)]
    pub user_id: Option<String>,

    /// Auth token (prefer TETHER_TOKEN over persisting this)
    #[serde(default)]
    pub token: Option<String>,

    /// Known contacts, used for presence privacy checks
    #[serde(default)]
    pub contacts: Vec<String>,

    /// Heartbeat cadence on the duplex channel, milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Inactivity window before presence auto-away, milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Read-receipt batching window, milliseconds
    #[serde(default = "default_delivery_batch_window_ms")]
    pub delivery_batch_window_ms: u64,

    /// Reconnect backoff policy
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Typing indicator timings
    #[serde(default)]
    pub typing: TypingConfig,

    /// Offline queue bounds
    #[serde(default)]
    pub queue: QueueConfig,

    /// Sync pass bounds
    #[serde(default)]
    pub sync: SyncConfig,

    /// Presence tracker bounds
    #[serde(default)]
    pub presence: PresenceConfig,
}

/// Reconnect backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
}

/// Typing indicator timings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Quiet period after a keystroke before a start event is emitted
    #[serde(default = "default_typing_debounce_ms")]
    pub debounce_ms: u64,
    /// Minimum spacing between wire emissions per room
    #[serde(default = "default_typing_throttle_ms")]
    pub throttle_ms: u64,
    /// Implicit stop after this long without a keystroke
    #[serde(default = "default_typing_auto_stop_ms")]
    pub auto_stop_ms: u64,
    /// Cleanup tick removing expired inbound records
    #[serde(default = "default_typing_sweep_ms")]
    pub sweep_interval_ms: u64,
}

/// Offline queue bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,
}

/// Sync pass bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Messages per room per diff page
    #[serde(default = "default_sync_batch_size")]
    pub max_batch_size: u32,
    /// Hard timeout for one full pass
    #[serde(default = "default_sync_timeout_ms")]
    pub timeout_ms: u64,
}

/// Presence tracker bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Re-assert own status this often
    #[serde(default = "default_presence_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Record map cap; least-recently-touched entries evict past this
    #[serde(default = "default_presence_max_records")]
    pub max_records: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            relay_url: None,
            user_id: None,
            token: None,
            contacts: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            delivery_batch_window_ms: default_delivery_batch_window_ms(),
            reconnect: ReconnectConfig::default(),
            typing: TypingConfig::default(),
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_reconnect_base_ms(),
            max_delay_ms: default_reconnect_max_ms(),
            max_attempts: default_reconnect_attempts(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_typing_debounce_ms(),
            throttle_ms: default_typing_throttle_ms(),
            auto_stop_ms: default_typing_auto_stop_ms(),
            sweep_interval_ms: default_typing_sweep_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            max_retries: default_queue_max_retries(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_sync_batch_size(),
            timeout_ms: default_sync_timeout_ms(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_presence_heartbeat_ms(),
            max_records: default_presence_max_records(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var(format!("{}_RELAY_URL", ENV_PREFIX)) {
            self.relay_url = if val.is_empty() { None } else { Some(val) };
        }
        if let Ok(val) = std::env::var(format!("{}_USER_ID", ENV_PREFIX)) {
            self.user_id = if val.is_empty() { None } else { Some(val) };
        }
        if let Ok(val) = std::env::var(format!("{}_TOKEN", ENV_PREFIX)) {
            self.token = if val.is_empty() { None } else { Some(val) };
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with TETHER_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
            .join("config.toml")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.timeout_ms)
    }

    /// Backoff policy for reconnect attempts (shared by queue retries)
    pub fn backoff_policy(&self) -> crate::backoff::BackoffPolicy {
        crate::backoff::BackoffPolicy {
            base: Duration::from_millis(self.reconnect.base_delay_ms),
            max: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_delivery_batch_window_ms() -> u64 {
    1_000
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_typing_debounce_ms() -> u64 {
    300
}

fn default_typing_throttle_ms() -> u64 {
    1_000
}

fn default_typing_auto_stop_ms() -> u64 {
    5_000
}

fn default_typing_sweep_ms() -> u64 {
    1_000
}

fn default_queue_max_size() -> usize {
    100
}

fn default_queue_max_retries() -> u32 {
    5
}

fn default_sync_batch_size() -> u32 {
    100
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

fn default_presence_heartbeat_ms() -> u64 {
    30_000
}

fn default_presence_max_records() -> usize {
    512
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap();
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "TETHER_DATA_DIR",
        "TETHER_RELAY_URL",
        "TETHER_USER_ID",
        "TETHER_TOKEN",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.relay_url.is_none());
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert_eq!(config.idle_timeout_ms, 300_000);
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.typing.debounce_ms, 300);
        assert_eq!(config.typing.throttle_ms, 1_000);
        assert_eq!(config.typing.auto_stop_ms, 5_000);
        assert_eq!(config.queue.max_size, 100);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.sync.max_batch_size, 100);
        assert_eq!(config.sync.timeout_ms, 30_000);
        assert!(config.data_dir.ends_with("tether"));
    }

    #[test]
    fn test_env_override_relay_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("TETHER_RELAY_URL", "wss://relay.example.com/socket");
        config.apply_env_overrides();
        assert_eq!(
            config.relay_url,
            Some("wss://relay.example.com/socket".to_string())
        );

        // Empty string clears it
        env::set_var("TETHER_RELAY_URL", "");
        config.apply_env_overrides();
        assert!(config.relay_url.is_none());
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("TETHER_DATA_DIR", "/tmp/tether-test");
        config.apply_env_overrides();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/tether-test"));
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            relay_url = "wss://relay.example.com"
            user_id = "alice"
            heartbeat_interval_ms = 10000

            [reconnect]
            base_delay_ms = 500
            max_attempts = 3

            [typing]
            debounce_ms = 150

            [queue]
            max_size = 10
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.relay_url, Some("wss://relay.example.com".to_string()));
        assert_eq!(config.user_id, Some("alice".to_string()));
        assert_eq!(config.heartbeat_interval_ms, 10_000);
        assert_eq!(config.reconnect.base_delay_ms, 500);
        assert_eq!(config.reconnect.max_attempts, 3);
        // Unspecified nested fields fall back to defaults
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
        assert_eq!(config.typing.debounce_ms, 150);
        assert_eq!(config.typing.auto_stop_ms, 5_000);
        assert_eq!(config.queue.max_size, 10);
        assert_eq!(config.queue.max_retries, 5);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            relay_url: Some("wss://relay.example.com".to_string()),
            user_id: Some("alice".to_string()),
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.relay_url, config.relay_url);
        assert_eq!(parsed.user_id, config.user_id);
        assert_eq!(parsed.queue.max_size, config.queue.max_size);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert!(config.relay_url.is_none());
    }

    #[test]
    fn test_backoff_policy_from_config() {
        let config = Config::default();
        let policy = config.backoff_policy();
        assert_eq!(policy.base, Duration::from_secs(1));
        assert_eq!(policy.max, Duration::from_secs(30));
        assert_eq!(policy.max_attempts, 10);
    }
}
