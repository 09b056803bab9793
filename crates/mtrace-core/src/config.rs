//! Engine configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/mtrace/config.toml)
//! 3. Environment variables (MTRACE_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "MTRACE";

/// Default sync API endpoint
pub const DEFAULT_API_URL: &str = "https://api.millennium-trace.ai/sync";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for local state (SQLite database)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the sync REST API; the push channel URL is derived from it
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Bearer token sent to the remote services
    #[serde(default)]
    pub api_key: Option<String>,

    /// Account whose data is synchronized
    #[serde(default)]
    pub account_id: Option<String>,

    /// Whether the engine talks to the remote service at all
    #[serde(default = "default_true")]
    pub sync_enabled: bool,

    /// Queue and connection tuning
    #[serde(default)]
    pub sync: SyncSettings,

    /// Endpoints of the stateless collaborator services
    #[serde(default)]
    pub services: ServiceEndpoints,
}

/// Tuning knobs for the queue, the push channel and the reconciliation calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Maximum number of queue items delivered per drain cycle
    pub batch_size: usize,
    /// Attempts before an item is abandoned
    pub max_retries: u32,
    /// Delay before the next drain when a cycle leaves items behind
    pub follow_up_delay_ms: u64,
    /// Period of the safety-net drain while online
    pub drain_interval_secs: u64,
    /// Fixed delay between reconnection attempts
    pub reconnect_delay_secs: u64,
    /// Ceiling for the push channel handshake
    pub handshake_timeout_secs: u64,
    /// Per-request timeout for remote calls
    pub request_timeout_secs: u64,
    /// Buffered events per subscriber before the oldest are dropped
    pub event_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            follow_up_delay_ms: 1_000,
            drain_interval_secs: 30,
            reconnect_delay_secs: 5,
            handshake_timeout_secs: 10,
            request_timeout_secs: 15,
            event_capacity: 256,
        }
    }
}

impl SyncSettings {
    pub fn follow_up_delay(&self) -> Duration {
        Duration::from_millis(self.follow_up_delay_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Base URLs of the recognition, scene generation and minting services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEndpoints {
    pub recognition_url: String,
    pub scene_url: String,
    pub nft_url: String,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            recognition_url: "https://api.millennium-trace.ai/recognition".to_string(),
            scene_url: "https://api.millennium-trace.ai/scene".to_string(),
            nft_url: "https://api.millennium-trace.ai/nft".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_url: default_api_url(),
            api_key: None,
            account_id: None,
            sync_enabled: true,
            sync: SyncSettings::default(),
            services: ServiceEndpoints::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (MTRACE_DATA_DIR, MTRACE_API_URL, ...)
    /// 2. Config file (~/.config/mtrace/config.toml or MTRACE_CONFIG)
    /// 3. Default values
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
        config.ensure_data_dir()?;
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

        if let Ok(val) = std::env::var(format!("{}_API_URL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.api_url = val;
            }
        }

        // Empty string clears the key / account
        if let Ok(val) = std::env::var(format!("{}_API_KEY", ENV_PREFIX)) {
            self.api_key = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_ACCOUNT_ID", ENV_PREFIX)) {
            self.account_id = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
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

    /// Set a top-level configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "api_url" => self.api_url = value.to_string(),
            "api_key" => {
                self.api_key = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "account_id" => {
                self.account_id = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "sync_enabled" => {
                self.sync_enabled = value
                    .parse()
                    .with_context(|| format!("Invalid boolean value: {}", value))?
            }
            other => bail!(
                "Unknown config key: {}. Valid keys: data_dir, api_url, api_key, account_id, sync_enabled",
                other
            ),
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with MTRACE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mtrace")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("mtrace.db")
    }

    /// Websocket URL of the push channel for an account
    pub fn push_url(&self, account_id: &str) -> String {
        let base = self.api_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };

        match &self.api_key {
            Some(key) => format!("{}/ws/{}?token={}", base, account_id, key),
            None => format!("{}/ws/{}", base, account_id),
        }
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mtrace")
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_true() -> bool {
    true
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
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
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
        "MTRACE_DATA_DIR",
        "MTRACE_API_URL",
        "MTRACE_API_KEY",
        "MTRACE_ACCOUNT_ID",
        "MTRACE_SYNC_ENABLED",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.sync_enabled);
        assert!(config.api_key.is_none());
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert!(config.data_dir.ends_with("mtrace"));
        assert_eq!(config.sync.batch_size, 10);
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.sync.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_database_path() {
        let config = Config::default();
        assert!(config.database_path().ends_with("mtrace.db"));
    }

    #[test]
    fn test_push_url() {
        let mut config = Config {
            api_url: "https://api.example.com/sync/".to_string(),
            ..Config::default()
        };
        assert_eq!(config.push_url("u1"), "wss://api.example.com/sync/ws/u1");

        config.api_key = Some("secret".to_string());
        config.api_url = "http://localhost:8080/sync".to_string();
        assert_eq!(
            config.push_url("u1"),
            "ws://localhost:8080/sync/ws/u1?token=secret"
        );
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("MTRACE_DATA_DIR", "/tmp/mtrace-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/mtrace-test"));
    }

    #[test]
    fn test_env_override_sync_enabled() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("MTRACE_SYNC_ENABLED", "false");
        config.apply_env_overrides();
        assert!(!config.sync_enabled);

        env::set_var("MTRACE_SYNC_ENABLED", "1");
        config.apply_env_overrides();
        assert!(config.sync_enabled);

        env::set_var("MTRACE_SYNC_ENABLED", "TRUE");
        config.sync_enabled = false;
        config.apply_env_overrides();
        assert!(config.sync_enabled);
    }

    #[test]
    fn test_env_override_api_key() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("MTRACE_API_KEY", "token-1");
        config.apply_env_overrides();
        assert_eq!(config.api_key, Some("token-1".to_string()));

        // Empty string clears it
        env::set_var("MTRACE_API_KEY", "");
        config.apply_env_overrides();
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_set_known_and_unknown_keys() {
        let mut config = Config::default();

        config.set("account_id", "acct-9").unwrap();
        assert_eq!(config.account_id, Some("acct-9".to_string()));

        config.set("sync_enabled", "false").unwrap();
        assert!(!config.sync_enabled);

        assert!(config.set("sync_enabled", "maybe").is_err());
        assert!(config.set("favorite_color", "blue").is_err());
    }

    #[test]
    fn test_load_from_str_with_sync_table() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            api_url = "http://localhost:9000/sync"
            account_id = "acct-1"

            [sync]
            batch_size = 5
            reconnect_delay_secs = 2
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.account_id, Some("acct-1".to_string()));
        assert_eq!(config.sync.batch_size, 5);
        assert_eq!(config.sync.reconnect_delay_secs, 2);
        // Unspecified fields keep their defaults
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.services, ServiceEndpoints::default());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/mtrace"),
            api_key: Some("k".to_string()),
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("[sync]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.api_key, config.api_key);
        assert_eq!(parsed.sync, config.sync);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = tempfile::TempDir::new().unwrap();
        env::set_var("MTRACE_DATA_DIR", temp_dir.path().join("data"));

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert!(config.sync_enabled);
        assert!(config.data_dir.exists());
    }
}
