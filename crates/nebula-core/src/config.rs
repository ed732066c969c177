//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/nebula/config.toml)
//! 3. Environment variables (NEBULA_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::ListName;

/// Environment variable prefix
const ENV_PREFIX: &str = "NEBULA";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Directory for local state (persisted session, auth tokens)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Backend base URL, e.g. `https://xyz.supabase.co`
    #[serde(default)]
    pub backend_url: Option<String>,

    /// Public (anon) API key sent with every request
    #[serde(default)]
    pub anon_key: Option<String>,

    /// Realtime websocket URL; derived from `backend_url` when unset
    #[serde(default)]
    pub realtime_url: Option<String>,

    /// Storage bucket for post media
    #[serde(default = "default_storage_bucket")]
    pub storage_bucket: String,

    #[serde(default)]
    pub page_sizes: PageSizes,

    /// How long an UPDATE for an unknown entry waits before its single retry
    #[serde(default = "default_update_retry_delay_ms")]
    pub update_retry_delay_ms: u64,

    /// Capacity of the deferred-update buffer
    #[serde(default = "default_max_deferred_updates")]
    pub max_deferred_updates: usize,

    /// First reconnect delay of realtime channels
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Realtime heartbeat interval
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Log level for nebula crates (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Write logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Page size per paginated list
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PageSizes {
    pub feed: usize,
    pub comments: usize,
    pub notifications: usize,
    pub messages: usize,
    pub communities: usize,
    /// Results per kind on one search page
    pub search: usize,
}

impl Default for PageSizes {
    fn default() -> Self {
        Self {
            feed: 10,
            comments: 20,
            notifications: 20,
            messages: 50,
            communities: 20,
            search: 20,
        }
    }
}

impl PageSizes {
    /// Page size for a list
    pub fn for_list(&self, list: &ListName) -> usize {
        let size = match list {
            ListName::Feed => self.feed,
            ListName::Comments(_) => self.comments,
            ListName::Notifications => self.notifications,
            ListName::Messages(_) => self.messages,
            ListName::Communities => self.communities,
        };
        size.max(1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend_url: None,
            anon_key: None,
            realtime_url: None,
            storage_bucket: default_storage_bucket(),
            page_sizes: PageSizes::default(),
            update_retry_delay_ms: default_update_retry_delay_ms(),
            max_deferred_updates: default_max_deferred_updates(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (NEBULA_DATA_DIR, NEBULA_BACKEND_URL, ...)
    /// 2. Config file (~/.config/nebula/config.toml or NEBULA_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
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

        if let Ok(val) = std::env::var(format!("{}_BACKEND_URL", ENV_PREFIX)) {
            self.backend_url = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_ANON_KEY", ENV_PREFIX)) {
            self.anon_key = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_REALTIME_URL", ENV_PREFIX)) {
            self.realtime_url = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_LOG_LEVEL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.log_level = val;
            }
        }
    }

    /// Set a single key from its string form (`config set`)
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parse_u64 = |v: &str| -> Result<u64> {
            v.parse()
                .with_context(|| format!("Invalid number for {}: {}", key, v))
        };
        let parse_usize = |v: &str| -> Result<usize> {
            v.parse()
                .with_context(|| format!("Invalid number for {}: {}", key, v))
        };

        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "backend_url" => self.backend_url = non_empty(value.to_string()),
            "anon_key" => self.anon_key = non_empty(value.to_string()),
            "realtime_url" => self.realtime_url = non_empty(value.to_string()),
            "storage_bucket" => self.storage_bucket = value.to_string(),
            "log_level" => self.log_level = value.to_string(),
            "log_file" => self.log_file = non_empty(value.to_string()).map(PathBuf::from),
            "update_retry_delay_ms" => self.update_retry_delay_ms = parse_u64(value)?,
            "max_deferred_updates" => self.max_deferred_updates = parse_usize(value)?,
            "reconnect_initial_ms" => self.reconnect_initial_ms = parse_u64(value)?,
            "reconnect_max_ms" => self.reconnect_max_ms = parse_u64(value)?,
            "heartbeat_secs" => self.heartbeat_secs = parse_u64(value)?,
            "page_sizes.feed" => self.page_sizes.feed = parse_usize(value)?,
            "page_sizes.comments" => self.page_sizes.comments = parse_usize(value)?,
            "page_sizes.notifications" => self.page_sizes.notifications = parse_usize(value)?,
            "page_sizes.messages" => self.page_sizes.messages = parse_usize(value)?,
            "page_sizes.communities" => self.page_sizes.communities = parse_usize(value)?,
            "page_sizes.search" => self.page_sizes.search = parse_usize(value)?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with NEBULA_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nebula")
            .join("config.toml")
    }

    /// Path of the persisted session subset
    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    /// Path of the persisted auth tokens
    pub fn auth_session_path(&self) -> PathBuf {
        self.data_dir.join("auth_session.json")
    }

    /// Realtime websocket endpoint
    ///
    /// Uses `realtime_url` when set, otherwise derives it from `backend_url`
    /// (`https://host` becomes `wss://host/realtime/v1`).
    pub fn realtime_endpoint(&self) -> Option<String> {
        if let Some(ref url) = self.realtime_url {
            return Some(url.clone());
        }
        let base = self.backend_url.as_deref()?.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        Some(format!("{}/realtime/v1", ws))
    }

    /// Check if a remote backend is configured
    pub fn has_backend(&self) -> bool {
        self.backend_url.is_some() && self.anon_key.is_some()
    }

    pub fn update_retry_delay(&self) -> Duration {
        Duration::from_millis(self.update_retry_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nebula")
}

fn default_storage_bucket() -> String {
    "posts".to_string()
}

fn default_update_retry_delay_ms() -> u64 {
    2000
}

fn default_max_deferred_updates() -> usize {
    256
}

fn default_reconnect_initial_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_heartbeat_secs() -> u64 {
    25
}

fn default_log_level() -> String {
    "warn".to_string()
}
