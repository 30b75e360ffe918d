//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/hubsync/config.toml)
//! 3. Environment variables (HUBSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
const ENV_PREFIX: &str = "HUBSYNC";

/// File under the data directory holding a generated host id
const HOST_ID_FILE: &str = "host_id";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the SQLite database and generated host id
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// This node's host id; generated on first use when unset
    #[serde(default)]
    pub host_id: Option<String>,

    /// Must match exactly between the hub and every runner
    #[serde(default = "default_schema_version")]
    pub schema_version: i64,

    /// Rows per pull response or catch-up page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Write logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Unanswered pulls after this long count as a disconnect
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Follow-up pulls per selection while a runner reports more data
    #[serde(default = "default_max_drain_pages")]
    pub max_drain_pages: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_concurrent_requests: default_max_concurrent_requests(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_drain_pages: default_max_drain_pages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Hub WebSocket URL (optional)
    #[serde(default)]
    pub hub_url: Option<String>,

    /// Whether the runner connects to the hub
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_initial_reconnect_delay_ms")]
    pub initial_reconnect_delay_ms: u64,

    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            hub_url: None,
            enabled: true,
            initial_reconnect_delay_ms: default_initial_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            host_id: None,
            schema_version: default_schema_version(),
            page_size: default_page_size(),
            log_file: None,
            hub: HubConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (HUBSYNC_DATA_DIR, HUBSYNC_HOST_ID, HUBSYNC_HUB_URL,
    ///    HUBSYNC_SYNC_ENABLED, HUBSYNC_LISTEN_ADDR)
    /// 2. Config file (~/.config/hubsync/config.toml or HUBSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load from `--config` when given, otherwise from the default location
    pub fn load_with_cli_override(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
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

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_HOST_ID", ENV_PREFIX)) {
            self.host_id = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_HUB_URL", ENV_PREFIX)) {
            self.runner.hub_url = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.runner.enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Ok(val) = std::env::var(format!("{}_LISTEN_ADDR", ENV_PREFIX)) {
            if !val.is_empty() {
                self.hub.listen_addr = val;
            }
        }
    }

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
    /// Can be overridden with HUBSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hubsync")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("hubsync.db")
    }

    pub fn host_id_path(&self) -> PathBuf {
        self.data_dir.join(HOST_ID_FILE)
    }

    /// This node's host id
    ///
    /// Uses the configured id when set. Otherwise reads the id stored in the
    /// data directory, generating and storing `runner-<8 hex>` the first time.
    pub fn resolve_host_id(&self) -> Result<String> {
        if let Some(id) = &self.host_id {
            return Ok(id.clone());
        }

        let path = self.host_id_path();
        if path.exists() {
            let stored = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read host id: {:?}", path))?;
            if let Some(id) = non_empty(stored.trim().to_string()) {
                return Ok(id);
            }
        }

        let id = format!("runner-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        self.ensure_data_dir()?;
        std::fs::write(&path, format!("{}\n", id))
            .with_context(|| format!("Failed to write host id: {:?}", path))?;
        Ok(id)
    }
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hubsync")
}

fn default_schema_version() -> i64 {
    crate::tables::SCHEMA_VERSION
}

fn default_page_size() -> usize {
    1000
}

fn default_listen_addr() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_max_concurrent_requests() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_drain_pages() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_initial_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}
