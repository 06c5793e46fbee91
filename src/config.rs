//! TOML configuration parsing and validation.
//!
//! The configuration file (default `./config/discovery.toml`) has four
//! sections:
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `[storage]` | persistent backend switch and connection string |
//! | `[discovery]` | refresh TTL, connector timeout, rate-limiter wait |
//! | `[logging]` | log level and output format |
//! | `[connectors.<type>.<name>]` | one table per connector instance |
//!
//! Every section is optional; an empty file yields a pure in-memory service
//! with no connectors.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// When false the service runs purely in memory.
    #[serde(default)]
    pub persistent_storage_enabled: bool,
    /// `sqlite:` URL or plain path of the catalog database.
    #[serde(default)]
    pub connection_string: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Entries older than this are due for re-fetch.
    #[serde(default = "default_refresh_ttl_secs")]
    pub refresh_ttl_secs: u64,
    #[serde(default = "default_connector_timeout_secs")]
    pub connector_timeout_secs: u64,
    /// Longest a connector waits for a rate-limiter token per request.
    #[serde(default = "default_rate_limit_wait_secs")]
    pub rate_limit_wait_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            refresh_ttl_secs: default_refresh_ttl_secs(),
            connector_timeout_secs: default_connector_timeout_secs(),
            rate_limit_wait_secs: default_rate_limit_wait_secs(),
        }
    }
}

impl DiscoveryConfig {
    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }

    pub fn connector_timeout(&self) -> Duration {
        Duration::from_secs(self.connector_timeout_secs)
    }

    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.rate_limit_wait_secs)
    }
}

fn default_refresh_ttl_secs() -> u64 {
    3600
}
fn default_connector_timeout_secs() -> u64 {
    30
}
fn default_rate_limit_wait_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Connector instances keyed by instance name, one map per source type.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    #[serde(default)]
    pub ine: BTreeMap<String, IneConnectorConfig>,
    #[serde(default)]
    pub aemet: BTreeMap<String, AemetConnectorConfig>,
    #[serde(default)]
    pub eurostat: BTreeMap<String, EurostatConnectorConfig>,
    #[serde(default)]
    pub climate: BTreeMap<String, ClimateConnectorConfig>,
}

impl ConnectorsConfig {
    pub fn is_empty(&self) -> bool {
        self.ine.is_empty()
            && self.aemet.is_empty()
            && self.eurostat.is_empty()
            && self.climate.is_empty()
    }
}

/// Settings every HTTP connector shares. Unset values fall back to the
/// defaults of the connector type (see [`SourceDefaults`]).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourceConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub requests_per_window: Option<u32>,
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// Upper bound on datasets taken from one listing.
    #[serde(default)]
    pub max_datasets: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IneConnectorConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AemetConnectorConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    /// OpenData product paths, relative to the base URL.
    #[serde(default = "default_aemet_products")]
    pub products: Vec<String>,
}

fn default_aemet_products() -> Vec<String> {
    vec![
        "valores/climatologicos/inventarioestaciones/todasestaciones".to_string(),
        "observacion/convencional/todas".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EurostatConnectorConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    /// Glob patterns over dataset codes (e.g. `"nama_10_*"`). Empty keeps all.
    #[serde(default)]
    pub include_codes: Vec<String>,
    /// Fetch JSON-stat dimensions for each dataset to build its schema.
    #[serde(default = "default_true")]
    pub resolve_dimensions: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClimateConnectorConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    /// NetCDF file paths, relative to the base URL.
    #[serde(default)]
    pub files: Vec<String>,
    /// Bytes requested per file; must cover the NetCDF header.
    #[serde(default = "default_header_bytes")]
    pub header_bytes: u64,
}

fn default_header_bytes() -> u64 {
    64 * 1024
}

/// Type-level defaults applied when a [`SourceConfig`] leaves a value unset.
#[derive(Debug, Clone, Copy)]
pub struct SourceDefaults {
    pub base_url: &'static str,
    pub requests_per_window: u32,
    pub window_secs: u64,
    pub api_key_env: Option<&'static str>,
}

/// Fully resolved, immutable settings of one connector instance.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub requests_per_window: u32,
    pub window: Duration,
    pub request_timeout: Duration,
    pub max_datasets: Option<usize>,
}

impl SourceConfig {
    /// Merge with the type defaults and read the API key from the
    /// environment when only `api_key_env` is given.
    pub fn resolve(&self, defaults: SourceDefaults) -> ConnectorConfig {
        let api_key = self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_deref()
                .or(defaults.api_key_env)
                .and_then(|var| std::env::var(var).ok())
                .filter(|v| !v.trim().is_empty())
        });
        ConnectorConfig {
            base_url: self
                .base_url
                .clone()
                .unwrap_or_else(|| defaults.base_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            requests_per_window: self
                .requests_per_window
                .unwrap_or(defaults.requests_per_window),
            window: Duration::from_secs(self.window_secs.unwrap_or(defaults.window_secs)),
            request_timeout: Duration::from_secs(self.request_timeout_secs.unwrap_or(20)),
            max_datasets: self.max_datasets,
        }
    }

    fn validate(&self, label: &str) -> Result<()> {
        if self.requests_per_window == Some(0) {
            bail!("{}: requests_per_window must be > 0", label);
        }
        if self.window_secs == Some(0) {
            bail!("{}: window_secs must be > 0", label);
        }
        if self.request_timeout_secs == Some(0) {
            bail!("{}: request_timeout_secs must be > 0", label);
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Upper bound for every `[discovery]` duration.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Check cross-field constraints that serde cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.storage.persistent_storage_enabled
        && config
            .storage
            .connection_string
            .as_deref()
            .map_or(true, |s| s.trim().is_empty())
    {
        bail!("storage.connection_string is required when persistent_storage_enabled = true");
    }

    if config.discovery.connector_timeout_secs == 0 {
        bail!("discovery.connector_timeout_secs must be > 0");
    }
    for (key, value) in [
        ("refresh_ttl_secs", config.discovery.refresh_ttl_secs),
        ("connector_timeout_secs", config.discovery.connector_timeout_secs),
        ("rate_limit_wait_secs", config.discovery.rate_limit_wait_secs),
    ] {
        if value > MAX_DURATION_SECS {
            bail!("discovery.{} must be <= {} (ten years)", key, MAX_DURATION_SECS);
        }
    }

    for (name, cfg) in &config.connectors.ine {
        cfg.source.validate(&format!("connectors.ine.{}", name))?;
    }
    for (name, cfg) in &config.connectors.aemet {
        cfg.source.validate(&format!("connectors.aemet.{}", name))?;
        if cfg.products.is_empty() {
            bail!("connectors.aemet.{}: products must not be empty", name);
        }
    }
    for (name, cfg) in &config.connectors.eurostat {
        cfg.source.validate(&format!("connectors.eurostat.{}", name))?;
    }
    for (name, cfg) in &config.connectors.climate {
        cfg.source.validate(&format!("connectors.climate.{}", name))?;
        if cfg.files.is_empty() {
            bail!("connectors.climate.{}: files must not be empty", name);
        }
        if cfg.header_bytes < 32 {
            bail!("connectors.climate.{}: header_bytes must be >= 32", name);
        }
    }

    Ok(())
}
