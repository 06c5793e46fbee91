//! The connector capability and its registry.
//!
//! A connector fetches dataset metadata from one external source. Built-in
//! connectors (INE, AEMET, Eurostat, climate NetCDF) are created from the
//! config file by [`ConnectorRegistry::from_config`]; custom connectors can
//! be added with [`ConnectorRegistry::register`].
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │              ConnectorRegistry             │
//! │  ┌─────┐ ┌───────┐ ┌──────────┐ ┌────────┐ │
//! │  │ INE │ │ AEMET │ │ Eurostat │ │ Custom │ │
//! │  └─────┘ └───────┘ └──────────┘ └────────┘ │
//! └──────────────────┬─────────────────────────┘
//!                    ▼
//!      DiscoveryService::refresh() → catalog
//! ```
//!
//! # Usage
//!
//! ```rust
//! use data_discovery::traits::ConnectorRegistry;
//!
//! let mut connectors = ConnectorRegistry::new();
//! // connectors.register(Box::new(MyConnector::new()))?;
//! assert!(connectors.is_empty());
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{Config, ConnectorConfig};
use crate::error::ConnectorError;
use crate::models::DatasetMetadata;
use crate::rate_limit::RateLimiter;

/// Per-cycle inputs handed to every [`Connector::fetch`] call.
#[derive(Debug, Clone)]
pub struct FetchContext {
    /// Start of the refresh cycle; stamped on every entry as `fetched_at`.
    pub fetched_at: DateTime<Utc>,
    /// Longest a single request may wait for a rate-limiter token.
    pub rate_limit_wait: Duration,
}

impl FetchContext {
    pub fn new(rate_limit_wait: Duration) -> Self {
        Self {
            fetched_at: Utc::now(),
            rate_limit_wait,
        }
    }
}

/// A source of dataset metadata.
///
/// # Contract
///
/// - Acquire a token from [`rate_limiter`](Connector::rate_limiter) before
///   every outbound request.
/// - Return failures as [`ConnectorError`] values; a connector must not
///   panic or otherwise take down sibling connectors.
/// - Derive ids with [`dataset_id`](crate::models::dataset_id) so the same
///   dataset keeps its id across refreshes.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use data_discovery::config::ConnectorConfig;
/// use data_discovery::error::ConnectorError;
/// use data_discovery::models::{dataset_id, DatasetMetadata};
/// use data_discovery::rate_limit::RateLimiter;
/// use data_discovery::traits::{Connector, FetchContext};
///
/// pub struct StaticConnector {
///     config: ConnectorConfig,
///     limiter: RateLimiter,
/// }
///
/// #[async_trait]
/// impl Connector for StaticConnector {
///     fn name(&self) -> &str { "fixtures" }
///     fn description(&self) -> &str { "Fixed list of datasets" }
///     fn config(&self) -> &ConnectorConfig { &self.config }
///     fn rate_limiter(&self) -> &RateLimiter { &self.limiter }
///
///     async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<DatasetMetadata>, ConnectorError> {
///         self.limiter.acquire(ctx.rate_limit_wait).await?;
///         let source = self.source_label();
///         let id = dataset_id(&source, Some("gdp"), "https://example.org/gdp");
///         Ok(vec![DatasetMetadata::new(id, "GDP", source, "https://example.org/gdp", ctx.fetched_at)])
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    /// Instance name from the config table key (e.g. `"es"`).
    fn name(&self) -> &str;

    /// One-line description, shown by `discovery sources`.
    fn description(&self) -> &str;

    /// Source type (`"ine"`, `"aemet"`, `"eurostat"`, `"climate"`, `"custom"`).
    fn connector_type(&self) -> &str {
        "custom"
    }

    /// Label stored in [`DatasetMetadata::source`]: `"{type}:{name}"`.
    fn source_label(&self) -> String {
        format!("{}:{}", self.connector_type(), self.name())
    }

    fn config(&self) -> &ConnectorConfig;

    /// The limiter owned by this connector alone.
    fn rate_limiter(&self) -> &RateLimiter;

    /// List the datasets currently offered by the source.
    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<DatasetMetadata>, ConnectorError>;
}

/// Ordered set of connectors with unique source labels.
pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Create a registry holding every connector instance in the config.
    ///
    /// # Errors
    ///
    /// Fails if an HTTP client cannot be built or an Eurostat
    /// `include_codes` pattern is not a valid glob.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::connector_aemet::AemetConnector;
        use crate::connector_climate::ClimateConnector;
        use crate::connector_eurostat::EurostatConnector;
        use crate::connector_ine::IneConnector;

        let mut registry = Self::new();

        for (name, cfg) in &config.connectors.ine {
            registry.register(Box::new(IneConnector::new(name.clone(), cfg)?))?;
        }
        for (name, cfg) in &config.connectors.aemet {
            registry.register(Box::new(AemetConnector::new(name.clone(), cfg)?))?;
        }
        for (name, cfg) in &config.connectors.eurostat {
            registry.register(Box::new(EurostatConnector::new(name.clone(), cfg)?))?;
        }
        for (name, cfg) in &config.connectors.climate {
            registry.register(Box::new(ClimateConnector::new(name.clone(), cfg)?))?;
        }

        Ok(registry)
    }

    /// Register a connector. Source labels must be unique, since they
    /// prefix every dataset id the connector produces.
    pub fn register(&mut self, connector: Box<dyn Connector>) -> Result<()> {
        let label = connector.source_label();
        if self.connectors.iter().any(|c| c.source_label() == label) {
            bail!("connector '{}' is already registered", label);
        }
        self.connectors.push(Arc::from(connector));
        Ok(())
    }

    pub fn connectors(&self) -> &[Arc<dyn Connector>] {
        &self.connectors
    }

    /// Find a connector by its source label (e.g. `"ine:es"`).
    pub fn find(&self, source_label: &str) -> Option<&Arc<dyn Connector>> {
        self.connectors
            .iter()
            .find(|c| c.source_label() == source_label)
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml_src: &str) -> Config {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn from_config_builds_every_instance_in_order() {
        let cfg = config(
            r#"
            [connectors.ine.es]
            [connectors.eurostat.eu]
            include_codes = ["nama_10_*"]
            [connectors.eurostat.backup]
            "#,
        );
        let registry = ConnectorRegistry::from_config(&cfg).unwrap();
        let labels: Vec<String> = registry
            .connectors()
            .iter()
            .map(|c| c.source_label())
            .collect();
        assert_eq!(labels, vec!["ine:es", "eurostat:backup", "eurostat:eu"]);
        assert!(registry.find("eurostat:eu").is_some());
        assert!(registry.find("aemet:es").is_none());
    }

    #[test]
    fn invalid_include_pattern_is_rejected() {
        let cfg = config(
            r#"
            [connectors.eurostat.eu]
            include_codes = ["nama[10"]
            "#,
        );
        assert!(ConnectorRegistry::from_config(&cfg).is_err());
    }

    #[test]
    fn empty_config_gives_empty_registry() {
        let registry = ConnectorRegistry::from_config(&Config::default()).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }
}
