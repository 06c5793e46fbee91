//! Core data models used throughout the discovery catalog.
//!
//! These types represent the dataset metadata produced by connectors, the
//! catalog snapshot handed to persistence, and the report returned from a
//! refresh cycle.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConnectorError;

/// Declared field-type map of a dataset (`field name → type name`).
pub type FieldTypes = BTreeMap<String, String>;

/// Snapshot of the catalog keyed by dataset id.
pub type Catalog = BTreeMap<String, DatasetMetadata>;

/// Metadata describing one dataset offered by an external source.
///
/// Serialized as-is into the `data` column of the store. Keys this version
/// does not know about are kept in [`extra`](DatasetMetadata::extra) and
/// written back unchanged on the next save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Stable identifier, `"{source}/{key}"`. See [`dataset_id`].
    pub id: String,
    pub name: String,
    /// Source label of the producing connector (e.g. `"ine:es"`).
    pub source: String,
    pub endpoint: String,
    #[serde(default)]
    pub schema: FieldTypes,
    /// Start time of the refresh cycle that last fetched this entry.
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_frequency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Modification time as reported by the source, when it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Requests per window allowed by the producing connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DatasetMetadata {
    /// Minimal entry; optional fields start empty.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<String>,
        endpoint: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source: source.into(),
            endpoint: endpoint.into(),
            schema: FieldTypes::new(),
            fetched_at,
            description: None,
            tags: Vec::new(),
            update_frequency: None,
            license: None,
            last_updated: None,
            rate_limit: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_schema(mut self, schema: FieldTypes) -> Self {
        self.schema = schema;
        self
    }

    /// True when both entries describe the same dataset, ignoring `fetched_at`.
    pub fn same_content(&self, other: &DatasetMetadata) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.source == other.source
            && self.endpoint == other.endpoint
            && self.schema == other.schema
            && self.description == other.description
            && self.tags == other.tags
            && self.update_frequency == other.update_frequency
            && self.license == other.license
            && self.last_updated == other.last_updated
            && self.rate_limit == other.rate_limit
            && self.extra == other.extra
    }
}

/// Build a dataset id from the connector's source label and the key the
/// source assigns to the dataset.
///
/// When the source provides no key, the endpoint is hashed instead, so the
/// id is still reproducible across refreshes.
pub fn dataset_id(source: &str, key: Option<&str>, endpoint: &str) -> String {
    match key.map(str::trim).filter(|k| !k.is_empty()) {
        Some(k) => format!("{}/{}", source, k),
        None => format!("{}/{}", source, short_hash(endpoint)),
    }
}

/// First 16 hex characters of the SHA-256 digest of `input`.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

/// Result of inserting one entry into the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Content changed.
    Updated,
    /// Same content; only `fetched_at` moved forward.
    Unchanged,
    /// Rejected: the stored entry was fetched later than the incoming one.
    Stale,
}

/// Outcome of one connector within one refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorStatus {
    Succeeded { datasets: usize },
    Failed(ConnectorError),
    /// Not due: every entry from this connector is younger than the TTL.
    Skipped,
}

impl ConnectorStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, ConnectorStatus::Failed(_))
    }

    pub fn label(&self) -> String {
        match self {
            ConnectorStatus::Succeeded { datasets } => format!("ok ({} datasets)", datasets),
            ConnectorStatus::Failed(e) => format!("failed: {}", e),
            ConnectorStatus::Skipped => "skipped (fresh)".to_string(),
        }
    }
}

/// Per-connector line of a [`RefreshReport`].
#[derive(Debug, Clone)]
pub struct ConnectorReport {
    pub source: String,
    pub status: ConnectorStatus,
    pub elapsed: Duration,
}

/// Whether the post-refresh snapshot reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceStatus {
    Saved { rows: usize },
    /// Persistence is disabled or degraded to in-memory mode.
    Disabled,
    Failed(String),
}

/// Summary of one refresh cycle.
#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub connectors: Vec<ConnectorReport>,
    pub persistence: PersistenceStatus,
    pub catalog_size: usize,
    pub elapsed: Duration,
}

impl RefreshReport {
    /// Status of the connector with the given source label.
    pub fn status_of(&self, source: &str) -> Option<&ConnectorStatus> {
        self.connectors
            .iter()
            .find(|c| c.source == source)
            .map(|c| &c.status)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ConnectorReport> {
        self.connectors.iter().filter(|c| c.status.is_failure())
    }

    /// JSON rendering used by `discovery refresh --json`.
    pub fn to_json(&self) -> serde_json::Value {
        let connectors: Vec<serde_json::Value> = self
            .connectors
            .iter()
            .map(|c| {
                let (status, detail) = match &c.status {
                    ConnectorStatus::Succeeded { datasets } => {
                        ("ok", serde_json::json!({ "datasets": datasets }))
                    }
                    ConnectorStatus::Failed(e) => (
                        "failed",
                        serde_json::json!({ "error": e.kind(), "message": e.to_string() }),
                    ),
                    ConnectorStatus::Skipped => ("skipped", serde_json::json!({})),
                };
                serde_json::json!({
                    "source": c.source,
                    "status": status,
                    "detail": detail,
                    "elapsed_ms": c.elapsed.as_millis() as u64,
                })
            })
            .collect();
        let persistence = match &self.persistence {
            PersistenceStatus::Saved { rows } => serde_json::json!({ "status": "saved", "rows": rows }),
            PersistenceStatus::Disabled => serde_json::json!({ "status": "disabled" }),
            PersistenceStatus::Failed(msg) => {
                serde_json::json!({ "status": "failed", "message": msg })
            }
        };
        serde_json::json!({
            "added": self.added,
            "updated": self.updated,
            "unchanged": self.unchanged,
            "catalog_size": self.catalog_size,
            "elapsed_ms": self.elapsed.as_millis() as u64,
            "connectors": connectors,
            "persistence": persistence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_id_prefers_source_key() {
        assert_eq!(
            dataset_id("ine:es", Some("IPC"), "https://x/IPC"),
            "ine:es/IPC"
        );
    }

    #[test]
    fn dataset_id_hashes_endpoint_without_key() {
        let a = dataset_id("climate:cds", None, "https://x/a.nc");
        let b = dataset_id("climate:cds", Some("  "), "https://x/a.nc");
        assert_eq!(a, b);
        assert_eq!(a.len(), "climate:cds/".len() + 16);
        assert_ne!(a, dataset_id("climate:cds", None, "https://x/b.nc"));
    }

    #[test]
    fn unknown_fields_survive_serde() {
        let raw = serde_json::json!({
            "id": "ine:es/IPC",
            "name": "Consumer Price Index",
            "source": "ine:es",
            "endpoint": "https://servicios.ine.es/wstempus/js/ES/DATOS_SERIE/IPC",
            "schema": {"date": "datetime", "value": "float"},
            "fetched_at": "2024-05-01T10:00:00Z",
            "curator": "stats-team",
        });
        let meta: DatasetMetadata = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(meta.extra.get("curator").unwrap(), "stats-team");
        assert_eq!(serde_json::to_value(&meta).unwrap(), raw);
    }

    #[test]
    fn same_content_ignores_fetched_at() {
        let a = DatasetMetadata::new("s/a", "A", "s", "http://a", Utc::now());
        let mut b = a.clone();
        b.fetched_at = a.fetched_at + chrono::Duration::seconds(30);
        assert!(a.same_content(&b));
        b.name = "B".into();
        assert!(!a.same_content(&b));
    }
}
