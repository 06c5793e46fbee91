//! Integration tests for the SQLite catalog store and its use by the
//! service across process "runs" (separate service instances on the same
//! database file).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use data_discovery::config::{Config, ConnectorConfig};
use data_discovery::discovery::DiscoveryService;
use data_discovery::error::{ConnectorError, ServiceError};
use data_discovery::models::{dataset_id, Catalog, DatasetMetadata, PersistenceStatus};
use data_discovery::rate_limit::RateLimiter;
use data_discovery::sqlite_store::SqliteStore;
use data_discovery::store::CatalogStore;
use data_discovery::traits::{Connector, ConnectorRegistry, FetchContext};
use tempfile::TempDir;

struct StaticConnector {
    name: &'static str,
    keys: Vec<&'static str>,
    config: ConnectorConfig,
    limiter: RateLimiter,
}

impl StaticConnector {
    fn new(name: &'static str, keys: Vec<&'static str>) -> Self {
        Self {
            name,
            keys,
            config: ConnectorConfig {
                base_url: "https://data.example.org".into(),
                api_key: None,
                requests_per_window: 10,
                window: Duration::from_secs(60),
                request_timeout: Duration::from_secs(5),
                max_datasets: None,
            },
            limiter: RateLimiter::new(10, Duration::from_secs(60)),
        }
    }
}

#[async_trait]
impl Connector for StaticConnector {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Fixed dataset list"
    }

    fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<DatasetMetadata>, ConnectorError> {
        self.limiter.acquire(ctx.rate_limit_wait).await?;
        let source = self.source_label();
        Ok(self
            .keys
            .iter()
            .map(|key| {
                let endpoint = format!("{}/{}/{}", self.config.base_url, self.name, key);
                DatasetMetadata::new(
                    dataset_id(&source, Some(key), &endpoint),
                    key.to_string(),
                    source.clone(),
                    endpoint,
                    ctx.fetched_at,
                )
            })
            .collect())
    }
}

fn db_url(tmp: &TempDir) -> String {
    format!("sqlite:{}", tmp.path().join("catalog.sqlite").display())
}

fn config(persistent: bool, connection_string: &str) -> Config {
    let mut cfg = Config::default();
    cfg.storage.persistent_storage_enabled = persistent;
    cfg.storage.connection_string = Some(connection_string.to_string());
    cfg.discovery.connector_timeout_secs = 5;
    cfg
}

fn service(cfg: &Config, connectors: Vec<StaticConnector>) -> DiscoveryService {
    let mut registry = ConnectorRegistry::new();
    for c in connectors {
        registry.register(Box::new(c)).unwrap();
    }
    DiscoveryService::new(cfg, registry)
}

fn full_entry() -> DatasetMetadata {
    let mut meta = DatasetMetadata::new(
        "ine:es/IPC",
        "Índice de Precios de Consumo",
        "ine:es",
        "https://servicios.ine.es/wstempus/js/ES/DATOS_SERIE/IPC",
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap(),
    );
    meta.schema.insert("date".into(), "datetime".into());
    meta.schema.insert("value".into(), "float".into());
    meta.description = Some("Monthly consumer prices".into());
    meta.tags = vec!["inflation".into(), "prices".into()];
    meta.update_frequency = Some("monthly".into());
    meta.license = Some("CC BY 4.0".into());
    meta.last_updated = Some(Utc.with_ymd_and_hms(2024, 4, 12, 9, 0, 0).unwrap());
    meta.rate_limit = Some(100);
    meta.extra
        .insert("curator".into(), serde_json::json!({"team": "stats", "since": 2019}));
    meta
}

#[tokio::test]
async fn save_then_load_round_trips_every_field() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&db_url(&tmp)).await.unwrap();

    let mut catalog = Catalog::new();
    let entry = full_entry();
    catalog.insert(entry.id.clone(), entry);
    let minimal = DatasetMetadata::new("s/min", "Minimal", "s", "http://m", Utc::now());
    catalog.insert(minimal.id.clone(), minimal);

    assert_eq!(store.save(&catalog).await.unwrap(), 2);
    store.close().await;

    let reopened = SqliteStore::open(&db_url(&tmp)).await.unwrap();
    assert_eq!(reopened.load().await.unwrap(), catalog);
    reopened.close().await;
}

#[tokio::test]
async fn unreadable_rows_are_skipped() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&db_url(&tmp)).await.unwrap();

    let mut catalog = Catalog::new();
    let entry = full_entry();
    catalog.insert(entry.id.clone(), entry);
    store.save(&catalog).await.unwrap();

    sqlx::query("INSERT INTO dataset_catalog (id, data) VALUES (?, ?), (?, ?)")
        .bind("broken/json")
        .bind("{\"id\": \"broken/json\", ")
        .bind("wrong/id")
        .bind(r#"{"id":"other/id","name":"X","source":"s","endpoint":"e","fetched_at":"2024-01-01T00:00:00Z"}"#)
        .execute(store.pool())
        .await
        .unwrap();

    let loaded = store.load().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(loaded.contains_key("ine:es/IPC"));
    store.close().await;
}

#[tokio::test]
async fn refresh_saves_and_next_run_loads() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(true, &db_url(&tmp));

    let first = service(&cfg, vec![StaticConnector::new("a", vec!["1", "2"])]);
    first.open().await.unwrap();
    let report = first.refresh().await.unwrap();
    assert_eq!(report.persistence, PersistenceStatus::Saved { rows: 2 });
    let saved = first.all().unwrap();
    first.close().await;

    let second = service(&cfg, Vec::new());
    second.open().await.unwrap();
    assert_eq!(second.all().unwrap(), saved);
    assert_eq!(second.get("custom:a/1").unwrap().name, "1");
    second.close().await;
}

#[tokio::test]
async fn disabling_persistence_for_a_run_keeps_saved_catalog() {
    let tmp = TempDir::new().unwrap();
    let url = db_url(&tmp);

    let run1 = service(&config(true, &url), vec![StaticConnector::new("a", vec!["1", "2"])]);
    run1.open().await.unwrap();
    run1.refresh().await.unwrap();
    let saved = run1.all().unwrap();
    run1.close().await;

    let run2 = service(&config(false, &url), vec![StaticConnector::new("b", vec!["9"])]);
    run2.open().await.unwrap();
    assert!(run2.search("").unwrap().is_empty());
    let report = run2.refresh().await.unwrap();
    assert_eq!(report.persistence, PersistenceStatus::Disabled);
    run2.close().await;

    let run3 = service(&config(true, &url), Vec::new());
    run3.open().await.unwrap();
    assert_eq!(run3.all().unwrap(), saved);
    run3.close().await;
}

#[tokio::test]
async fn unreachable_store_degrades_to_memory() {
    let tmp = TempDir::new().unwrap();
    // A regular file where the database directory should be.
    let blocker = tmp.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let url = format!("sqlite:{}", blocker.join("catalog.sqlite").display());

    let svc = service(&config(true, &url), vec![StaticConnector::new("a", vec!["1"])]);
    svc.open().await.unwrap();
    let report = svc.refresh().await.unwrap();

    assert_eq!(report.persistence, PersistenceStatus::Disabled);
    assert_eq!(svc.search("").unwrap().len(), 1);
    svc.close().await;
}

#[tokio::test]
async fn removed_dataset_stays_gone_after_restart() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(true, &db_url(&tmp));

    let first = service(&cfg, vec![StaticConnector::new("a", vec!["1", "2"])]);
    first.open().await.unwrap();
    first.refresh().await.unwrap();
    assert_eq!(first.remove("custom:a/1").await.unwrap().name, "1");
    assert_eq!(
        first.remove("custom:a/1").await.unwrap_err(),
        ServiceError::NotFound("custom:a/1".into())
    );
    first.close().await;

    let second = service(&cfg, Vec::new());
    second.open().await.unwrap();
    let ids: Vec<String> = second.all().unwrap().into_keys().collect();
    assert_eq!(ids, vec!["custom:a/2"]);

    assert_eq!(second.clear().await.unwrap(), 1);
    assert!(second.search("").unwrap().is_empty());
    second.close().await;

    let third = service(&cfg, Vec::new());
    third.open().await.unwrap();
    assert!(third.all().unwrap().is_empty());
    third.close().await;
}
