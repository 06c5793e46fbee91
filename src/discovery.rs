//! The discovery service: connectors, catalog and store wired together.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──open()──▶ Open ──refresh()──▶ Refreshing ──▶ Open ──close()──▶ Closed
//! ```
//!
//! Reads (`search`, `get`, `all`, `stale`) are synchronous and allowed in
//! `Open` and `Refreshing`; during a refresh they see every entry either
//! before or after its upsert, never in between.
//!
//! # Refresh cycle
//!
//! 1. Pick the connectors that are due: no entries yet, or any entry older
//!    than `refresh_ttl` (`force_refresh` picks all). The rest are `Skipped`.
//! 2. Spawn one task per due connector, each bounded by
//!    `connector_timeout`.
//! 3. Receive results over a channel in completion order and upsert each
//!    successful entry immediately. A failed connector leaves its previous
//!    entries untouched.
//! 4. Save a snapshot to the store. A failed save is reported, the
//!    in-memory catalog is kept.
//!
//! Only one cycle runs at a time; a concurrent call fails fast with
//! [`ServiceError::RefreshAlreadyInProgress`].

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::Instrument;

use crate::catalog::{DatasetCatalog, SearchFilter};
use crate::config::{Config, DiscoveryConfig, StorageConfig};
use crate::error::{ConnectorError, ServiceError};
use crate::models::{
    Catalog, ConnectorReport, ConnectorStatus, DatasetMetadata, PersistenceStatus, RefreshReport,
    UpsertOutcome,
};
use crate::store::{open_store, CatalogStore, DisabledStore};
use crate::traits::{Connector, ConnectorRegistry, FetchContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Open,
    Refreshing,
    Closed,
}

/// Result of one connector task, sent back to the refresh loop.
struct FetchOutcome {
    index: usize,
    result: Result<Vec<DatasetMetadata>, ConnectorError>,
    elapsed: Duration,
}

/// Holds `Refreshing` for its lifetime and restores `Open` on drop, so a
/// cycle that unwinds or is cancelled mid-await leaves the service usable.
struct RefreshingState<'a> {
    service: &'a DiscoveryService,
}

impl<'a> RefreshingState<'a> {
    fn enter(service: &'a DiscoveryService) -> Self {
        service.set_state(ServiceState::Refreshing);
        Self { service }
    }
}

impl Drop for RefreshingState<'_> {
    fn drop(&mut self) {
        self.service.set_state(ServiceState::Open);
    }
}

pub struct DiscoveryService {
    settings: DiscoveryConfig,
    storage: StorageConfig,
    connectors: Vec<Arc<dyn Connector>>,
    catalog: DatasetCatalog,
    store: Mutex<Option<Box<dyn CatalogStore>>>,
    refresh_guard: Mutex<()>,
    state: StdMutex<ServiceState>,
}

impl DiscoveryService {
    pub fn new(config: &Config, registry: ConnectorRegistry) -> Self {
        Self {
            settings: config.discovery.clone(),
            storage: config.storage.clone(),
            connectors: registry.connectors().to_vec(),
            catalog: DatasetCatalog::new(),
            store: Mutex::new(None),
            refresh_guard: Mutex::new(()),
            state: StdMutex::new(ServiceState::Uninitialized),
        }
    }

    /// Use `store` instead of the one selected by `[storage]`.
    pub fn with_store(mut self, store: Box<dyn CatalogStore>) -> Self {
        self.store = Mutex::new(Some(store));
        self
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: ServiceState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = next;
    }

    pub fn connectors(&self) -> &[Arc<dyn Connector>] {
        &self.connectors
    }

    /// Acquire the store and load the persisted catalog.
    ///
    /// Store failures are not fatal: an unreachable backend degrades the
    /// service to in-memory mode and an unreadable catalog starts empty.
    /// Calling `open` on an open service does nothing.
    pub async fn open(&self) -> Result<(), ServiceError> {
        match self.state() {
            ServiceState::Closed => return Err(ServiceError::Closed),
            ServiceState::Open | ServiceState::Refreshing => return Ok(()),
            ServiceState::Uninitialized => {}
        }

        let mut slot = self.store.lock().await;
        if slot.is_none() {
            let store = match open_store(&self.storage).await {
                Ok(store) => store,
                Err(e) => {
                    tracing::warn!(error = %e, "persistent store unavailable, running in memory");
                    Box::new(DisabledStore)
                }
            };
            *slot = Some(store);
        }

        if let Some(store) = slot.as_ref() {
            match store.load().await {
                Ok(loaded) => {
                    let count = loaded.len();
                    for entry in loaded.into_values() {
                        self.catalog.upsert(entry);
                    }
                    tracing::info!(store = store.name(), datasets = count, "catalog loaded");
                }
                Err(e) => {
                    tracing::warn!(store = store.name(), error = %e, "catalog load failed, starting empty");
                }
            }
        }
        drop(slot);

        self.set_state(ServiceState::Open);
        Ok(())
    }

    /// Refresh the connectors that are due.
    pub async fn refresh(&self) -> Result<RefreshReport, ServiceError> {
        self.run_refresh(false).await
    }

    /// Refresh every connector regardless of freshness.
    pub async fn force_refresh(&self) -> Result<RefreshReport, ServiceError> {
        self.run_refresh(true).await
    }

    async fn run_refresh(&self, force: bool) -> Result<RefreshReport, ServiceError> {
        let _guard = self.exclusive()?;

        let _refreshing = RefreshingState::enter(self);
        Ok(self.refresh_cycle(force).await)
    }

    async fn refresh_cycle(&self, force: bool) -> RefreshReport {
        let started = Instant::now();
        let ctx = FetchContext::new(self.settings.rate_limit_wait());
        let ttl = self.settings.refresh_ttl();
        let timeout = self.settings.connector_timeout();

        let mut statuses: Vec<Option<ConnectorReport>> = vec![None; self.connectors.len()];
        let (tx, mut rx) = mpsc::channel::<FetchOutcome>(self.connectors.len().max(1));

        for (index, connector) in self.connectors.iter().enumerate() {
            let source = connector.source_label();
            if !force && !self.catalog.source_is_due(&source, ttl, ctx.fetched_at) {
                tracing::debug!(source = %source, "connector fresh, skipping");
                statuses[index] = Some(ConnectorReport {
                    source,
                    status: ConnectorStatus::Skipped,
                    elapsed: Duration::ZERO,
                });
                continue;
            }

            let tx = tx.clone();
            let connector = Arc::clone(connector);
            let ctx = ctx.clone();
            let span = tracing::info_span!("fetch", source = %source);
            tokio::spawn(
                async move {
                    let fetch_started = Instant::now();
                    let result = match tokio::time::timeout(timeout, connector.fetch(&ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(ConnectorError::Timeout(timeout)),
                    };
                    let _ = tx
                        .send(FetchOutcome {
                            index,
                            result,
                            elapsed: fetch_started.elapsed(),
                        })
                        .await;
                }
                .instrument(span),
            );
        }
        drop(tx);

        let (mut added, mut updated, mut unchanged) = (0usize, 0usize, 0usize);
        while let Some(outcome) = rx.recv().await {
            let source = self.connectors[outcome.index].source_label();
            let status = match outcome.result {
                Ok(entries) => {
                    let datasets = entries.len();
                    for entry in entries {
                        match self.catalog.upsert(entry) {
                            UpsertOutcome::Inserted => added += 1,
                            UpsertOutcome::Updated => updated += 1,
                            UpsertOutcome::Unchanged => unchanged += 1,
                            UpsertOutcome::Stale => {}
                        }
                    }
                    tracing::info!(source = %source, datasets, elapsed_ms = outcome.elapsed.as_millis() as u64, "connector fetched");
                    ConnectorStatus::Succeeded { datasets }
                }
                Err(e) => {
                    tracing::warn!(source = %source, kind = e.kind(), error = %e, "connector failed");
                    ConnectorStatus::Failed(e)
                }
            };
            statuses[outcome.index] = Some(ConnectorReport {
                source,
                status,
                elapsed: outcome.elapsed,
            });
        }

        // A task that panicked never reported back.
        let connectors: Vec<ConnectorReport> = statuses
            .into_iter()
            .enumerate()
            .map(|(index, report)| {
                report.unwrap_or_else(|| {
                    let source = self.connectors[index].source_label();
                    tracing::error!(source = %source, "fetch task aborted");
                    ConnectorReport {
                        source,
                        status: ConnectorStatus::Failed(ConnectorError::Unreachable(
                            "fetch task aborted".into(),
                        )),
                        elapsed: Duration::ZERO,
                    }
                })
            })
            .collect();

        let snapshot = self.catalog.all();
        let persistence = self.persist(&snapshot).await;

        let report = RefreshReport {
            added,
            updated,
            unchanged,
            connectors,
            persistence,
            catalog_size: snapshot.len(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            added = report.added,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failures().count(),
            catalog_size = report.catalog_size,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "refresh complete"
        );
        report
    }

    async fn persist(&self, snapshot: &Catalog) -> PersistenceStatus {
        let slot = self.store.lock().await;
        match slot.as_ref() {
            Some(store) if store.is_persistent() => match store.save(snapshot).await {
                Ok(rows) => PersistenceStatus::Saved { rows },
                Err(e) => {
                    tracing::warn!(store = store.name(), error = %e, "catalog save failed");
                    PersistenceStatus::Failed(e.to_string())
                }
            },
            _ => PersistenceStatus::Disabled,
        }
    }

    fn ensure_readable(&self) -> Result<(), ServiceError> {
        match self.state() {
            ServiceState::Uninitialized => Err(ServiceError::NotInitialized),
            ServiceState::Closed => Err(ServiceError::Closed),
            ServiceState::Open | ServiceState::Refreshing => Ok(()),
        }
    }

    pub fn search(&self, query: &str) -> Result<Vec<DatasetMetadata>, ServiceError> {
        self.ensure_readable()?;
        Ok(self.catalog.search(query))
    }

    pub fn search_with(
        &self,
        query: &str,
        filter: &SearchFilter,
    ) -> Result<Vec<DatasetMetadata>, ServiceError> {
        self.ensure_readable()?;
        Ok(self.catalog.search_with(query, filter))
    }

    pub fn get(&self, id: &str) -> Result<DatasetMetadata, ServiceError> {
        self.ensure_readable()?;
        self.catalog
            .get(id)
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    /// Snapshot of the whole catalog.
    pub fn all(&self) -> Result<Catalog, ServiceError> {
        self.ensure_readable()?;
        Ok(self.catalog.all())
    }

    /// Entries older than `refresh_ttl`.
    pub fn stale(&self) -> Result<Vec<DatasetMetadata>, ServiceError> {
        self.ensure_readable()?;
        let ids = self.catalog.stale(self.settings.refresh_ttl(), Utc::now());
        Ok(ids.iter().filter_map(|id| self.catalog.get(id)).collect())
    }

    /// Delete one dataset from the store and the catalog.
    ///
    /// Refreshes never delete; this is for operators retiring a dataset.
    /// A connector still listing the dataset brings it back on its next
    /// refresh. Fails with `RefreshAlreadyInProgress` while a cycle runs.
    pub async fn remove(&self, id: &str) -> Result<DatasetMetadata, ServiceError> {
        let _guard = self.exclusive()?;
        if self.catalog.get(id).is_none() {
            return Err(ServiceError::NotFound(id.to_string()));
        }
        if let Some(store) = self.store.lock().await.as_ref() {
            store.delete(id).await?;
        }
        let removed = self
            .catalog
            .remove(id)
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))?;
        tracing::info!(id, "dataset removed");
        Ok(removed)
    }

    /// Delete every dataset from the store and the catalog. Returns the
    /// number of catalog entries dropped.
    pub async fn clear(&self) -> Result<usize, ServiceError> {
        let _guard = self.exclusive()?;
        if let Some(store) = self.store.lock().await.as_ref() {
            store.clear().await?;
        }
        let count = self.catalog.clear();
        tracing::info!(datasets = count, "catalog cleared");
        Ok(count)
    }

    /// Take the refresh guard, re-checking state in case close() won the
    /// race for it.
    fn exclusive(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, ServiceError> {
        self.ensure_readable()?;
        let guard = self
            .refresh_guard
            .try_lock()
            .map_err(|_| ServiceError::RefreshAlreadyInProgress)?;
        self.ensure_readable()?;
        Ok(guard)
    }

    /// Refresh every `refresh_ttl` until `shutdown` resolves. Returns the
    /// number of completed cycles.
    pub async fn watch<F>(&self, shutdown: F) -> Result<usize, ServiceError>
    where
        F: Future<Output = ()>,
    {
        self.ensure_readable()?;
        let period = self.settings.refresh_ttl().max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut cycles = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => match self.refresh().await {
                    Ok(_) => cycles += 1,
                    Err(ServiceError::RefreshAlreadyInProgress) => {
                        tracing::warn!("previous refresh still running, skipping tick");
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(cycles)
    }

    /// Wait for any running refresh, then release the store.
    pub async fn close(&self) {
        let _guard = self.refresh_guard.lock().await;
        if self.state() == ServiceState::Closed {
            return;
        }
        self.set_state(ServiceState::Closed);
        if let Some(store) = self.store.lock().await.take() {
            store.close().await;
            tracing::debug!(store = store.name(), "store closed");
        }
    }
}
