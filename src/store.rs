//! Durable backing for the catalog.
//!
//! [`CatalogStore`] is the persistence seam of the service. Two
//! implementations ship with the crate:
//!
//! - [`SqliteStore`](crate::sqlite_store::SqliteStore): one row per dataset
//!   in the `dataset_catalog` table, the entry serialized as JSON.
//! - [`DisabledStore`]: in-memory mode; loads nothing and saves nothing.
//!
//! The store only ever receives an owned snapshot of the catalog, never a
//! reference into the live map.

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::error::PersistenceError;
use crate::models::Catalog;
use crate::sqlite_store::SqliteStore;

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Backend name for logs and `discovery sources` output.
    fn name(&self) -> &str;

    /// False for stores that drop everything they are given.
    fn is_persistent(&self) -> bool {
        true
    }

    /// Read every stored entry. Rows that fail to decode are skipped.
    async fn load(&self) -> Result<Catalog, PersistenceError>;

    /// Upsert every entry of the snapshot atomically. Returns the row count.
    async fn save(&self, catalog: &Catalog) -> Result<usize, PersistenceError>;

    /// Delete one entry. Returns whether a row existed.
    async fn delete(&self, id: &str) -> Result<bool, PersistenceError>;

    /// Delete every entry. Returns the number of rows removed.
    async fn clear(&self) -> Result<usize, PersistenceError>;

    /// Release the backend. Later calls may fail.
    async fn close(&self);
}

/// Store used when persistence is disabled or unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStore;

#[async_trait]
impl CatalogStore for DisabledStore {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn load(&self) -> Result<Catalog, PersistenceError> {
        Ok(Catalog::new())
    }

    async fn save(&self, _catalog: &Catalog) -> Result<usize, PersistenceError> {
        Ok(0)
    }

    async fn delete(&self, _id: &str) -> Result<bool, PersistenceError> {
        Ok(false)
    }

    async fn clear(&self) -> Result<usize, PersistenceError> {
        Ok(0)
    }

    async fn close(&self) {}
}

/// Build the store selected by `[storage]`.
pub async fn open_store(config: &StorageConfig) -> Result<Box<dyn CatalogStore>, PersistenceError> {
    if !config.persistent_storage_enabled {
        return Ok(Box::new(DisabledStore));
    }
    let connection_string = config
        .connection_string
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| PersistenceError::ConnectionFailed("no connection_string configured".into()))?;
    Ok(Box::new(SqliteStore::open(connection_string).await?))
}
