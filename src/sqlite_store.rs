//! SQLite-backed [`CatalogStore`] implementation.
//!
//! Each dataset is one row of `dataset_catalog(id, data)`, with `data`
//! holding the serialized [`DatasetMetadata`]. Keys the current model does
//! not know survive a load/save cycle through
//! [`DatasetMetadata::extra`].

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::error::PersistenceError;
use crate::models::{Catalog, DatasetMetadata};
use crate::store::CatalogStore;
use crate::{db, migrate};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and run migrations.
    pub async fn open(connection_string: &str) -> Result<Self, PersistenceError> {
        let pool = db::connect(connection_string)
            .await
            .map_err(|e| PersistenceError::ConnectionFailed(format!("{:#}", e)))?;
        migrate::run_migrations(&pool)
            .await
            .map_err(|e| PersistenceError::ConnectionFailed(format!("migrations: {:#}", e)))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Decode one stored row. The document's own id must match the row key.
fn decode_row(id: &str, data: &str) -> Result<DatasetMetadata, PersistenceError> {
    let entry: DatasetMetadata =
        serde_json::from_str(data).map_err(|e| PersistenceError::DeserializationFailed {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
    if entry.id != id {
        return Err(PersistenceError::DeserializationFailed {
            id: id.to_string(),
            reason: format!("document id '{}' does not match row id", entry.id),
        });
    }
    Ok(entry)
}

#[async_trait]
impl CatalogStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn load(&self) -> Result<Catalog, PersistenceError> {
        let rows = sqlx::query("SELECT id, data FROM dataset_catalog ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PersistenceError::ConnectionFailed(e.to_string()))?;

        let mut catalog = Catalog::new();
        let mut skipped = 0usize;
        for row in rows {
            let id: String = row.get("id");
            let data: String = row.get("data");
            match decode_row(&id, &data) {
                Ok(entry) => {
                    catalog.insert(id, entry);
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(error = %e, "skipping unreadable catalog row");
                }
            }
        }

        tracing::debug!(loaded = catalog.len(), skipped, "catalog loaded from sqlite");
        Ok(catalog)
    }

    async fn save(&self, catalog: &Catalog) -> Result<usize, PersistenceError> {
        let write_err = |e: sqlx::Error| PersistenceError::WriteFailed(e.to_string());

        let mut tx = self.pool.begin().await.map_err(write_err)?;
        for (id, entry) in catalog {
            let data = serde_json::to_string(entry)
                .map_err(|e| PersistenceError::WriteFailed(format!("{}: {}", id, e)))?;
            sqlx::query(
                r#"
                INSERT INTO dataset_catalog (id, data)
                VALUES (?, ?)
                ON CONFLICT(id) DO UPDATE SET data = excluded.data
                "#,
            )
            .bind(id)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;
        }
        tx.commit().await.map_err(write_err)?;

        Ok(catalog.len())
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM dataset_catalog WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| PersistenceError::WriteFailed(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self) -> Result<usize, PersistenceError> {
        let result = sqlx::query("DELETE FROM dataset_catalog")
            .execute(&self.pool)
            .await
            .map_err(|e| PersistenceError::WriteFailed(e.to_string()))?;
        Ok(result.rows_affected() as usize)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
