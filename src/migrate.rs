use anyhow::Result;
use sqlx::SqlitePool;

/// Create the catalog table. Safe to run on every open.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One JSON document per dataset, keyed by dataset id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dataset_catalog (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
