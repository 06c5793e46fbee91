use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Open a pool for a `sqlite:` URL or a plain file path.
pub async fn connect(connection_string: &str) -> Result<SqlitePool> {
    let url = if connection_string.starts_with("sqlite:") {
        connection_string.to_string()
    } else {
        format!("sqlite:{}", connection_string)
    };

    // Ensure parent directory exists
    if let Some(path) = file_path(&url) {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Filesystem path of a `sqlite:` URL; `None` for in-memory databases.
fn file_path(url: &str) -> Option<&Path> {
    let rest = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(Path::new(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_path_strips_scheme_and_query() {
        assert_eq!(
            file_path("sqlite:./data/catalog.sqlite?mode=rwc"),
            Some(Path::new("./data/catalog.sqlite"))
        );
        assert_eq!(
            file_path("sqlite:///var/lib/discovery.db"),
            Some(Path::new("/var/lib/discovery.db"))
        );
        assert_eq!(file_path("sqlite::memory:"), None);
    }

    #[tokio::test]
    async fn creates_missing_parent_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/dir/catalog.sqlite");
        let pool = connect(path.to_str().unwrap()).await.unwrap();
        pool.close().await;
        assert!(path.exists());
    }
}
