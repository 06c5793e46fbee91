//! # Data Discovery CLI (`discovery`)
//!
//! ## Usage
//!
//! ```bash
//! discovery --config ./config/discovery.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `discovery init` | Create the catalog database and run migrations |
//! | `discovery sources` | List configured connectors |
//! | `discovery refresh` | Fetch due sources and save the catalog |
//! | `discovery search "<query>"` | Search the persisted catalog |
//! | `discovery get <id>` | Print one dataset as JSON |
//! | `discovery stale` | List entries older than the refresh TTL |
//! | `discovery watch` | Refresh periodically until Ctrl-C |
//! | `discovery remove <id>` | Delete one dataset |
//! | `discovery clear --yes` | Delete every dataset |
//!
//! Commands other than `refresh` and `watch` read the catalog from the
//! store, so with persistence disabled they only see an empty catalog.

use std::future::Future;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};

use data_discovery::catalog::SearchFilter;
use data_discovery::config::{self, Config};
use data_discovery::discovery::DiscoveryService;
use data_discovery::models::{ConnectorStatus, DatasetMetadata, PersistenceStatus, RefreshReport};
use data_discovery::sqlite_store::SqliteStore;
use data_discovery::store::CatalogStore;
use data_discovery::traits::ConnectorRegistry;
use data_discovery::{logging, sources};

/// Data Discovery: a catalog of datasets published by statistical,
/// meteorological and climate data sources.
#[derive(Parser)]
#[command(name = "discovery", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/discovery.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the catalog database. Idempotent.
    Init,

    /// List configured connectors.
    Sources,

    /// Fetch datasets from every source that is due.
    Refresh {
        /// Fetch every source, fresh or not.
        #[arg(long)]
        force: bool,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search the catalog by name, schema field, source, description or tag.
    Search {
        /// Case-insensitive substring; empty lists everything.
        query: String,

        /// Only this source label (e.g. `ine:es`).
        #[arg(long)]
        source: Option<String>,

        /// Required tag; repeat for several.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Only entries fetched on or after this date (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Print one dataset as JSON.
    Get {
        /// Dataset id, e.g. `ine:es/IPC`.
        id: String,
    },

    /// List datasets older than the refresh TTL.
    Stale,

    /// Refresh every `refresh_ttl_secs` until interrupted.
    Watch,

    /// Delete one dataset from the catalog and the store.
    Remove {
        id: String,
    },

    /// Delete every dataset from the catalog and the store.
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => init(&cfg).await?,
        Commands::Sources => {
            let registry = ConnectorRegistry::from_config(&cfg)?;
            sources::list_sources(&registry);
        }
        Commands::Refresh { force, json } => {
            let service = open_service(&cfg).await?;
            let report = if force {
                closing(&service, service.force_refresh()).await?
            } else {
                closing(&service, service.refresh()).await?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report.to_json())?);
            } else {
                print_report(&report);
            }
        }
        Commands::Search {
            query,
            source,
            tags,
            since,
            limit,
            json,
        } => {
            let filter = SearchFilter {
                source,
                tags,
                since: since.as_deref().map(parse_since).transpose()?,
                limit,
            };
            let service = open_service(&cfg).await?;
            let results = closing(&service, async { service.search_with(&query, &filter) }).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_datasets(&results);
            }
        }
        Commands::Get { id } => {
            let service = open_service(&cfg).await?;
            let result = closing(&service, async { service.get(&id) }).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Stale => {
            let service = open_service(&cfg).await?;
            let stale = closing(&service, async { service.stale() }).await?;
            print_datasets(&stale);
        }
        Commands::Remove { id } => {
            let service = open_service(&cfg).await?;
            let removed = closing(&service, service.remove(&id)).await?;
            println!("Removed {} ({})", removed.id, removed.name);
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("clear deletes every stored dataset; pass --yes to confirm");
            }
            let service = open_service(&cfg).await?;
            let count = closing(&service, service.clear()).await?;
            println!("Cleared {} datasets", count);
        }
        Commands::Watch => {
            let service = open_service(&cfg).await?;
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for Ctrl-C");
                }
            };
            let cycles = closing(&service, service.watch(shutdown)).await?;
            eprintln!("stopped after {} refresh cycle(s)", cycles);
        }
    }

    Ok(())
}

async fn init(cfg: &Config) -> Result<()> {
    if !cfg.storage.persistent_storage_enabled {
        println!("Persistence is disabled; nothing to initialize.");
        return Ok(());
    }
    let connection_string = cfg
        .storage
        .connection_string
        .as_deref()
        .context("storage.connection_string is not set")?;
    let store = SqliteStore::open(connection_string).await?;
    store.close().await;
    println!("Catalog database initialized at {}", connection_string);
    Ok(())
}

async fn open_service(cfg: &Config) -> Result<DiscoveryService> {
    let registry = ConnectorRegistry::from_config(cfg)?;
    let service = DiscoveryService::new(cfg, registry);
    service.open().await?;
    Ok(service)
}

/// Await `op`, then close the service whether it succeeded or not.
async fn closing<T, E>(
    service: &DiscoveryService,
    op: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let result = op.await;
    service.close().await;
    Ok(result?)
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        Ok(date) => match date.and_hms_opt(0, 0, 0) {
            Some(dt) => Ok(dt.and_utc()),
            None => bail!("invalid --since date: {}", raw),
        },
        Err(_) => bail!("--since must be YYYY-MM-DD or RFC 3339, got '{}'", raw),
    }
}

fn print_report(report: &RefreshReport) {
    println!("{:<24} {:<10} {:<32} ELAPSED", "SOURCE", "STATUS", "DETAIL");
    for c in &report.connectors {
        let (status, detail) = match &c.status {
            ConnectorStatus::Succeeded { datasets } => ("ok", format!("{} datasets", datasets)),
            ConnectorStatus::Failed(e) => ("failed", e.to_string()),
            ConnectorStatus::Skipped => ("skipped", "fresh".to_string()),
        };
        println!(
            "{:<24} {:<10} {:<32} {}ms",
            c.source,
            status,
            detail,
            c.elapsed.as_millis()
        );
    }
    println!();
    println!(
        "added {}, updated {}, unchanged {}; catalog holds {} datasets ({}ms)",
        report.added,
        report.updated,
        report.unchanged,
        report.catalog_size,
        report.elapsed.as_millis()
    );
    match &report.persistence {
        PersistenceStatus::Saved { rows } => println!("saved {} rows", rows),
        PersistenceStatus::Disabled => println!("persistence disabled"),
        PersistenceStatus::Failed(msg) => println!("save failed: {}", msg),
    }
}

fn print_datasets(datasets: &[DatasetMetadata]) {
    if datasets.is_empty() {
        println!("No datasets.");
        return;
    }
    for d in datasets {
        println!(
            "{}  {}  [{}]  fetched {}",
            d.id,
            d.name,
            d.source,
            d.fetched_at.format("%Y-%m-%d %H:%M")
        );
    }
}
