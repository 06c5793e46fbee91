//! # Data Discovery
//!
//! A catalog of the datasets published by external data sources.
//!
//! Connectors list the datasets each source offers (Spanish statistics,
//! meteorology, Eurostat, NetCDF climate files). The service merges their
//! results into one in-memory catalog, keeps it fresh against a TTL, and
//! persists it to SQLite so a restart picks up where it left off.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────┐
//! │  Connectors  │──▶│ DiscoveryService │──▶│  SQLite  │
//! │ INE/AEMET/.. │   │ refresh + merge  │   │ catalog  │
//! └──────────────┘   └────────┬─────────┘   └──────────┘
//!                             ▼
//!                    ┌──────────────────┐
//!                    │  DatasetCatalog  │◀── search / get
//!                    └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! discovery init
//! discovery refresh
//! discovery search "gdp"
//! discovery get ine:es/IPC
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Dataset metadata and refresh reports |
//! | [`error`] | Error taxonomy |
//! | [`traits`] | `Connector` trait and registry |
//! | [`http`] | Rate-limited HTTP client shared by connectors |
//! | [`rate_limit`] | Token bucket limiter |
//! | [`connector_ine`] | INE statistics connector |
//! | [`connector_aemet`] | AEMET OpenData connector |
//! | [`connector_eurostat`] | Eurostat connector |
//! | [`connector_climate`] | NetCDF climate file connector |
//! | [`netcdf`] | NetCDF classic header decoder |
//! | [`catalog`] | In-memory catalog and search |
//! | [`store`] | Persistence trait |
//! | [`sqlite_store`] | SQLite persistence |
//! | [`discovery`] | Refresh orchestration and lifecycle |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`logging`] | Log subscriber setup |
//! | [`sources`] | Connector listing |

pub mod catalog;
pub mod config;
pub mod connector_aemet;
pub mod connector_climate;
pub mod connector_eurostat;
pub mod connector_ine;
pub mod db;
pub mod discovery;
pub mod error;
pub mod http;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod netcdf;
pub mod rate_limit;
pub mod sources;
pub mod sqlite_store;
pub mod store;
pub mod traits;
