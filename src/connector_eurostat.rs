//! Eurostat connector.
//!
//! Reads the Eurostat table of contents (an XML navigation tree) and turns
//! every `leaf type="dataset"` into a dataset entry, optionally resolving
//! its dimensions from the JSON-stat data API.
//!
//! # Requests
//!
//! | Request | Purpose |
//! |---------|---------|
//! | `GET {base}/catalogue/toc/xml` | dataset codes, English titles, last update |
//! | `GET {base}/statistics/1.0/data/{code}?lastTimePeriod=1` | JSON-stat dimension ids → schema |
//!
//! The TOC lists a dataset once per theme it belongs to; duplicates are
//! collapsed by code. The TOC is streamed with `quick-xml` rather than
//! loaded into a DOM, since the full tree runs to tens of megabytes.
//!
//! # Configuration
//!
//! ```toml
//! [connectors.eurostat.eu]
//! include_codes = ["nama_10_*", "prc_hicp_*"]
//! resolve_dimensions = true
//! ```

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::config::{ConnectorConfig, EurostatConnectorConfig, SourceDefaults};
use crate::error::ConnectorError;
use crate::http::HttpSource;
use crate::models::{dataset_id, DatasetMetadata, FieldTypes};
use crate::rate_limit::RateLimiter;
use crate::traits::{Connector, FetchContext};

pub const DEFAULTS: SourceDefaults = SourceDefaults {
    base_url: "https://ec.europa.eu/eurostat/api/dissemination",
    requests_per_window: 500,
    window_secs: 60,
    api_key_env: None,
};

pub struct EurostatConnector {
    name: String,
    include: Option<GlobSet>,
    resolve_dimensions: bool,
    http: HttpSource,
}

impl EurostatConnector {
    pub fn new(name: String, config: &EurostatConnectorConfig) -> Result<Self> {
        let include = if config.include_codes.is_empty() {
            None
        } else {
            Some(
                build_globset(&config.include_codes)
                    .with_context(|| format!("connectors.eurostat.{}: invalid include_codes", name))?,
            )
        };
        let http = HttpSource::new(format!("eurostat:{}", name), config.source.resolve(DEFAULTS))?;
        Ok(Self {
            name,
            include,
            resolve_dimensions: config.resolve_dimensions,
            http,
        })
    }

    async fn schema_for(&self, ctx: &FetchContext, code: &str) -> Result<FieldTypes, ConnectorError> {
        let url = self
            .http
            .url(&format!("statistics/1.0/data/{}?lastTimePeriod=1", code));
        match self.http.get_json::<Value>(ctx, &url, HeaderMap::new()).await {
            Ok(body) => parse_jsonstat_schema(&body),
            Err(e @ (ConnectorError::AuthFailed(_) | ConnectorError::RateLimited(_))) => Err(e),
            Err(e) => {
                tracing::debug!(source = %self.source_label(), code, error = %e, "dimension lookup failed");
                Ok(fallback_schema())
            }
        }
    }
}

#[async_trait]
impl Connector for EurostatConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Datasets from the Eurostat table of contents"
    }

    fn connector_type(&self) -> &str {
        "eurostat"
    }

    fn config(&self) -> &ConnectorConfig {
        self.http.config()
    }

    fn rate_limiter(&self) -> &RateLimiter {
        self.http.limiter()
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<DatasetMetadata>, ConnectorError> {
        let source = self.source_label();
        let toc_url = self.http.url("catalogue/toc/xml");
        let xml = self.http.get_text(ctx, &toc_url, HeaderMap::new()).await?;

        let mut leaves = parse_toc(&xml)?;
        if let Some(include) = &self.include {
            leaves.retain(|leaf| include.is_match(&leaf.code));
        }
        if let Some(max) = self.config().max_datasets {
            leaves.truncate(max);
        }

        let mut datasets = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let schema = if self.resolve_dimensions {
                self.schema_for(ctx, &leaf.code).await?
            } else {
                fallback_schema()
            };
            let endpoint = self.http.url(&format!("statistics/1.0/data/{}", leaf.code));
            let mut meta = DatasetMetadata::new(
                dataset_id(&source, Some(&leaf.code), &endpoint),
                leaf.title.unwrap_or_else(|| leaf.code.clone()),
                source.clone(),
                endpoint,
                ctx.fetched_at,
            )
            .with_schema(schema);
            meta.description = leaf.description;
            meta.last_updated = leaf.last_update;
            meta.tags = vec!["statistics".to_string(), "eu".to_string()];
            meta.rate_limit = Some(self.config().requests_per_window);
            datasets.push(meta);
        }

        tracing::debug!(source = %source, datasets = datasets.len(), "eurostat toc parsed");
        Ok(datasets)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

// ═══════════════════════════════════════════════════════════════════════
// Table of contents
// ═══════════════════════════════════════════════════════════════════════

/// One `leaf type="dataset"` of the TOC.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TocLeaf {
    pub code: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LeafField {
    Code,
    Title { english: bool },
    Description { english: bool },
    LastUpdate,
}

/// Stream the TOC and collect dataset leaves, first occurrence per code.
pub fn parse_toc(xml: &str) -> Result<Vec<TocLeaf>, ConnectorError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut leaves = Vec::new();
    let mut seen = HashSet::new();
    let mut saw_tree = false;
    let mut current: Option<TocLeaf> = None;
    let mut field: Option<LeafField> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            ConnectorError::SchemaMismatch(format!(
                "TOC XML error at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;

        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"tree" => saw_tree = true,
                b"leaf" if attr(&e, b"type").as_deref() == Some("dataset") => {
                    current = Some(TocLeaf::default());
                }
                name if current.is_some() => {
                    let english = matches!(attr(&e, b"language").as_deref(), None | Some("en"));
                    field = match name {
                        b"code" => Some(LeafField::Code),
                        b"title" => Some(LeafField::Title { english }),
                        b"shortDescription" => Some(LeafField::Description { english }),
                        b"lastUpdate" => Some(LeafField::LastUpdate),
                        _ => None,
                    };
                }
                _ => {}
            },
            Event::Text(t) => {
                if let (Some(leaf), Some(f)) = (current.as_mut(), field) {
                    let text = t
                        .unescape()
                        .map_err(|e| ConnectorError::SchemaMismatch(format!("TOC text: {}", e)))?;
                    apply_field(leaf, f, text.trim());
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"leaf" => {
                    if let Some(leaf) = current.take() {
                        if !leaf.code.is_empty() && seen.insert(leaf.code.clone()) {
                            leaves.push(leaf);
                        }
                    }
                    field = None;
                }
                _ => field = None,
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_tree {
        return Err(ConnectorError::SchemaMismatch(
            "TOC has no <tree> root element".into(),
        ));
    }
    Ok(leaves)
}

fn apply_field(leaf: &mut TocLeaf, field: LeafField, text: &str) {
    if text.is_empty() {
        return;
    }
    match field {
        LeafField::Code => leaf.code = text.to_string(),
        // English wins; any other language only fills a gap.
        LeafField::Title { english } => {
            if english || leaf.title.is_none() {
                leaf.title = Some(text.to_string());
            }
        }
        LeafField::Description { english } => {
            if english || leaf.description.is_none() {
                leaf.description = Some(text.to_string());
            }
        }
        LeafField::LastUpdate => leaf.last_update = parse_toc_date(text),
    }
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// TOC dates are `dd.mm.yyyy`.
fn parse_toc_date(text: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(text, "%d.%m.%Y").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

// ═══════════════════════════════════════════════════════════════════════
// JSON-stat
// ═══════════════════════════════════════════════════════════════════════

pub fn fallback_schema() -> FieldTypes {
    FieldTypes::from([
        ("time".to_string(), "datetime".to_string()),
        ("value".to_string(), "float".to_string()),
    ])
}

/// Schema from the `id` array of a JSON-stat dataset.
pub fn parse_jsonstat_schema(body: &Value) -> Result<FieldTypes, ConnectorError> {
    let ids = body
        .get("id")
        .and_then(Value::as_array)
        .ok_or_else(|| ConnectorError::SchemaMismatch("JSON-stat body has no 'id' array".into()))?;

    let mut schema: FieldTypes = ids
        .iter()
        .filter_map(Value::as_str)
        .map(|dim| {
            let kind = if dim == "time" { "datetime" } else { "string" };
            (dim.to_string(), kind.to_string())
        })
        .collect();
    schema.insert("value".to_string(), "float".to_string());
    Ok(schema)
}
