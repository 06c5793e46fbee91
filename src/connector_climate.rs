//! Climate data connector (NetCDF over HTTP).
//!
//! Each configured file becomes one dataset. Only the leading
//! `header_bytes` of the file are requested (HTTP `Range`), which is enough
//! to decode the NetCDF classic header: variables become the schema,
//! global `title`, `summary`, `license` and `keywords` attributes fill the
//! descriptive fields.
//!
//! # Configuration
//!
//! ```toml
//! [connectors.climate.cds]
//! base_url = "https://climate.example.org/files"
//! api_key_env = "CLIMATE_API_KEY"
//! files = ["reanalysis/t2m_2020.nc"]
//! header_bytes = 65536
//! ```

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RANGE};

use crate::config::{ClimateConnectorConfig, ConnectorConfig, SourceDefaults};
use crate::error::ConnectorError;
use crate::http::HttpSource;
use crate::models::{dataset_id, DatasetMetadata, FieldTypes};
use crate::netcdf::{self, Header};
use crate::rate_limit::RateLimiter;
use crate::traits::{Connector, FetchContext};

pub const DEFAULTS: SourceDefaults = SourceDefaults {
    base_url: "https://cds.climate.copernicus.eu/api/files",
    requests_per_window: 10,
    window_secs: 60,
    api_key_env: Some("CLIMATE_API_KEY"),
};

pub struct ClimateConnector {
    name: String,
    files: Vec<String>,
    header_bytes: u64,
    http: HttpSource,
}

impl ClimateConnector {
    pub fn new(name: String, config: &ClimateConnectorConfig) -> Result<Self> {
        let http = HttpSource::new(format!("climate:{}", name), config.source.resolve(DEFAULTS))?;
        Ok(Self {
            name,
            files: config.files.clone(),
            header_bytes: config.header_bytes,
            http,
        })
    }

    fn request_headers(&self) -> Result<HeaderMap, ConnectorError> {
        let key = self.http.require_api_key()?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|_| ConnectorError::AuthFailed("API key is not a valid header value".into()))?;
        let range = HeaderValue::from_str(&format!("bytes=0-{}", self.header_bytes.saturating_sub(1)))
            .map_err(|e| ConnectorError::Unreachable(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(RANGE, range);
        Ok(headers)
    }

    fn header_limit(&self) -> usize {
        usize::try_from(self.header_bytes).unwrap_or(usize::MAX)
    }
}

#[async_trait]
impl Connector for ClimateConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "NetCDF climate files, described from their headers"
    }

    fn connector_type(&self) -> &str {
        "climate"
    }

    fn config(&self) -> &ConnectorConfig {
        self.http.config()
    }

    fn rate_limiter(&self) -> &RateLimiter {
        self.http.limiter()
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<DatasetMetadata>, ConnectorError> {
        let headers = self.request_headers()?;
        let source = self.source_label();

        let limit = self.config().max_datasets.unwrap_or(usize::MAX);
        let mut datasets = Vec::new();
        for file in self.files.iter().take(limit) {
            let endpoint = self.http.url(file);
            let bytes = self
                .http
                .get_bytes(ctx, &endpoint, headers.clone(), self.header_limit())
                .await?;
            let header = netcdf::parse_header(&bytes)
                .map_err(|e| ConnectorError::SchemaMismatch(format!("{}: {}", endpoint, e)))?;

            let mut meta = metadata_from_header(&source, file, endpoint, &header, ctx);
            meta.rate_limit = Some(self.config().requests_per_window);
            datasets.push(meta);
        }
        Ok(datasets)
    }
}

/// Dataset entry for one decoded header.
pub fn metadata_from_header(
    source: &str,
    file: &str,
    endpoint: String,
    header: &Header,
    ctx: &FetchContext,
) -> DatasetMetadata {
    let schema: FieldTypes = header
        .variables
        .iter()
        .map(|v| (v.name.clone(), v.nc_type.name().to_string()))
        .collect();

    let name = header
        .attribute("title")
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(file)
        .to_string();

    let mut meta = DatasetMetadata::new(
        dataset_id(source, Some(file), &endpoint),
        name,
        source,
        endpoint,
        ctx.fetched_at,
    )
    .with_schema(schema);

    meta.description = header.attribute("summary").map(str::to_string);
    meta.license = header.attribute("license").map(str::to_string);

    let mut tags = vec!["climate".to_string()];
    if let Some(keywords) = header.attribute("keywords") {
        tags.extend(
            keywords
                .split([',', ';'])
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
        );
    }
    tags.dedup();
    meta.tags = tags;

    let dims: serde_json::Map<String, serde_json::Value> = header
        .dimensions
        .iter()
        .map(|d| (d.name.clone(), d.length.into()))
        .collect();
    meta.extra.insert("dimensions".into(), dims.into());
    meta.extra.insert("netcdf_version".into(), header.version.into());
    meta
}
