//! AEMET OpenData (Spanish meteorological agency) connector.
//!
//! Every configured product path becomes one dataset. AEMET answers in two
//! steps: the product request returns a small envelope pointing at the
//! actual data and at its metadata document, and the metadata document
//! describes the fields.
//!
//! ```text
//! GET {base}/{product}        api_key: <key>
//!   → {"estado": 200, "descripcion": "exito", "datos": "<url>", "metadatos": "<url>"}
//! GET {metadatos}
//!   → {"descripcion": ..., "periodicidad": ..., "campos": [{"id": ..., "tipo_datos": ...}]}
//! ```
//!
//! Both envelope URLs are temporary links that change on every request, so
//! neither is stored in the catalog; `endpoint` is the product path.
//!
//! The envelope's `estado` is checked like an HTTP status: 401/403 are
//! authentication failures, 429 is rate limiting, anything else non-200
//! makes the source unreachable.
//!
//! # Configuration
//!
//! ```toml
//! [connectors.aemet.es]
//! api_key_env = "AEMET_API_KEY"
//! products = ["valores/climatologicos/inventarioestaciones/todasestaciones"]
//! ```

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::{AemetConnectorConfig, ConnectorConfig, SourceDefaults};
use crate::error::ConnectorError;
use crate::http::{status_error, HttpSource};
use crate::models::{dataset_id, DatasetMetadata, FieldTypes};
use crate::rate_limit::RateLimiter;
use crate::traits::{Connector, FetchContext};

pub const DEFAULTS: SourceDefaults = SourceDefaults {
    base_url: "https://opendata.aemet.es/opendata/api",
    requests_per_window: 60,
    window_secs: 60,
    api_key_env: Some("AEMET_API_KEY"),
};

pub struct AemetConnector {
    name: String,
    products: Vec<String>,
    http: HttpSource,
}

impl AemetConnector {
    pub fn new(name: String, config: &AemetConnectorConfig) -> Result<Self> {
        let http = HttpSource::new(format!("aemet:{}", name), config.source.resolve(DEFAULTS))?;
        Ok(Self {
            name,
            products: config.products.clone(),
            http,
        })
    }

    fn auth_headers(&self) -> Result<HeaderMap, ConnectorError> {
        let key = self.http.require_api_key()?;
        let value = HeaderValue::from_str(key)
            .map_err(|_| ConnectorError::AuthFailed("API key is not a valid header value".into()))?;
        let mut headers = HeaderMap::new();
        headers.insert("api_key", value);
        Ok(headers)
    }

    async fn fetch_product(
        &self,
        ctx: &FetchContext,
        source: &str,
        product: &str,
        headers: &HeaderMap,
    ) -> Result<DatasetMetadata, ConnectorError> {
        let endpoint = self.http.url(product);
        let text = self.http.get_text(ctx, &endpoint, headers.clone()).await?;
        let envelope = parse_envelope(&text)?;
        check_estado(&envelope, &endpoint)?;

        let metadata = match envelope.metadatos.as_deref() {
            Some(url) => {
                let text = self.http.get_text(ctx, url, headers.clone()).await?;
                Some(parse_metadata(&text)?)
            }
            None => None,
        };

        let name = metadata
            .as_ref()
            .and_then(|m| m.descripcion.clone())
            .unwrap_or_else(|| product.to_string());
        let mut meta = DatasetMetadata::new(
            dataset_id(source, Some(product), &endpoint),
            name,
            source,
            endpoint,
            ctx.fetched_at,
        );
        meta.tags = vec!["meteorology".to_string()];
        meta.rate_limit = Some(self.config().requests_per_window);
        if let Some(m) = metadata {
            meta.schema = m.schema();
            meta.description = m.descripcion;
            meta.update_frequency = m.periodicidad;
            meta.license = m.copyright;
        }
        Ok(meta)
    }
}

#[async_trait]
impl Connector for AemetConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Meteorological products from AEMET OpenData"
    }

    fn connector_type(&self) -> &str {
        "aemet"
    }

    fn config(&self) -> &ConnectorConfig {
        self.http.config()
    }

    fn rate_limiter(&self) -> &RateLimiter {
        self.http.limiter()
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<DatasetMetadata>, ConnectorError> {
        let headers = self.auth_headers()?;
        let source = self.source_label();

        let limit = self.config().max_datasets.unwrap_or(usize::MAX);
        let mut datasets = Vec::new();
        for product in self.products.iter().take(limit) {
            datasets.push(self.fetch_product(ctx, &source, product, &headers).await?);
        }
        Ok(datasets)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Response parsing
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub estado: u16,
    #[serde(default)]
    pub descripcion: Option<String>,
    #[serde(default)]
    pub datos: Option<String>,
    #[serde(default)]
    pub metadatos: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProductMetadata {
    #[serde(default)]
    pub descripcion: Option<String>,
    #[serde(default)]
    pub periodicidad: Option<String>,
    #[serde(default)]
    pub copyright: Option<String>,
    #[serde(default)]
    pub campos: Vec<Campo>,
}

#[derive(Debug, Deserialize)]
pub struct Campo {
    pub id: String,
    #[serde(default)]
    pub tipo_datos: Option<String>,
}

impl ProductMetadata {
    pub fn schema(&self) -> FieldTypes {
        self.campos
            .iter()
            .map(|c| {
                let kind = c.tipo_datos.clone().unwrap_or_else(|| "string".to_string());
                (c.id.clone(), kind)
            })
            .collect()
    }
}

pub fn parse_envelope(text: &str) -> Result<Envelope, ConnectorError> {
    serde_json::from_str(text)
        .map_err(|e| ConnectorError::SchemaMismatch(format!("AEMET envelope: {}", e)))
}

pub fn parse_metadata(text: &str) -> Result<ProductMetadata, ConnectorError> {
    serde_json::from_str(text)
        .map_err(|e| ConnectorError::SchemaMismatch(format!("AEMET metadata: {}", e)))
}

/// Map the envelope's `estado` the same way as an HTTP status.
pub fn check_estado(envelope: &Envelope, url: &str) -> Result<(), ConnectorError> {
    if envelope.estado == 200 {
        return Ok(());
    }
    let detail = envelope.descripcion.as_deref().unwrap_or_default();
    Err(match StatusCode::from_u16(envelope.estado) {
        Ok(status) => status_error(status, url, detail),
        Err(_) => ConnectorError::Unreachable(format!(
            "{} returned estado {}: {}",
            url, envelope.estado, detail
        )),
    })
}
