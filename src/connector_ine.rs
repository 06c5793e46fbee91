//! INE (Spanish National Statistics Institute) connector.
//!
//! Lists the statistical operations published through the INE Tempus JSON
//! API and turns each one into a dataset entry. No authentication.
//!
//! # Requests
//!
//! | Request | Purpose |
//! |---------|---------|
//! | `GET {base}/OPERACIONES_DISPONIBLES` | operation list (bare array or `{"operaciones": [...]}`) |
//! | `GET {base}/VARIABLES_OPERACION/{key}` | variables of one operation → schema |
//!
//! The operation key is the first of `Codigo`, `Cod_IOE`, `Id` that is set.
//! When the variables lookup fails the entry still gets the generic time
//! series schema `{date: datetime, value: float}`.
//!
//! # Configuration
//!
//! ```toml
//! [connectors.ine.es]
//! # base_url = "https://servicios.ine.es/wstempus/js/ES"
//! # requests_per_window = 100
//! # window_secs = 60
//! max_datasets = 50
//! ```

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::config::{ConnectorConfig, IneConnectorConfig, SourceDefaults};
use crate::error::ConnectorError;
use crate::http::HttpSource;
use crate::models::{dataset_id, DatasetMetadata, FieldTypes};
use crate::rate_limit::RateLimiter;
use crate::traits::{Connector, FetchContext};

pub const DEFAULTS: SourceDefaults = SourceDefaults {
    base_url: "https://servicios.ine.es/wstempus/js/ES",
    requests_per_window: 100,
    window_secs: 60,
    api_key_env: None,
};

pub struct IneConnector {
    name: String,
    http: HttpSource,
}

impl IneConnector {
    pub fn new(name: String, config: &IneConnectorConfig) -> Result<Self> {
        let http = HttpSource::new(format!("ine:{}", name), config.source.resolve(DEFAULTS))?;
        Ok(Self { name, http })
    }

    async fn schema_for(&self, ctx: &FetchContext, key: &str) -> Result<FieldTypes, ConnectorError> {
        let url = self.http.url(&format!("VARIABLES_OPERACION/{}", key));
        match self.http.get_json::<Value>(ctx, &url, HeaderMap::new()).await {
            Ok(body) => {
                let schema = parse_variables(&body);
                Ok(if schema.is_empty() { fallback_schema() } else { schema })
            }
            // Losing credentials or budget affects every later request too.
            Err(e @ (ConnectorError::AuthFailed(_) | ConnectorError::RateLimited(_))) => Err(e),
            Err(e) => {
                tracing::debug!(source = %self.source_label(), key, error = %e, "variables lookup failed, using fallback schema");
                Ok(fallback_schema())
            }
        }
    }
}

#[async_trait]
impl Connector for IneConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Statistical operations from the INE Tempus API"
    }

    fn connector_type(&self) -> &str {
        "ine"
    }

    fn config(&self) -> &ConnectorConfig {
        self.http.config()
    }

    fn rate_limiter(&self) -> &RateLimiter {
        self.http.limiter()
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<DatasetMetadata>, ConnectorError> {
        let source = self.source_label();
        let url = self.http.url("OPERACIONES_DISPONIBLES");
        let body: Value = self.http.get_json(ctx, &url, HeaderMap::new()).await?;

        let mut operations = parse_operations(&body)?;
        if let Some(max) = self.config().max_datasets {
            operations.truncate(max);
        }

        let mut datasets = Vec::with_capacity(operations.len());
        for op in operations {
            let schema = self.schema_for(ctx, &op.key).await?;
            let endpoint = self.http.url(&format!("DATOS_SERIE/{}", op.key));
            let mut meta = DatasetMetadata::new(
                dataset_id(&source, Some(&op.key), &endpoint),
                op.name,
                source.clone(),
                endpoint,
                ctx.fetched_at,
            )
            .with_schema(schema);
            meta.description = op.description;
            meta.tags = vec!["statistics".to_string()];
            meta.rate_limit = Some(self.config().requests_per_window);
            datasets.push(meta);
        }

        tracing::debug!(source = %source, datasets = datasets.len(), "ine listing parsed");
        Ok(datasets)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Response parsing
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct IneOperation {
    pub key: String,
    pub name: String,
    pub description: Option<String>,
}

/// The generic INE series shape, used when variables are unavailable.
pub fn fallback_schema() -> FieldTypes {
    FieldTypes::from([
        ("date".to_string(), "datetime".to_string()),
        ("value".to_string(), "float".to_string()),
    ])
}

/// Parse the `OPERACIONES_DISPONIBLES` body. Items without a usable key are
/// dropped.
pub fn parse_operations(body: &Value) -> Result<Vec<IneOperation>, ConnectorError> {
    let items = list_field(body, "operaciones").ok_or_else(|| {
        ConnectorError::SchemaMismatch(
            "OPERACIONES_DISPONIBLES: expected an array or an object with 'operaciones'".into(),
        )
    })?;

    Ok(items
        .iter()
        .filter_map(|item| {
            let key = ["Codigo", "Cod_IOE", "Id"]
                .iter()
                .find_map(|field| scalar_string(item.get(field)?))?;
            let name = item
                .get("Nombre")
                .and_then(scalar_string)
                .unwrap_or_else(|| key.clone());
            let description = item.get("Descripcion").and_then(scalar_string);
            Some(IneOperation {
                key,
                name,
                description,
            })
        })
        .collect())
}

/// Parse `VARIABLES_OPERACION` into `variable → Tipo`.
pub fn parse_variables(body: &Value) -> FieldTypes {
    let Some(items) = list_field(body, "variables") else {
        return FieldTypes::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let field = item
                .get("Nombre")
                .and_then(scalar_string)
                .or_else(|| item.get("Id").and_then(scalar_string))?;
            let kind = item
                .get("Tipo")
                .and_then(scalar_string)
                .unwrap_or_else(|| "string".to_string());
            Some((field, kind))
        })
        .collect()
}

fn list_field<'a>(body: &'a Value, wrapper: &str) -> Option<&'a Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get(wrapper).and_then(Value::as_array),
        _ => None,
    }
}

/// Non-empty string or number rendered as a string.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
