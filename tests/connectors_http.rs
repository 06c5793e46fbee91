//! End-to-end tests of the built-in connectors against mock upstream
//! servers bound to ephemeral localhost ports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use data_discovery::config::Config;
use data_discovery::discovery::DiscoveryService;
use data_discovery::error::ConnectorError;
use data_discovery::models::ConnectorStatus;
use data_discovery::traits::ConnectorRegistry;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Bind a listener, build the app with the server's own base URL, and
/// serve it in the background.
async fn serve<F>(build: F) -> String
where
    F: FnOnce(String) -> Router,
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = build(base.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

async fn refreshed(config_toml: &str) -> (DiscoveryService, data_discovery::models::RefreshReport) {
    let cfg: Config = toml::from_str(config_toml).unwrap();
    data_discovery::config::validate(&cfg).unwrap();
    let registry = ConnectorRegistry::from_config(&cfg).unwrap();
    let service = DiscoveryService::new(&cfg, registry);
    service.open().await.unwrap();
    let report = service.refresh().await.unwrap();
    (service, report)
}

// ─── INE ────────────────────────────────────────────────────────────

fn ine_app() -> Router {
    Router::new()
        .route(
            "/OPERACIONES_DISPONIBLES",
            get(|| async {
                Json(json!([
                    {"Id": 25, "Cod_IOE": "30138", "Nombre": "Índice de Precios de Consumo (IPC)", "Codigo": "IPC"},
                    {"Id": 30, "Cod_IOE": "30308", "Nombre": "Encuesta de Población Activa", "Codigo": "EPA"},
                ]))
            }),
        )
        .route(
            "/VARIABLES_OPERACION/{key}",
            get(|Path(key): Path<String>| async move {
                if key == "IPC" {
                    Json(json!([
                        {"Id": 3, "Nombre": "Tipo de dato", "Codigo": ""},
                        {"Id": 115, "Nombre": "Provincias", "Tipo": "category"},
                    ]))
                    .into_response()
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }),
        )
}

#[tokio::test]
async fn ine_lists_operations_with_schemas() {
    let base = serve(|_| ine_app()).await;
    let (service, report) = refreshed(&format!(
        r#"
[connectors.ine.es]
base_url = "{}"
"#,
        base
    ))
    .await;

    assert_eq!(
        report.status_of("ine:es"),
        Some(&ConnectorStatus::Succeeded { datasets: 2 })
    );

    let ipc = service.get("ine:es/IPC").unwrap();
    assert_eq!(ipc.name, "Índice de Precios de Consumo (IPC)");
    assert_eq!(ipc.endpoint, format!("{}/DATOS_SERIE/IPC", base));
    assert_eq!(ipc.schema["Provincias"], "category");
    assert_eq!(ipc.schema["Tipo de dato"], "string");
    assert_eq!(ipc.rate_limit, Some(100));

    // Variables lookup failed: generic series schema.
    let epa = service.get("ine:es/EPA").unwrap();
    assert_eq!(epa.schema.len(), 2);
    assert_eq!(epa.schema["value"], "float");

    assert_eq!(service.search("precios").unwrap()[0].id, "ine:es/IPC");
}

#[tokio::test]
async fn exhausted_rate_limit_fails_the_connector() {
    let base = serve(|_| ine_app()).await;
    let (_service, report) = refreshed(&format!(
        r#"
[discovery]
rate_limit_wait_secs = 0

[connectors.ine.es]
base_url = "{}"
requests_per_window = 1
window_secs = 60
"#,
        base
    ))
    .await;

    assert!(matches!(
        report.status_of("ine:es"),
        Some(ConnectorStatus::Failed(ConnectorError::RateLimited(_)))
    ));
    assert_eq!(report.catalog_size, 0);
}

#[tokio::test]
async fn upstream_429_is_rate_limited_and_5xx_unreachable() {
    let base = serve(|_| {
        Router::new()
            .route(
                "/busy/OPERACIONES_DISPONIBLES",
                get(|| async { StatusCode::TOO_MANY_REQUESTS }),
            )
            .route(
                "/down/OPERACIONES_DISPONIBLES",
                get(|| async { StatusCode::BAD_GATEWAY }),
            )
    })
    .await;
    let (_service, report) = refreshed(&format!(
        r#"
[connectors.ine.busy]
base_url = "{base}/busy"

[connectors.ine.down]
base_url = "{base}/down"
"#
    ))
    .await;

    assert!(matches!(
        report.status_of("ine:busy"),
        Some(ConnectorStatus::Failed(ConnectorError::RateLimited(_)))
    ));
    assert!(matches!(
        report.status_of("ine:down"),
        Some(ConnectorStatus::Failed(ConnectorError::Unreachable(_)))
    ));
}

// ─── AEMET ──────────────────────────────────────────────────────────

/// Hands out a fresh temporary link pair on every envelope request, the
/// way AEMET does.
fn aemet_app(base: String) -> Router {
    let issued = Arc::new(AtomicUsize::new(0));
    Router::new()
        .route(
            "/valores/climatologicos/inventarioestaciones/todasestaciones",
            get(move |headers: HeaderMap| {
                let base = base.clone();
                let n = issued.fetch_add(1, Ordering::SeqCst);
                async move {
                    if headers.get("api_key").and_then(|v| v.to_str().ok()) != Some("secret") {
                        return Json(json!({"descripcion": "API key invalido", "estado": 401}));
                    }
                    Json(json!({
                        "descripcion": "exito",
                        "estado": 200,
                        "datos": format!("{}/sh/datos/{}", base, n),
                        "metadatos": format!("{}/sh/meta/{}", base, n),
                    }))
                }
            }),
        )
        .route(
            "/sh/meta/{n}",
            get(|| async {
                Json(json!({
                    "unidad_generadora": "Banco Nacional de Datos Climatológicos",
                    "periodicidad": "1 vez al día",
                    "descripcion": "Inventario de estaciones climatológicas",
                    "copyright": "© AEMET",
                    "campos": [
                        {"id": "indicativo", "tipo_datos": "string"},
                        {"id": "altitud", "tipo_datos": "float"},
                    ]
                }))
            }),
        )
}

#[tokio::test]
async fn aemet_follows_envelope_to_metadata() {
    let base = serve(aemet_app).await;
    let (service, report) = refreshed(&format!(
        r#"
[connectors.aemet.es]
base_url = "{}"
api_key = "secret"
products = ["valores/climatologicos/inventarioestaciones/todasestaciones"]
"#,
        base
    ))
    .await;

    assert_eq!(
        report.status_of("aemet:es"),
        Some(&ConnectorStatus::Succeeded { datasets: 1 })
    );
    let entry = service
        .get("aemet:es/valores/climatologicos/inventarioestaciones/todasestaciones")
        .unwrap();
    assert_eq!(entry.name, "Inventario de estaciones climatológicas");
    assert_eq!(entry.update_frequency.as_deref(), Some("1 vez al día"));
    assert_eq!(entry.schema["altitud"], "float");
    assert!(entry.extra.is_empty());

    // New temporary links, same product: nothing changed.
    let again = service.force_refresh().await.unwrap();
    assert_eq!(
        again.status_of("aemet:es"),
        Some(&ConnectorStatus::Succeeded { datasets: 1 })
    );
    assert_eq!((again.added, again.updated, again.unchanged), (0, 0, 1));
}

#[tokio::test]
async fn aemet_rejected_key_is_auth_failure() {
    let base = serve(aemet_app).await;
    let (_service, report) = refreshed(&format!(
        r#"
[connectors.aemet.es]
base_url = "{}"
api_key = "wrong"
products = ["valores/climatologicos/inventarioestaciones/todasestaciones"]
"#,
        base
    ))
    .await;

    assert!(matches!(
        report.status_of("aemet:es"),
        Some(ConnectorStatus::Failed(ConnectorError::AuthFailed(_)))
    ));
}

// ─── Eurostat ───────────────────────────────────────────────────────

const TOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nt:tree xmlns:nt="urn:eu.europa.ec.eurostat.navtree">
  <nt:branch>
    <nt:title language="en">Economy</nt:title>
    <nt:children>
      <nt:leaf type="dataset">
        <nt:title language="en">GDP and main components</nt:title>
        <nt:code>nama_10_gdp</nt:code>
        <nt:lastUpdate>09.04.2024</nt:lastUpdate>
      </nt:leaf>
      <nt:leaf type="dataset">
        <nt:title language="en">HICP - monthly data (index)</nt:title>
        <nt:code>prc_hicp_midx</nt:code>
      </nt:leaf>
    </nt:children>
  </nt:branch>
</nt:tree>"#;

#[tokio::test]
async fn eurostat_reads_toc_and_dimensions() {
    let base = serve(|_| {
        Router::new()
            .route("/catalogue/toc/xml", get(|| async { TOC }))
            .route(
                "/statistics/1.0/data/{code}",
                get(|Path(code): Path<String>| async move {
                    Json(json!({
                        "version": "2.0",
                        "class": "dataset",
                        "label": code,
                        "id": ["freq", "unit", "geo", "time"],
                        "size": [1, 1, 27, 1],
                    }))
                }),
            )
    })
    .await;
    let (service, report) = refreshed(&format!(
        r#"
[connectors.eurostat.eu]
base_url = "{}"
include_codes = ["nama_*"]
"#,
        base
    ))
    .await;

    assert_eq!(
        report.status_of("eurostat:eu"),
        Some(&ConnectorStatus::Succeeded { datasets: 1 })
    );
    let gdp = service.get("eurostat:eu/nama_10_gdp").unwrap();
    assert_eq!(gdp.name, "GDP and main components");
    assert_eq!(gdp.schema["time"], "datetime");
    assert_eq!(gdp.schema["geo"], "string");
    assert_eq!(gdp.schema["value"], "float");
    assert!(gdp.last_updated.is_some());
    assert!(service.get("eurostat:eu/prc_hicp_midx").is_err());
}

// ─── Climate ────────────────────────────────────────────────────────

/// Minimal CDF-1 header: one dimension, a `title` attribute, one float variable.
fn netcdf_header() -> Vec<u8> {
    fn word(out: &mut Vec<u8>, n: u32) {
        out.extend_from_slice(&n.to_be_bytes());
    }
    fn padded(out: &mut Vec<u8>, s: &str) {
        word(out, s.len() as u32);
        out.extend_from_slice(s.as_bytes());
        out.resize(out.len() + (4 - s.len() % 4) % 4, 0);
    }

    let mut out = b"CDF\x01".to_vec();
    word(&mut out, 0); // numrecs
    word(&mut out, 0x0A); // dimensions
    word(&mut out, 1);
    padded(&mut out, "time");
    word(&mut out, 0);
    word(&mut out, 0x0C); // global attributes
    word(&mut out, 1);
    padded(&mut out, "title");
    word(&mut out, 2); // NC_CHAR
    padded(&mut out, "Surface air temperature");
    word(&mut out, 0x0B); // variables
    word(&mut out, 1);
    padded(&mut out, "tas");
    word(&mut out, 1);
    word(&mut out, 0); // dimid
    word(&mut out, 0); // ABSENT attributes
    word(&mut out, 0);
    word(&mut out, 5); // NC_FLOAT
    word(&mut out, 4); // vsize
    word(&mut out, 0); // begin
    out
}

#[tokio::test]
async fn climate_decodes_netcdf_headers() {
    let base = serve(|_| {
        Router::new()
            .route(
                "/tas.nc",
                get(|headers: HeaderMap| async move {
                    let authorized = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        == Some("Bearer climate-key");
                    let ranged = headers.get("range").and_then(|v| v.to_str().ok())
                        == Some("bytes=0-1023");
                    if !authorized {
                        return StatusCode::UNAUTHORIZED.into_response();
                    }
                    if !ranged {
                        return StatusCode::BAD_REQUEST.into_response();
                    }
                    let mut body = netcdf_header();
                    body.extend_from_slice(&[0u8; 64]);
                    (StatusCode::PARTIAL_CONTENT, body).into_response()
                }),
            )
            .route("/broken.nc", get(|| async { "<html>not netcdf</html>" }))
    })
    .await;

    let (service, report) = refreshed(&format!(
        r#"
[connectors.climate.good]
base_url = "{base}"
api_key = "climate-key"
files = ["tas.nc"]
header_bytes = 1024

[connectors.climate.bad]
base_url = "{base}"
api_key = "climate-key"
files = ["broken.nc"]
header_bytes = 1024

[connectors.climate.nokey]
base_url = "{base}"
api_key_env = "DATA_DISCOVERY_TEST_NO_SUCH_KEY"
files = ["tas.nc"]
"#
    ))
    .await;

    let tas = service.get("climate:good/tas.nc").unwrap();
    assert_eq!(tas.name, "Surface air temperature");
    assert_eq!(tas.schema["tas"], "float");
    assert!(matches!(
        report.status_of("climate:bad"),
        Some(ConnectorStatus::Failed(ConnectorError::SchemaMismatch(_)))
    ));
    assert!(matches!(
        report.status_of("climate:nokey"),
        Some(ConnectorStatus::Failed(ConnectorError::AuthFailed(_)))
    ));
}

/// A server that ignores `Range`, answers 200 and never ends the body.
async fn serve_endless_netcdf() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                let head = "HTTP/1.1 200 OK\r\nContent-Type: application/x-netcdf\r\nConnection: close\r\n\r\n";
                if socket.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                if socket.write_all(&netcdf_header()).await.is_err() {
                    return;
                }
                let filler = [0u8; 8192];
                while socket.write_all(&filler).await.is_ok() {}
            });
        }
    });
    base
}

#[tokio::test]
async fn climate_stops_reading_after_header_bytes() {
    let base = serve_endless_netcdf().await;
    let (service, report) = refreshed(&format!(
        r#"
[discovery]
connector_timeout_secs = 5

[connectors.climate.full]
base_url = "{base}"
api_key = "climate-key"
files = ["tas.nc"]
header_bytes = 1024
"#
    ))
    .await;

    assert_eq!(
        report.status_of("climate:full"),
        Some(&ConnectorStatus::Succeeded { datasets: 1 })
    );
    assert_eq!(
        service.get("climate:full/tas.nc").unwrap().name,
        "Surface air temperature"
    );
}
