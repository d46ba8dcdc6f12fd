//! System, health, and client configuration endpoints.

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use speedtest_service::stream::{DEFAULT_MIN_CHUNK_SIZE, MAX_PARALLELISM};

use crate::state::AppState;
use crate::types::{ConfigResponse, HealthResponse, VersionResponse};

pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check server health.
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse),
    ),
    tag = "System"
)]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        version: VERSION.to_string(),
        uptime_seconds: state.uptime_secs(),
    })
}

/// Get the server version.
#[utoipa::path(
    get,
    path = "/version",
    responses(
        (status = 200, description = "Server version", body = VersionResponse),
    ),
    tag = "System"
)]
pub async fn version() -> impl IntoResponse {
    Json(VersionResponse {
        version: VERSION.to_string(),
    })
}

/// Get the limits clients need to plan their tests.
#[utoipa::path(
    get,
    path = "/config",
    responses(
        (status = 200, description = "Test limits", body = ConfigResponse),
    ),
    tag = "System"
)]
pub async fn client_config(State(state): State<AppState>) -> impl IntoResponse {
    let limits = state.download_limits();
    Json(ConfigResponse {
        default_download_size: limits.default_size,
        max_download_size: limits.max_size,
        max_upload_size: state.upload_max_size(),
        max_parallelism: MAX_PARALLELISM,
        min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
        version: VERSION.to_string(),
    })
}

/// Prometheus-compatible metrics endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics().render(&state.gauges());

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}
