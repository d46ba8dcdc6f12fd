//! Admin endpoints: limiter introspection, whitelist and limit management.
//!
//! Mounted only when the admin API is enabled.

use std::time::Duration;

use axum::extract::{Json, Path, State};
use sysinfo::System;

use speedtest_service::rate_limit::{LimiterConfig, LimiterStats};

use crate::error::ApiError;
use crate::state::AppState;
use crate::types::{LimitsRequest, SystemInfo, WhitelistResponse};

/// Get client limiter statistics.
#[utoipa::path(
    get,
    path = "/admin/api/limiter",
    responses(
        (status = 200, description = "Limiter statistics", body = LimiterStats),
    ),
    tag = "Admin"
)]
pub async fn limiter_stats(State(state): State<AppState>) -> Json<LimiterStats> {
    Json(state.limiter().stats())
}

/// Get server and host information.
///
/// Includes uptime, running tests, admission slot usage, host memory, and
/// limiter statistics.
#[utoipa::path(
    get,
    path = "/admin/api/system",
    responses(
        (status = 200, description = "System information", body = SystemInfo),
    ),
    tag = "Admin"
)]
pub async fn system_info(State(state): State<AppState>) -> Json<SystemInfo> {
    let mut sys = System::new();
    sys.refresh_memory();

    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let limiter = state.limiter().stats();
    Json(SystemInfo {
        server_time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        uptime_seconds: state.uptime_secs(),
        active_tests: limiter.total_active_tests,
        in_flight_requests: state.gate().in_flight(),
        admission_capacity: state.gate().capacity(),
        total_memory_bytes: sys.total_memory(),
        used_memory_bytes: sys.used_memory(),
        cpu_count,
        limiter,
    })
}

/// Exempt a client from the per-client rate limit.
#[utoipa::path(
    put,
    path = "/admin/api/whitelist/{client}",
    params(
        ("client" = String, Path, description = "Client identifier (usually an IP address)"),
    ),
    responses(
        (status = 200, description = "Client whitelisted", body = WhitelistResponse),
    ),
    tag = "Admin"
)]
pub async fn whitelist_add(
    State(state): State<AppState>,
    Path(client): Path<String>,
) -> Json<WhitelistResponse> {
    state.limiter().add_to_whitelist(&client);
    tracing::info!(%client, "Client whitelisted");
    Json(WhitelistResponse {
        client,
        whitelisted: true,
    })
}

/// Remove a client from the whitelist.
#[utoipa::path(
    delete,
    path = "/admin/api/whitelist/{client}",
    params(
        ("client" = String, Path, description = "Client identifier"),
    ),
    responses(
        (status = 200, description = "Client removed", body = WhitelistResponse),
        (status = 404, description = "Client was not whitelisted", body = crate::error::ErrorBody),
    ),
    tag = "Admin"
)]
pub async fn whitelist_remove(
    State(state): State<AppState>,
    Path(client): Path<String>,
) -> Result<Json<WhitelistResponse>, ApiError> {
    if !state.limiter().remove_from_whitelist(&client) {
        return Err(ApiError::NotFound(format!("{client} is not whitelisted")));
    }
    tracing::info!(%client, "Client removed from whitelist");
    Ok(Json(WhitelistResponse {
        client,
        whitelisted: false,
    }))
}

/// Replace the limiter settings at runtime.
///
/// Decisions already made are unaffected; the next check uses the new values.
#[utoipa::path(
    put,
    path = "/admin/api/limits",
    request_body = LimitsRequest,
    responses(
        (status = 200, description = "Updated limiter statistics", body = LimiterStats),
        (status = 400, description = "Invalid limits", body = crate::error::ErrorBody),
    ),
    tag = "Admin"
)]
pub async fn update_limits(
    State(state): State<AppState>,
    Json(req): Json<LimitsRequest>,
) -> Result<Json<LimiterStats>, ApiError> {
    state.limiter().update_limits(LimiterConfig {
        global_limit: req.global_limit,
        per_client_limit: req.per_client_limit,
        time_window: Duration::from_secs(req.time_window_seconds),
    })?;
    Ok(Json(state.limiter().stats()))
}
