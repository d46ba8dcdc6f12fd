//! Speedtest Server - self-hosted network throughput measurement.
//!
//! The admission and generation core lives in `speedtest-service`; the
//! HTTP and WebSocket surface lives in `speedtest-http`. This crate adds
//! configuration and process lifecycle.

pub mod config;

pub use speedtest_http::{AppState, router, serve};
pub use speedtest_service::{ServiceConfig, ServiceState};

/// Builds the HTTP application state from the parsed config.
pub fn app_state(
    config: &config::Config,
) -> Result<AppState, speedtest_service::error::ServiceError> {
    let service = ServiceState::new(&config.service_config()?);
    Ok(AppState::new(
        service,
        config.cors_origins.clone(),
        config.enable_admin,
    ))
}
