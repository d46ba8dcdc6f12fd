//! HTTP application state: wraps `ServiceState` with HTTP-specific fields.
//!
//! `AppState` provides transparent access to all `ServiceState` methods
//! via `Deref`, and adds transport-specific config like CORS origins and
//! whether the admin API is mounted.

use std::ops::Deref;
use std::sync::Arc;

use speedtest_service::{ServiceConfig, ServiceState};

/// Shared HTTP application state, cloneable across handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

struct AppInner {
    service: ServiceState,
    cors_origins: Vec<String>,
    enable_admin: bool,
}

impl Deref for AppState {
    type Target = ServiceState;

    fn deref(&self) -> &ServiceState {
        &self.inner.service
    }
}

impl AppState {
    pub fn new(service: ServiceState, cors_origins: Vec<String>, enable_admin: bool) -> Self {
        Self {
            inner: Arc::new(AppInner {
                service,
                cors_origins,
                enable_admin,
            }),
        }
    }

    /// Creates a state from a service config with no CORS and the admin API
    /// mounted (for tests and ephemeral use).
    pub fn for_testing(config: &ServiceConfig) -> Self {
        Self::new(ServiceState::new(config), vec![], true)
    }

    pub fn cors_origins(&self) -> &[String] {
        &self.inner.cors_origins
    }

    pub fn admin_enabled(&self) -> bool {
        self.inner.enable_admin
    }

    /// Returns a reference to the underlying service state.
    pub fn service(&self) -> &ServiceState {
        &self.inner.service
    }
}
