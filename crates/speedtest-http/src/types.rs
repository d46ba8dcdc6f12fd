//! Request and response bodies for the HTTP API.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use speedtest_service::rate_limit::LimiterStats;

// ---------------------------------------------------------------------------
// Speed tests
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, ToSchema)]
pub struct PingResponse {
    /// Server time in Unix nanoseconds.
    pub timestamp: i64,
}

/// Download shape. Unparseable values fall back to defaults.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DownloadQuery {
    /// Payload size in bytes (default 50 MiB, clamped to the server maximum).
    #[param(value_type = Option<u64>)]
    pub size: Option<String>,
    /// Generation workers, 1 to 10. Values above 1 produce framed chunks.
    #[param(value_type = Option<usize>)]
    pub parallel: Option<String>,
    /// Minimum chunk size in bytes (default 1 MiB).
    #[param(value_type = Option<u64>)]
    pub min_chunk: Option<String>,
}

impl DownloadQuery {
    pub fn size(&self) -> Option<u64> {
        parse(self.size.as_deref())
    }

    pub fn parallel(&self) -> Option<usize> {
        parse(self.parallel.as_deref())
    }

    pub fn min_chunk(&self) -> Option<u64> {
        parse(self.min_chunk.as_deref())
    }
}

fn parse<T: std::str::FromStr>(value: Option<&str>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct UploadResponse {
    pub bytes_received: u64,
}

/// Reply to every WebSocket message.
#[derive(Serialize, Deserialize)]
pub struct WsEcho {
    /// Server time in Unix nanoseconds.
    pub timestamp: i64,
    /// The received message, decoded as UTF-8 (lossy for binary frames).
    pub echo: String,
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    /// RFC 3339 server time.
    pub time: String,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct VersionResponse {
    pub version: String,
}

/// Limits a client needs to plan its tests.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ConfigResponse {
    pub default_download_size: u64,
    pub max_download_size: u64,
    pub max_upload_size: u64,
    pub max_parallelism: usize,
    pub min_chunk_size: u64,
    pub version: String,
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

#[derive(Serialize, ToSchema)]
pub struct SystemInfo {
    /// RFC 3339 server time.
    pub server_time: String,
    pub uptime_seconds: u64,
    pub active_tests: u64,
    pub in_flight_requests: usize,
    pub admission_capacity: usize,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub cpu_count: usize,
    pub limiter: LimiterStats,
}

/// Replacement limiter settings. A limit of 0 disables that check.
#[derive(Debug, Deserialize, ToSchema)]
pub struct LimitsRequest {
    pub global_limit: usize,
    pub per_client_limit: usize,
    pub time_window_seconds: u64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct WhitelistResponse {
    pub client: String,
    pub whitelisted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_query_is_lenient() {
        let query = DownloadQuery {
            size: Some(" 1000 ".to_string()),
            parallel: Some("four".to_string()),
            min_chunk: None,
        };
        assert_eq!(query.size(), Some(1000));
        assert_eq!(query.parallel(), None);
        assert_eq!(query.min_chunk(), None);
    }
}
