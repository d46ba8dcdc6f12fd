//! Server configuration via CLI args and environment variables.

use std::time::Duration;

use clap::Parser;

use speedtest_service::ServiceConfig;
use speedtest_service::error::ServiceError;
use speedtest_service::rate_limit::{LimiterConfig, RetentionPolicy};
use speedtest_service::stream::DownloadLimits;

const MIB: u64 = 1024 * 1024;

/// Self-hosted network throughput measurement server.
#[derive(Parser, Debug, Clone)]
#[command(name = "speedtest-server", version, about)]
pub struct Config {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0", env = "SPEEDTEST_HOST")]
    pub host: String,

    /// Bind port.
    #[arg(long, default_value_t = 8080, env = "SPEEDTEST_PORT")]
    pub port: u16,

    /// Log level (overridden by RUST_LOG).
    #[arg(long, default_value = "info", env = "SPEEDTEST_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format: "text" or "json".
    #[arg(long, default_value = "text", env = "SPEEDTEST_LOG_FORMAT")]
    pub log_format: String,

    /// CORS allowed origins (comma-separated). Empty for no CORS, "*" for any.
    #[arg(long, env = "SPEEDTEST_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Maximum simultaneously in-flight speed test requests (0 = unlimited).
    #[arg(long, default_value_t = 100, env = "SPEEDTEST_MAX_CONCURRENT_REQUESTS")]
    pub max_concurrent_requests: usize,

    /// Requests allowed across all clients per window (0 = disabled).
    #[arg(long, default_value_t = 1000, env = "SPEEDTEST_RATE_LIMIT_GLOBAL")]
    pub rate_limit_global: usize,

    /// Requests allowed per client per window (0 = disabled).
    #[arg(long, default_value_t = 100, env = "SPEEDTEST_RATE_LIMIT_PER_CLIENT")]
    pub rate_limit_per_client: usize,

    /// Rate limit window in seconds.
    #[arg(long, default_value_t = 60, env = "SPEEDTEST_RATE_LIMIT_WINDOW")]
    pub rate_limit_window: u64,

    /// Seconds an idle client record is kept before the reaper removes it.
    #[arg(long, default_value_t = 86_400, env = "SPEEDTEST_CLIENT_RETENTION")]
    pub client_retention: u64,

    /// Seconds between reaper passes.
    #[arg(long, default_value_t = 600, env = "SPEEDTEST_REAPER_INTERVAL")]
    pub reaper_interval: u64,

    /// Client identifiers exempt from the per-client limit (comma-separated).
    #[arg(long, env = "SPEEDTEST_WHITELIST", value_delimiter = ',')]
    pub whitelist: Vec<String>,

    /// Download size in bytes when the client names none.
    #[arg(long, default_value_t = 50 * MIB, env = "SPEEDTEST_DOWNLOAD_DEFAULT_SIZE")]
    pub download_default_size: u64,

    /// Largest download in bytes.
    #[arg(long, default_value_t = 100 * MIB, env = "SPEEDTEST_DOWNLOAD_MAX_SIZE")]
    pub download_max_size: u64,

    /// Largest upload body in bytes.
    #[arg(long, default_value_t = 100 * MIB, env = "SPEEDTEST_UPLOAD_MAX_SIZE")]
    pub upload_max_size: u64,

    /// Download time limit in seconds (0 = disabled).
    #[arg(long, default_value_t = 120, env = "SPEEDTEST_DOWNLOAD_TIMEOUT")]
    pub download_timeout: u64,

    /// Depth of the background event queue.
    #[arg(long, default_value_t = 1024, env = "SPEEDTEST_EVENT_QUEUE_CAPACITY")]
    pub event_queue_capacity: usize,

    /// Mount the admin API under /admin/api.
    #[arg(long, env = "SPEEDTEST_ENABLE_ADMIN")]
    pub enable_admin: bool,
}

impl Config {
    /// Parses configuration from CLI args and env vars.
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// The service-layer subset of this config.
    pub fn service_config(&self) -> Result<ServiceConfig, ServiceError> {
        let limiter = LimiterConfig {
            global_limit: self.rate_limit_global,
            per_client_limit: self.rate_limit_per_client,
            time_window: Duration::from_secs(self.rate_limit_window),
        };
        limiter.validate()?;

        if self.reaper_interval == 0 {
            return Err(ServiceError::InvalidConfig(
                "reaper interval must be at least one second".to_string(),
            ));
        }

        let whitelist = self
            .whitelist
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();

        Ok(ServiceConfig {
            limiter,
            retention: RetentionPolicy {
                retention: Duration::from_secs(self.client_retention),
                interval: Duration::from_secs(self.reaper_interval),
            },
            max_concurrent_requests: self.max_concurrent_requests,
            download: DownloadLimits {
                default_size: self.download_default_size,
                max_size: self.download_max_size,
            },
            upload_max_size: self.upload_max_size,
            download_timeout: self.download_timeout,
            event_queue_capacity: self.event_queue_capacity,
            whitelist,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_defaults() {
        let config = Config::try_parse_from(["speedtest-server"]).unwrap();
        let service = config.service_config().unwrap();
        let defaults = ServiceConfig::default();

        assert_eq!(config.port, 8080);
        assert!(!config.enable_admin);
        assert_eq!(service.limiter, defaults.limiter);
        assert_eq!(service.retention, defaults.retention);
        assert_eq!(service.download, defaults.download);
        assert_eq!(service.max_concurrent_requests, defaults.max_concurrent_requests);
        assert_eq!(service.upload_max_size, defaults.upload_max_size);
    }

    #[test]
    fn lists_are_comma_separated() {
        let config = Config::try_parse_from([
            "speedtest-server",
            "--whitelist",
            "10.0.0.1, 10.0.0.2",
            "--cors-origins",
            "https://a.example,https://b.example",
        ])
        .unwrap();

        assert_eq!(config.cors_origins.len(), 2);
        assert_eq!(
            config.service_config().unwrap().whitelist,
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
        );
    }

    #[test]
    fn zero_window_is_rejected() {
        let config =
            Config::try_parse_from(["speedtest-server", "--rate-limit-window", "0"]).unwrap();
        assert!(config.service_config().is_err());
    }
}
