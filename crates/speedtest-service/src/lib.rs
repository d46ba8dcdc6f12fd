//! Speedtest Service: admission control and payload generation core.
//!
//! This crate contains all transport-agnostic logic of the speed test
//! server: the per-client sliding-window limiter, the global admission
//! gate, the parallel chunk generator with its streaming coordinator,
//! active-test accounting, metrics, and the bounded event dispatcher.
//!
//! Transport crates (`speedtest-http`) depend on this crate and provide
//! protocol-specific adapters.
//!
//! **Zero transport dependencies.** No axum, no hyper, no wire framing
//! beyond the chunk header.

pub mod admission;
pub mod error;
pub mod events;
pub mod metrics;
pub mod rate_limit;
pub mod session;
pub mod stream;
pub mod transport;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use admission::AdmissionGate;
use error::StreamError;
use events::{DEFAULT_QUEUE_CAPACITY, EventDispatcher, TestKind, TestOutcome};
use metrics::{Gauges, Metrics};
use rate_limit::{ClientLimiter, LimiterConfig, RetentionPolicy};
use session::TestSession;
use stream::{DownloadLimits, StreamParams, StreamSummary};
use transport::{Metered, Transport};

/// Largest accepted upload body by default (100 MiB).
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 100 * 1024 * 1024;

/// Configuration subset relevant to the service layer.
///
/// Transport-specific config (ports, CORS origins) stays in the binary
/// crate's `Config` struct.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub limiter: LimiterConfig,
    pub retention: RetentionPolicy,
    /// Admission slots (0 = gate disabled).
    pub max_concurrent_requests: usize,
    pub download: DownloadLimits,
    pub upload_max_size: u64,
    /// Download time limit in seconds (0 = disabled).
    pub download_timeout: u64,
    pub event_queue_capacity: usize,
    /// Client identifiers exempt from the per-client check.
    pub whitelist: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterConfig::default(),
            retention: RetentionPolicy::default(),
            max_concurrent_requests: 100,
            download: DownloadLimits::default(),
            upload_max_size: DEFAULT_UPLOAD_MAX_SIZE,
            download_timeout: 120,
            event_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            whitelist: Vec::new(),
        }
    }
}

/// Shared service state, cloneable across all transport handlers.
///
/// Built once at startup and handed to every call site. Owns the client
/// limiter and its reaper, the admission gate, and the event dispatcher.
#[derive(Clone)]
pub struct ServiceState {
    inner: Arc<Inner>,
}

struct Inner {
    limiter: ClientLimiter,
    gate: AdmissionGate,
    events: EventDispatcher,
    metrics: Metrics,
    download: DownloadLimits,
    upload_max_size: u64,
    download_timeout: Duration,
    start_time: Instant,
    /// Parent of every request-scoped token.
    requests: CancellationToken,
    /// Stops the reaper and the event worker.
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceState {
    /// Creates a new service state from config. Background tasks are not
    /// running until [`ServiceState::start`] is called.
    pub fn new(config: &ServiceConfig) -> Self {
        let limiter = ClientLimiter::new(config.limiter, config.retention);
        for client in &config.whitelist {
            limiter.add_to_whitelist(client);
        }

        Self {
            inner: Arc::new(Inner {
                limiter,
                gate: AdmissionGate::new(config.max_concurrent_requests),
                events: EventDispatcher::new(config.event_queue_capacity),
                metrics: Metrics::new(),
                download: config.download,
                upload_max_size: config.upload_max_size,
                download_timeout: Duration::from_secs(config.download_timeout),
                start_time: Instant::now(),
                requests: CancellationToken::new(),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    // --- Accessors ---

    pub fn limiter(&self) -> &ClientLimiter {
        &self.inner.limiter
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.inner.gate
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn download_limits(&self) -> &DownloadLimits {
        &self.inner.download
    }

    pub fn upload_max_size(&self) -> u64 {
        self.inner.upload_max_size
    }

    /// Download time limit, `None` when disabled.
    pub fn download_timeout(&self) -> Option<Duration> {
        let timeout = self.inner.download_timeout;
        (!timeout.is_zero()).then_some(timeout)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// A cancellation signal scoped to one request. Fires on
    /// [`ServiceState::cancel_requests`] and on shutdown.
    pub fn request_token(&self) -> CancellationToken {
        self.inner.requests.child_token()
    }

    // --- Lifecycle ---

    /// Starts the client reaper and the event worker.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        tasks.push(self.inner.limiter.spawn_reaper(self.inner.shutdown.clone()));
        if let Some(worker) = self.inner.events.spawn_worker(self.inner.shutdown.clone()) {
            tasks.push(worker);
        }
    }

    /// Ends in-flight downloads and WebSocket sessions. Background tasks keep
    /// running so their final events are still recorded.
    pub fn cancel_requests(&self) {
        self.inner.requests.cancel();
    }

    /// Cancels in-flight requests, stops background tasks, and waits for the
    /// event queue to drain.
    pub async fn shutdown(&self) {
        self.inner.requests.cancel();
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {e}");
            }
        }
        tracing::info!("Service stopped");
    }

    // --- Tests ---

    /// Marks a test as running for `client` until the session is dropped.
    pub fn begin_test(&self, kind: TestKind, client: &str) -> TestSession {
        TestSession::begin(self.clone(), kind, client)
    }

    /// Streams a synthetic download into `transport`, then reports the
    /// outcome and releases the session.
    pub async fn run_download<T: Transport>(
        &self,
        session: TestSession,
        params: StreamParams,
        transport: T,
    ) -> Result<StreamSummary, StreamError> {
        let cancel = self.request_token();
        let mut transport = Metered::new(transport);

        let result = {
            let fut = stream::generate_stream(params, &mut transport, &cancel);
            match self.download_timeout() {
                Some(limit) => tokio::time::timeout(limit, fut)
                    .await
                    .unwrap_or(Err(StreamError::TimedOut)),
                None => fut.await,
            }
        };

        let sent = transport.bytes_written();
        self.metrics().add_bytes_sent(sent);

        let outcome = match &result {
            Ok(_) => TestOutcome::Completed,
            Err(StreamError::Disconnected) => TestOutcome::Disconnected,
            Err(StreamError::Cancelled) => TestOutcome::Cancelled,
            Err(StreamError::TimedOut) => TestOutcome::TimedOut,
            Err(StreamError::Generation(_) | StreamError::Io(_)) => TestOutcome::Failed,
        };

        match &result {
            Ok(summary) => tracing::debug!(
                client = session.client(),
                bytes = summary.payload_bytes,
                chunks = summary.chunks,
                "Download complete",
            ),
            Err(e) if e.is_expected() => {
                tracing::debug!(client = session.client(), sent, "Download ended early: {e}");
            }
            Err(e) => tracing::error!(client = session.client(), sent, "Download failed: {e}"),
        }

        session.finish(outcome, sent);
        result
    }

    /// Samples live values for the metrics endpoint.
    pub fn gauges(&self) -> Gauges {
        let stats = self.inner.limiter.stats();
        Gauges {
            in_flight_requests: self.inner.gate.in_flight(),
            admission_capacity: self.inner.gate.capacity(),
            active_tests: stats.total_active_tests,
            tracked_clients: stats.total_clients,
            blocked_clients: stats.blocked_clients,
            dropped_events: self.inner.events.dropped(),
            uptime_seconds: self.uptime_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::FRAME_HEADER_LEN;
    use crate::transport::{ChannelTransport, WriterTransport};

    #[test]
    fn startup_whitelist_is_applied() {
        let state = ServiceState::new(&ServiceConfig {
            whitelist: vec!["127.0.0.1".to_string()],
            ..ServiceConfig::default()
        });
        assert!(state.limiter().is_whitelisted("127.0.0.1"));
        assert_eq!(state.limiter().stats().whitelist_count, 1);
    }

    #[test]
    fn zero_timeout_disables_limit() {
        let state = ServiceState::new(&ServiceConfig {
            download_timeout: 0,
            ..ServiceConfig::default()
        });
        assert_eq!(state.download_timeout(), None);
    }

    #[tokio::test]
    async fn download_releases_session_and_counts_bytes() {
        let state = ServiceState::new(&ServiceConfig::default());
        let session = state.begin_test(TestKind::Download, "c");
        let params = StreamParams::clamped(Some(2_000_000), Some(2), Some(1), state.download_limits());

        let summary = state
            .run_download(session, params, WriterTransport::new(Vec::new()))
            .await
            .unwrap();

        assert_eq!(summary.payload_bytes, 2_000_000);
        assert_eq!(state.limiter().active_tests("c"), 0);
        assert_eq!(
            state.metrics().bytes_sent(),
            2_000_000 + 2 * FRAME_HEADER_LEN as u64
        );
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_download() {
        let state = ServiceState::new(&ServiceConfig::default());
        state.start();

        let session = state.begin_test(TestKind::Download, "c");
        let params = StreamParams::clamped(Some(50_000_000), Some(1), None, state.download_limits());
        // Nobody reads, so the stream stalls on backpressure.
        let (transport, _rx) = ChannelTransport::channel(1);

        let task_state = state.clone();
        let download =
            tokio::spawn(async move { task_state.run_download(session, params, transport).await });

        tokio::task::yield_now().await;
        state.shutdown().await;

        let result = download.await.unwrap();
        assert!(matches!(result, Err(StreamError::Cancelled)));
        assert_eq!(state.limiter().active_tests("c"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_download_times_out() {
        let state = ServiceState::new(&ServiceConfig {
            download_timeout: 5,
            ..ServiceConfig::default()
        });
        let session = state.begin_test(TestKind::Download, "c");
        let params = StreamParams::clamped(Some(1_000_000), Some(1), None, state.download_limits());
        let (transport, _rx) = ChannelTransport::channel(1);

        let result = state.run_download(session, params, transport).await;
        assert!(matches!(result, Err(StreamError::TimedOut)));
        assert_eq!(state.limiter().active_tests("c"), 0);
    }
}
