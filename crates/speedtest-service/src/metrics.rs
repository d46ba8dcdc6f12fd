//! Lightweight Prometheus-compatible metrics using atomic counters.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::events::{TestKind, TestOutcome};

/// Per-kind test counters.
struct KindMetrics {
    started_total: AtomicU64,
    failed_total: AtomicU64,
}

impl KindMetrics {
    const fn new() -> Self {
        Self {
            started_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        }
    }
}

const ALL_KINDS: [TestKind; 4] = [
    TestKind::Ping,
    TestKind::Download,
    TestKind::Upload,
    TestKind::WebSocket,
];

/// Live values sampled at render time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub in_flight_requests: usize,
    pub admission_capacity: usize,
    pub active_tests: u64,
    pub tracked_clients: usize,
    pub blocked_clients: usize,
    pub dropped_events: u64,
    pub uptime_seconds: u64,
}

/// Application-wide metrics collected via atomic counters.
pub struct Metrics {
    ping: KindMetrics,
    download: KindMetrics,
    upload: KindMetrics,
    websocket: KindMetrics,
    bytes_sent_total: AtomicU64,
    bytes_received_total: AtomicU64,
    capacity_rejections_total: AtomicU64,
    rate_limited_total: AtomicU64,
    stream_disconnects_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            ping: KindMetrics::new(),
            download: KindMetrics::new(),
            upload: KindMetrics::new(),
            websocket: KindMetrics::new(),
            bytes_sent_total: AtomicU64::new(0),
            bytes_received_total: AtomicU64::new(0),
            capacity_rejections_total: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            stream_disconnects_total: AtomicU64::new(0),
        }
    }

    fn kind(&self, kind: TestKind) -> &KindMetrics {
        match kind {
            TestKind::Ping => &self.ping,
            TestKind::Download => &self.download,
            TestKind::Upload => &self.upload,
            TestKind::WebSocket => &self.websocket,
        }
    }

    pub fn record_test_started(&self, kind: TestKind) {
        self.kind(kind).started_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how a test ended. Only server-side failures count as errors.
    pub fn record_test_finished(&self, kind: TestKind, outcome: TestOutcome) {
        match outcome {
            TestOutcome::Failed | TestOutcome::Aborted => {
                self.kind(kind).failed_total.fetch_add(1, Ordering::Relaxed);
            }
            TestOutcome::Disconnected | TestOutcome::Cancelled | TestOutcome::TimedOut => {
                self.stream_disconnects_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            TestOutcome::Completed | TestOutcome::Rejected => {}
        }
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received_total
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_capacity_rejection(&self) {
        self.capacity_rejections_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tests_started(&self, kind: TestKind) -> u64 {
        self.kind(kind).started_total.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent_total.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received_total.load(Ordering::Relaxed)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self, gauges: &Gauges) -> String {
        let mut out = String::with_capacity(2048);

        // Gauges (live values)
        gauge(
            &mut out,
            "speedtest_in_flight_requests",
            "Requests currently holding an admission slot",
            gauges.in_flight_requests,
        );
        gauge(
            &mut out,
            "speedtest_admission_capacity",
            "Admission slots (0 = unlimited)",
            gauges.admission_capacity,
        );
        gauge(
            &mut out,
            "speedtest_active_tests",
            "Tests currently running",
            gauges.active_tests,
        );
        gauge(
            &mut out,
            "speedtest_tracked_clients",
            "Client records held by the rate limiter",
            gauges.tracked_clients,
        );
        gauge(
            &mut out,
            "speedtest_blocked_clients",
            "Clients serving a rate-limit block",
            gauges.blocked_clients,
        );
        gauge(
            &mut out,
            "speedtest_uptime_seconds",
            "Server uptime in seconds",
            gauges.uptime_seconds,
        );

        // Per-kind counters
        writeln!(out, "# HELP speedtest_tests_total Tests started.").unwrap();
        writeln!(out, "# TYPE speedtest_tests_total counter").unwrap();
        for kind in &ALL_KINDS {
            let total = self.kind(*kind).started_total.load(Ordering::Relaxed);
            let label = kind.label();
            writeln!(out, "speedtest_tests_total{{kind=\"{label}\"}} {total}").unwrap();
        }

        writeln!(
            out,
            "# HELP speedtest_test_failures_total Tests that failed on the server side."
        )
        .unwrap();
        writeln!(out, "# TYPE speedtest_test_failures_total counter").unwrap();
        for kind in &ALL_KINDS {
            let failed = self.kind(*kind).failed_total.load(Ordering::Relaxed);
            let label = kind.label();
            writeln!(
                out,
                "speedtest_test_failures_total{{kind=\"{label}\"}} {failed}"
            )
            .unwrap();
        }

        counter(
            &mut out,
            "speedtest_bytes_sent_total",
            "Payload bytes sent to clients",
            self.bytes_sent_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "speedtest_bytes_received_total",
            "Payload bytes received from clients",
            self.bytes_received_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "speedtest_capacity_rejections_total",
            "Requests rejected by the admission gate",
            self.capacity_rejections_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "speedtest_rate_limited_total",
            "Requests rejected by the client rate limiter",
            self.rate_limited_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "speedtest_stream_disconnects_total",
            "Tests ended early by disconnect, cancellation or timeout",
            self.stream_disconnects_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "speedtest_dropped_events_total",
            "Events dropped because the event queue was full",
            gauges.dropped_events,
        );

        out
    }
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    writeln!(out, "# HELP {name} {help}").unwrap();
    writeln!(out, "# TYPE {name} gauge").unwrap();
    writeln!(out, "{name} {value}").unwrap();
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    writeln!(out, "# HELP {name} {help}").unwrap();
    writeln!(out, "# TYPE {name} counter").unwrap();
    writeln!(out, "{name} {value}").unwrap();
}
