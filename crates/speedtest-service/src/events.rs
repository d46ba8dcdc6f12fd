//! Bounded queue for fire-and-forget side effects.
//!
//! Producers never wait: a full queue drops the event and counts it. One
//! worker drains the queue and, on shutdown, empties whatever is left before
//! exiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Kind of measurement a client ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    Ping,
    Download,
    Upload,
    WebSocket,
}

impl TestKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Download => "download",
            Self::Upload => "upload",
            Self::WebSocket => "websocket",
        }
    }
}

/// How a measurement ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Completed,
    Disconnected,
    Cancelled,
    TimedOut,
    Failed,
    /// Refused mid-test by a server limit (oversized upload).
    Rejected,
    /// The session was dropped without being finished (handler panic).
    Aborted,
}

impl TestOutcome {
    pub fn label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Aborted => "aborted",
        }
    }
}

/// A finished measurement.
#[derive(Debug, Clone)]
pub struct TestRecord {
    pub kind: TestKind,
    pub client: String,
    pub bytes: u64,
    pub duration: Duration,
    pub outcome: TestOutcome,
}

impl TestRecord {
    /// Observed throughput in megabits per second.
    pub fn mbps(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / secs / 1_000_000.0
    }
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Turned away by the admission gate.
    CapacityRejected { client: String, capacity: usize },
    /// Turned away by the client limiter.
    RateLimited { client: String },
    TestFinished(TestRecord),
}

pub struct EventDispatcher {
    tx: mpsc::Sender<ServiceEvent>,
    rx: Mutex<Option<mpsc::Receiver<ServiceEvent>>>,
    dropped: AtomicU64,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queues an event without waiting.
    pub fn emit(&self, event: ServiceEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events discarded because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Starts the worker. Returns `None` if it was already started.
    pub fn spawn_worker(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let rx = self.rx.lock().take()?;
        Some(tokio::spawn(run_worker(rx, shutdown)))
    }
}

async fn run_worker(mut rx: mpsc::Receiver<ServiceEvent>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => handle(&event),
                None => return,
            },
        }
    }

    rx.close();
    let mut drained = 0usize;
    while let Ok(event) = rx.try_recv() {
        handle(&event);
        drained += 1;
    }
    tracing::debug!(drained, "Event dispatcher stopped");
}

fn handle(event: &ServiceEvent) {
    match event {
        ServiceEvent::CapacityRejected { client, capacity } => {
            tracing::info!(%client, capacity, "Request rejected: server at capacity");
        }
        ServiceEvent::RateLimited { client } => {
            tracing::info!(%client, "Request rejected: rate limit exceeded");
        }
        ServiceEvent::TestFinished(record) => {
            tracing::info!(
                target: "speedtest::tests",
                kind = record.kind.label(),
                client = %record.client,
                bytes = record.bytes,
                duration_ms = record.duration.as_millis() as u64,
                mbps = format_args!("{:.2}", record.mbps()),
                outcome = record.outcome.label(),
                "Test finished",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(client: &str) -> ServiceEvent {
        ServiceEvent::RateLimited {
            client: client.to_string(),
        }
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let dispatcher = EventDispatcher::new(2);
        dispatcher.emit(rejected("a"));
        dispatcher.emit(rejected("b"));
        dispatcher.emit(rejected("c"));
        assert_eq!(dispatcher.dropped(), 1);
    }

    #[tokio::test]
    async fn worker_drains_on_shutdown() {
        let dispatcher = EventDispatcher::new(16);
        for i in 0..10 {
            dispatcher.emit(rejected(&format!("client-{i}")));
        }

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let handle = dispatcher.spawn_worker(shutdown).unwrap();
        handle.await.unwrap();

        // The queue is closed after draining.
        dispatcher.emit(rejected("late"));
        assert_eq!(dispatcher.dropped(), 1);
    }

    #[tokio::test]
    async fn worker_starts_once() {
        let dispatcher = EventDispatcher::new(4);
        let shutdown = CancellationToken::new();
        let first = dispatcher.spawn_worker(shutdown.clone());
        assert!(first.is_some());
        assert!(dispatcher.spawn_worker(shutdown.clone()).is_none());
        shutdown.cancel();
        first.unwrap().await.unwrap();
    }

    #[test]
    fn throughput_in_megabits() {
        let record = TestRecord {
            kind: TestKind::Download,
            client: "c".to_string(),
            bytes: 1_250_000,
            duration: Duration::from_secs(1),
            outcome: TestOutcome::Completed,
        };
        assert!((record.mbps() - 10.0).abs() < f64::EPSILON);
    }
}
