//! Per-client rate limiting with a sliding window and an aggregate cap.
//!
//! Transport-agnostic core. Each transport wires its own middleware to
//! resolve a client identifier and call `is_allowed()`.
//!
//! A client that fills its window is blocked for [`BLOCK_COOLDOWN`], which is
//! deliberately longer than a typical window so retry storms stay shut out.
//! The aggregate check only protects capacity: it denies without recording
//! the attempt and never blocks the client.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;

/// How long a client stays blocked after exceeding its per-client limit.
pub const BLOCK_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Clients seen within this horizon count as "active" in stats.
const ACTIVE_CLIENT_HORIZON: Duration = Duration::from_secs(5 * 60);

/// Runtime-adjustable limits. A limit of 0 disables that check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Maximum in-window requests summed over all clients.
    pub global_limit: usize,
    /// Maximum in-window requests for a single client.
    pub per_client_limit: usize,
    /// Length of the sliding window.
    pub time_window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            global_limit: 1000,
            per_client_limit: 100,
            time_window: Duration::from_secs(60),
        }
    }
}

impl LimiterConfig {
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.time_window.is_zero() {
            return Err(ServiceError::InvalidConfig(
                "time window must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// When idle client records are purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Records not seen for longer than this are eligible for removal.
    pub retention: Duration,
    /// How often the reaper runs.
    pub interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Tracked state for one client identifier.
#[derive(Debug, Clone)]
struct ClientRecord {
    /// Admitted request times, oldest first.
    requests: VecDeque<Instant>,
    active_tests: u32,
    total_requests: u64,
    last_seen: Instant,
    blocked_until: Option<Instant>,
}

impl ClientRecord {
    fn new(now: Instant) -> Self {
        Self {
            requests: VecDeque::new(),
            active_tests: 0,
            total_requests: 0,
            last_seen: now,
            blocked_until: None,
        }
    }

    fn is_blocked_at(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    /// Drops timestamps that fell out of the window.
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.requests.front() {
            if now.duration_since(oldest) < window {
                break;
            }
            self.requests.pop_front();
        }
    }

    fn in_window(&self, now: Instant, window: Duration) -> usize {
        self.requests
            .iter()
            .filter(|&&t| now.duration_since(t) < window)
            .count()
    }
}

/// Aggregate limiter counters, computed without mutating state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct LimiterStats {
    /// Number of tracked client records.
    pub total_clients: usize,
    /// Clients seen within the last five minutes.
    pub active_clients: usize,
    /// Clients currently serving a block.
    pub blocked_clients: usize,
    /// Sum of running tests across all clients.
    pub total_active_tests: u64,
    /// Number of whitelisted identifiers.
    pub whitelist_count: usize,
    /// Requests allowed across all clients per window (0 = disabled).
    pub global_limit: usize,
    /// Requests allowed per client per window (0 = disabled).
    pub per_client_limit: usize,
    /// Sliding window length.
    pub time_window_seconds: u64,
}

struct LimiterState {
    clients: HashMap<String, ClientRecord>,
    whitelist: HashSet<String>,
    config: LimiterConfig,
}

impl LimiterState {
    fn record_mut(&mut self, client: &str, now: Instant) -> &mut ClientRecord {
        self.clients
            .entry(client.to_owned())
            .or_insert_with(|| ClientRecord::new(now))
    }

    fn in_window_total(&self, now: Instant) -> usize {
        let window = self.config.time_window;
        self.clients
            .values()
            .map(|c| c.in_window(now, window))
            .sum()
    }
}

/// In-memory per-client limiter. Cloning shares the same state.
#[derive(Clone)]
pub struct ClientLimiter {
    inner: Arc<LimiterInner>,
}

struct LimiterInner {
    state: RwLock<LimiterState>,
    retention: RetentionPolicy,
}

impl ClientLimiter {
    pub fn new(config: LimiterConfig, retention: RetentionPolicy) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                state: RwLock::new(LimiterState {
                    clients: HashMap::new(),
                    whitelist: HashSet::new(),
                    config,
                }),
                retention,
            }),
        }
    }

    /// Returns `true` if the request is allowed, `false` if rate-limited.
    pub fn is_allowed(&self, client: &str) -> bool {
        self.is_allowed_at(client, Instant::now())
    }

    pub(crate) fn is_allowed_at(&self, client: &str, now: Instant) -> bool {
        let mut state = self.inner.state.write();
        let config = state.config;

        if state.whitelist.contains(client) {
            let record = state.record_mut(client, now);
            record.last_seen = now;
            record.total_requests += 1;
            return true;
        }

        {
            let record = state.record_mut(client, now);
            if record.is_blocked_at(now) {
                return false;
            }

            record.prune(now, config.time_window);

            if config.per_client_limit > 0 && record.requests.len() >= config.per_client_limit {
                record.blocked_until = Some(now + BLOCK_COOLDOWN);
                return false;
            }
        }

        if config.global_limit > 0 && state.in_window_total(now) >= config.global_limit {
            return false;
        }

        let record = state.record_mut(client, now);
        record.requests.push_back(now);
        record.total_requests += 1;
        record.last_seen = now;
        record.blocked_until = None;
        true
    }

    /// Marks one more test as running for `client`.
    pub fn increment_active_tests(&self, client: &str) {
        let mut state = self.inner.state.write();
        state.record_mut(client, Instant::now()).active_tests += 1;
    }

    /// Marks one test as finished. Never drops below zero.
    pub fn decrement_active_tests(&self, client: &str) {
        let mut state = self.inner.state.write();
        if let Some(record) = state.clients.get_mut(client) {
            record.active_tests = record.active_tests.saturating_sub(1);
        }
    }

    /// Number of tests currently running for `client`.
    pub fn active_tests(&self, client: &str) -> u32 {
        self.inner
            .state
            .read()
            .clients
            .get(client)
            .map_or(0, |c| c.active_tests)
    }

    /// Total running tests across all clients.
    pub fn total_active_tests(&self) -> u64 {
        self.inner
            .state
            .read()
            .clients
            .values()
            .map(|c| u64::from(c.active_tests))
            .sum()
    }

    pub fn add_to_whitelist(&self, client: &str) {
        self.inner.state.write().whitelist.insert(client.to_owned());
    }

    /// Returns `false` if the identifier was not whitelisted.
    pub fn remove_from_whitelist(&self, client: &str) -> bool {
        self.inner.state.write().whitelist.remove(client)
    }

    pub fn is_whitelisted(&self, client: &str) -> bool {
        self.inner.state.read().whitelist.contains(client)
    }

    pub fn config(&self) -> LimiterConfig {
        self.inner.state.read().config
    }

    /// Replaces the limits. Decisions already in progress keep the old values.
    pub fn update_limits(&self, config: LimiterConfig) -> Result<(), ServiceError> {
        config.validate()?;
        self.inner.state.write().config = config;
        tracing::info!(
            global_limit = config.global_limit,
            per_client_limit = config.per_client_limit,
            time_window_secs = config.time_window.as_secs(),
            "Rate limits updated",
        );
        Ok(())
    }

    pub fn stats(&self) -> LimiterStats {
        self.stats_at(Instant::now())
    }

    pub(crate) fn stats_at(&self, now: Instant) -> LimiterStats {
        let state = self.inner.state.read();
        let mut stats = LimiterStats {
            total_clients: state.clients.len(),
            active_clients: 0,
            blocked_clients: 0,
            total_active_tests: 0,
            whitelist_count: state.whitelist.len(),
            global_limit: state.config.global_limit,
            per_client_limit: state.config.per_client_limit,
            time_window_seconds: state.config.time_window.as_secs(),
        };

        for client in state.clients.values() {
            if now.duration_since(client.last_seen) < ACTIVE_CLIENT_HORIZON {
                stats.active_clients += 1;
            }
            if client.is_blocked_at(now) {
                stats.blocked_clients += 1;
            }
            stats.total_active_tests += u64::from(client.active_tests);
        }
        stats
    }

    /// Removes idle records. Returns count removed.
    pub fn reap(&self) -> usize {
        self.reap_at(Instant::now())
    }

    pub(crate) fn reap_at(&self, now: Instant) -> usize {
        let retention = self.inner.retention.retention;
        let mut state = self.inner.state.write();
        let before = state.clients.len();
        state.clients.retain(|_, client| {
            client.active_tests > 0 || now.duration_since(client.last_seen) <= retention
        });
        before - state.clients.len()
    }

    /// Spawns the periodic reaper. It stops when `shutdown` is cancelled.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = self.clone();
        let period = self.inner.retention.interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.reap();
                        if removed > 0 {
                            tracing::info!(removed, "Reaped idle client records");
                        }
                    }
                }
            }
            tracing::debug!("Client reaper stopped");
        })
    }
}
