//! Active-test accounting for a single measurement.
//!
//! A [`TestSession`] increments the client's active-test count when created
//! and decrements it when dropped, whatever path the handler takes out.

use std::time::Instant;

use crate::ServiceState;
use crate::events::{ServiceEvent, TestKind, TestOutcome, TestRecord};

/// RAII marker for one running test.
pub struct TestSession {
    state: ServiceState,
    kind: TestKind,
    client: String,
    started: Instant,
    finished: bool,
}

impl TestSession {
    pub(crate) fn begin(state: ServiceState, kind: TestKind, client: &str) -> Self {
        state.limiter().increment_active_tests(client);
        state.metrics().record_test_started(kind);
        Self {
            state,
            kind,
            client: client.to_owned(),
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn kind(&self) -> TestKind {
        self.kind
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    /// Ends the session and reports how it went.
    pub fn finish(mut self, outcome: TestOutcome, bytes: u64) {
        self.report(outcome, bytes);
    }

    fn report(&mut self, outcome: TestOutcome, bytes: u64) {
        self.finished = true;
        self.state.metrics().record_test_finished(self.kind, outcome);
        self.state
            .events()
            .emit(ServiceEvent::TestFinished(TestRecord {
                kind: self.kind,
                client: self.client.clone(),
                bytes,
                duration: self.started.elapsed(),
                outcome,
            }));
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        if !self.finished {
            self.report(TestOutcome::Aborted, 0);
        }
        self.state.limiter().decrement_active_tests(&self.client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceConfig;

    #[test]
    fn session_tracks_active_tests() {
        let state = ServiceState::new(&ServiceConfig::default());

        let first = state.begin_test(TestKind::Download, "10.0.0.1");
        let second = state.begin_test(TestKind::Upload, "10.0.0.1");
        assert_eq!(state.limiter().active_tests("10.0.0.1"), 2);

        first.finish(TestOutcome::Completed, 1024);
        assert_eq!(state.limiter().active_tests("10.0.0.1"), 1);

        drop(second);
        assert_eq!(state.limiter().active_tests("10.0.0.1"), 0);
        assert_eq!(state.metrics().tests_started(TestKind::Download), 1);
    }

    #[tokio::test]
    async fn session_released_when_task_panics() {
        let state = ServiceState::new(&ServiceConfig::default());
        let session = state.begin_test(TestKind::Download, "c");

        let result = tokio::spawn(async move {
            let _session = session;
            panic!("stream failure");
        })
        .await;

        assert!(result.is_err());
        assert_eq!(state.limiter().active_tests("c"), 0);
    }
}
