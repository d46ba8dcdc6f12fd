//! Service-layer error types.
//!
//! `ServiceError` is transport-agnostic. Each transport crate maps it to
//! its own wire format. Admission and rate-limit decisions are plain
//! booleans and never surface here as failures of the limiter itself.

use std::io;

/// Service error shared across all transports.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Rejected limiter or lifecycle settings.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why a download stream ended before delivering its whole payload.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The receiving side went away.
    #[error("client disconnected")]
    Disconnected,

    /// The request-scoped cancellation signal fired.
    #[error("stream cancelled")]
    Cancelled,

    /// The download exceeded the configured time limit.
    #[error("stream timed out")]
    TimedOut,

    /// A generation worker failed; fatal to this request only.
    #[error("payload generation failed: {0}")]
    Generation(String),

    /// Transport-level I/O failure other than a disconnect.
    #[error("transport error: {0}")]
    Io(io::Error),
}

impl StreamError {
    /// True for outcomes caused by the client or lifecycle, not by the server.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Cancelled | Self::TimedOut)
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => Self::Disconnected,
            _ => Self::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_pipe_is_a_disconnect() {
        let err = StreamError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, StreamError::Disconnected));
        assert!(err.is_expected());
    }

    #[test]
    fn other_io_errors_are_unexpected() {
        let err = StreamError::from(io::Error::other("disk on fire"));
        assert!(matches!(err, StreamError::Io(_)));
        assert!(!err.is_expected());
    }
}
