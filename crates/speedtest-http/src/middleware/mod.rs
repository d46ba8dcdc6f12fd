//! HTTP middleware: admission gate, client rate limiting, request ID tracking.

pub mod admission;
pub mod rate_limit;
pub mod request_id;
