//! HTTP error type and its JSON response mapping.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use speedtest_service::admission::RETRY_AFTER_SECS;
use speedtest_service::error::ServiceError;

/// Errors surfaced by HTTP handlers and middleware.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// Admission gate full. Always retryable.
    #[error("busy, retry shortly")]
    ServiceBusy,

    #[error("rate limit exceeded")]
    TooManyRequests,

    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },
}

#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    /// Error code (e.g. "service_busy", "too_many_requests", "bad_request").
    pub(crate) error: String,
    /// Human-readable error detail, if available.
    pub(crate) detail: Option<String>,
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidConfig(_) => Self::BadRequest(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = Some(self.to_string());
        let (status, error) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::ServiceBusy => (StatusCode::SERVICE_UNAVAILABLE, "service_busy"),
            ApiError::TooManyRequests => (StatusCode::TOO_MANY_REQUESTS, "too_many_requests"),
            ApiError::PayloadTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large")
            }
        };

        let body = ErrorBody {
            error: error.to_string(),
            detail,
        };

        let mut response = (status, axum::Json(body)).into_response();
        if matches!(self, ApiError::ServiceBusy) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_carries_retry_hint() {
        let response = ApiError::ServiceBusy.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn rate_limit_has_no_retry_hint() {
        let response = ApiError::TooManyRequests.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn invalid_config_is_a_bad_request() {
        let err = ApiError::from(ServiceError::InvalidConfig("time window is zero".into()));
        assert!(err.to_string().contains("time window is zero"));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
