//! Per-client sliding-window rate limiting middleware.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use speedtest_service::events::ServiceEvent;

use crate::client;
use crate::error::ApiError;
use crate::state::AppState;

/// Returns 429 when the client limiter denies the request. The resolved
/// [`client::ClientId`] is stored in the request extensions for handlers.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let client = client::resolve(req.headers(), req.extensions());

    if !state.limiter().is_allowed(client.as_str()) {
        state.metrics().record_rate_limited();
        state
            .events()
            .emit(ServiceEvent::RateLimited { client: client.0 });
        return Err(ApiError::TooManyRequests);
    }

    req.extensions_mut().insert(client);
    Ok(next.run(req).await)
}
