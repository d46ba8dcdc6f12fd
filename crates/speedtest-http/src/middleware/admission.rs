//! Global admission gate middleware.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;

use speedtest_service::admission::AdmissionPermit;
use speedtest_service::events::ServiceEvent;

use crate::client;
use crate::error::ApiError;
use crate::state::AppState;

/// The admission slot held by a request, if the gate issued one.
///
/// The middleware keeps the slot until the handler returns. Handlers whose
/// body outlives that (downloads) extract a clone from the request
/// extensions and move it into their body task.
#[derive(Debug, Clone, Default)]
pub struct HeldSlot {
    _permit: Option<Arc<AdmissionPermit>>,
}

impl<S: Send + Sync> FromRequestParts<S> for HeldSlot {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<HeldSlot>().cloned().unwrap_or_default())
    }
}

/// Rejects the request with 503 and `Retry-After: 1` when every slot is
/// taken. Otherwise holds the slot until the inner service has produced a
/// response, so request bodies are read under the gate.
pub async fn admission_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(permit) = state.gate().try_acquire() else {
        let client = client::resolve(req.headers(), req.extensions());
        state.metrics().record_capacity_rejection();
        state.events().emit(ServiceEvent::CapacityRejected {
            client: client.0,
            capacity: state.gate().capacity(),
        });
        return Err(ApiError::ServiceBusy);
    };

    let held = Arc::new(permit);
    req.extensions_mut().insert(HeldSlot {
        _permit: Some(Arc::clone(&held)),
    });
    let response = next.run(req).await;
    drop(held);
    Ok(response)
}
