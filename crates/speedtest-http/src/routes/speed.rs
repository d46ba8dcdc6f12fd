//! Speed test endpoints: latency ping, streaming download, counted upload.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::{IntoResponse, Json, Response};
use futures_util::StreamExt;

use speedtest_service::events::{TestKind, TestOutcome};
use speedtest_service::stream::StreamParams;
use speedtest_service::transport::ChannelTransport;

use crate::client::ClientId;
use crate::error::ApiError;
use crate::middleware::admission::HeldSlot;
use crate::state::AppState;
use crate::types::{DownloadQuery, PingResponse, UploadResponse};

/// Body frames buffered between the generator and the connection.
const BODY_CHANNEL_DEPTH: usize = 16;

static X_CHUNK_COUNT: HeaderName = HeaderName::from_static("x-chunk-count");

/// Current time in Unix nanoseconds.
pub(crate) fn unix_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

fn no_cache(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
}

/// Measure round-trip latency.
///
/// Returns the server time so clients can also estimate clock offset.
#[utoipa::path(
    get,
    path = "/ping",
    responses(
        (status = 200, description = "Server timestamp", body = PingResponse),
        (status = 429, description = "Rate limit exceeded", body = crate::error::ErrorBody),
        (status = 503, description = "Server busy, retry shortly", body = crate::error::ErrorBody),
    ),
    tag = "Speed Test"
)]
pub async fn ping(State(state): State<AppState>, client: ClientId) -> Response {
    let session = state.begin_test(TestKind::Ping, client.as_str());
    let mut response = Json(PingResponse {
        timestamp: unix_nanos(),
    })
    .into_response();
    no_cache(response.headers_mut());
    session.finish(TestOutcome::Completed, 0);
    response
}

/// Stream a synthetic payload for download throughput measurement.
///
/// With `parallel=1` the body is raw bytes. With a higher parallelism the
/// payload is generated by independent workers and delivered as framed
/// chunks in completion order: each frame is a big-endian `u32` index, a
/// big-endian `u32` length, then the payload.
#[utoipa::path(
    get,
    path = "/download",
    params(DownloadQuery),
    responses(
        (status = 200, description = "Payload stream", body = Vec<u8>, content_type = "application/octet-stream"),
        (status = 429, description = "Rate limit exceeded", body = crate::error::ErrorBody),
        (status = 503, description = "Server busy, retry shortly", body = crate::error::ErrorBody),
    ),
    tag = "Speed Test"
)]
pub async fn download(
    State(state): State<AppState>,
    client: ClientId,
    slot: HeldSlot,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let params = StreamParams::clamped(
        query.size(),
        query.parallel(),
        query.min_chunk(),
        state.download_limits(),
    );
    tracing::debug!(
        client = client.as_str(),
        size = params.total_size,
        parallelism = params.parallelism,
        min_chunk = params.min_chunk_size,
        "Download started",
    );

    let session = state.begin_test(TestKind::Download, client.as_str());
    let (transport, mut rx) = ChannelTransport::channel(BODY_CHANNEL_DEPTH);

    let service = state.service().clone();
    tokio::spawn(async move {
        // The slot is released once the stream ends, not when headers are sent.
        let _slot = slot;
        // Outcome is logged and counted by the service.
        let _ = service.run_download(session, params, transport).await;
    });

    let stream = async_stream::stream! {
        while let Some(bytes) = rx.recv().await {
            yield Ok::<_, Infallible>(bytes);
        }
    };

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(params.encoded_len()));
    if !params.is_single_stream() {
        headers.insert(
            X_CHUNK_COUNT.clone(),
            HeaderValue::from(params.chunk_count()),
        );
    }
    no_cache(headers);
    response
}

/// Receive and discard a payload for upload throughput measurement.
///
/// Returns the number of body bytes read.
#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Bytes received", body = UploadResponse),
        (status = 413, description = "Body larger than the upload limit", body = crate::error::ErrorBody),
        (status = 429, description = "Rate limit exceeded", body = crate::error::ErrorBody),
        (status = 503, description = "Server busy, retry shortly", body = crate::error::ErrorBody),
    ),
    tag = "Speed Test"
)]
pub async fn upload(
    State(state): State<AppState>,
    client: ClientId,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let limit = state.upload_max_size();
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(ApiError::PayloadTooLarge { limit });
    }

    let session = state.begin_test(TestKind::Upload, client.as_str());
    let mut stream = body.into_data_stream();
    let mut received = 0u64;

    while let Some(frame) = stream.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(client = client.as_str(), received, "Upload interrupted: {e}");
                state.metrics().add_bytes_received(received);
                session.finish(TestOutcome::Disconnected, received);
                return Err(ApiError::BadRequest(format!("upload interrupted: {e}")));
            }
        };

        received += bytes.len() as u64;
        if received > limit {
            state.metrics().add_bytes_received(received);
            session.finish(TestOutcome::Rejected, received);
            return Err(ApiError::PayloadTooLarge { limit });
        }
    }

    state.metrics().add_bytes_received(received);
    session.finish(TestOutcome::Completed, received);

    let mut response = Json(UploadResponse {
        bytes_received: received,
    })
    .into_response();
    no_cache(response.headers_mut());
    Ok(response)
}
