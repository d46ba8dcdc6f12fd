//! Speedtest HTTP: REST and WebSocket transport adapter for the speed test server.
//!
//! Provides the HTTP interface including:
//! - Speed test endpoints (ping, download, upload)
//! - WebSocket jitter echo
//! - Health, version, client config, and Prometheus metrics
//! - Optional admin API (limiter stats, whitelist, runtime limits)
//! - OpenAPI/Swagger UI
//! - Admission gate, client rate limiting, request-ID middleware

pub mod client;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;

use axum::Router;
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::routing::{get, post, put};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use error::ErrorBody;
use speedtest_service::rate_limit::LimiterStats;

pub use state::AppState;

// ---------------------------------------------------------------------------
// OpenAPI
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Speed Test Server API",
        description = "HTTP API for self-hosted network throughput measurement.\n\nClients measure latency with `/ping`, download throughput with `/download` (single stream or parallel framed chunks), upload throughput with `/upload`, and jitter over the `/ws` WebSocket echo.\n\nSpeed test endpoints pass a global admission gate (503 with `Retry-After: 1` when full) and a per-client sliding-window rate limiter (429).",
        version = "0.3.0",
        license(name = "MIT"),
    ),
    paths(
        routes::speed::ping,
        routes::speed::download,
        routes::speed::upload,
        routes::system::health,
        routes::system::version,
        routes::system::client_config,
        routes::admin::limiter_stats,
        routes::admin::system_info,
        routes::admin::whitelist_add,
        routes::admin::whitelist_remove,
        routes::admin::update_limits,
    ),
    components(
        schemas(
            types::PingResponse, types::UploadResponse, types::HealthResponse,
            types::VersionResponse, types::ConfigResponse, types::SystemInfo,
            types::LimitsRequest, types::WhitelistResponse, LimiterStats, ErrorBody,
        )
    ),
    tags(
        (name = "Speed Test", description = "Latency, download, and upload measurement"),
        (name = "System", description = "Health, version, and client configuration"),
        (name = "Admin", description = "Rate limiter administration"),
    )
)]
struct ApiDoc;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Builds the HTTP API router.
///
/// Speed test routes pass the admission gate first, then the client
/// limiter. The WebSocket echo passes only the limiter. System routes and
/// the docs are exempt from both. Admin routes are mounted only when
/// enabled on the state.
pub fn router(state: AppState) -> Router {
    let speed = Router::new()
        .route("/ping", get(routes::speed::ping))
        .route("/download", get(routes::speed::download))
        .route("/upload", post(routes::speed::upload))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::admission::admission_middleware,
        ));

    // Jitter sockets are unbounded in duration and take no admission slot.
    let jitter = Router::new()
        .route("/ws", get(routes::websocket::ws_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit_middleware,
        ));

    let mut api = Router::new()
        .route("/healthz", get(routes::system::health))
        .route("/version", get(routes::system::version))
        .route("/config", get(routes::system::client_config))
        .route("/metrics", get(routes::system::metrics_endpoint))
        .merge(speed)
        .merge(jitter);

    if state.admin_enabled() {
        api = api
            .route("/admin/api/limiter", get(routes::admin::limiter_stats))
            .route("/admin/api/system", get(routes::admin::system_info))
            .route(
                "/admin/api/whitelist/{client}",
                put(routes::admin::whitelist_add).delete(routes::admin::whitelist_remove),
            )
            .route("/admin/api/limits", put(routes::admin::update_limits));
    }

    let cors = cors_layer(&state);
    api.with_state(state)
        .merge(SwaggerUi::new("/api/docs").url("/api/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(
            middleware::request_id::request_id_middleware,
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(cors)
}

/// Serve the HTTP router on the given listener with graceful shutdown.
///
/// Wraps `axum::serve` with `ConnectInfo<SocketAddr>` so rate limiting
/// and logging can extract client addresses.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = state.cors_origins();

    // No origins configured → no CORS headers (deny cross-origin by default).
    if origins.is_empty() {
        return CorsLayer::new();
    }

    let x_request_id = HeaderName::from_static("x-request-id");
    let base = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, x_request_id.clone()])
        .expose_headers([
            x_request_id,
            header::RETRY_AFTER,
            HeaderName::from_static("x-chunk-count"),
        ]);

    if origins.len() == 1 && origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard origin: all cross-origin requests allowed");
        base.allow_origin(tower_http::cors::Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        base.allow_origin(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use speedtest_service::ServiceConfig;
    use tower::ServiceExt;

    fn app(config: &ServiceConfig) -> Router {
        router(AppState::for_testing(config))
    }

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn health_is_exempt_from_gate() {
        let state = AppState::for_testing(&ServiceConfig {
            max_concurrent_requests: 1,
            ..ServiceConfig::default()
        });
        let _held = state.gate().try_acquire().unwrap();

        let router = router(state.clone());
        assert_eq!(get_status(router.clone(), "/healthz").await, StatusCode::OK);
        assert_eq!(
            get_status(router, "/ping").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn upgrade_header_does_not_bypass_gate() {
        let state = AppState::for_testing(&ServiceConfig {
            max_concurrent_requests: 1,
            ..ServiceConfig::default()
        });
        let _held = state.gate().try_acquire().unwrap();

        let response = router(state)
            .oneshot(
                Request::get("/download?size=1000")
                    .header("connection", "upgrade")
                    .header("upgrade", "websocket")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["retry-after"], "1");
    }

    #[tokio::test]
    async fn upload_holds_slot_until_body_is_read() {
        let state = AppState::for_testing(&ServiceConfig {
            max_concurrent_requests: 1,
            ..ServiceConfig::default()
        });
        let router = router(state.clone());

        let (tx, mut rx) = tokio::sync::mpsc::channel::<axum::body::Bytes>(4);
        let body = Body::from_stream(async_stream::stream! {
            while let Some(bytes) = rx.recv().await {
                yield Ok::<_, std::convert::Infallible>(bytes);
            }
        });
        let upload = tokio::spawn(
            router
                .clone()
                .oneshot(Request::post("/upload").body(body).unwrap()),
        );
        tx.send(axum::body::Bytes::from_static(b"abc")).await.unwrap();

        for _ in 0..100 {
            if state.gate().in_flight() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(state.gate().in_flight(), 1);
        assert_eq!(
            get_status(router.clone(), "/ping").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        drop(tx);
        let response = upload.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["bytes_received"], 3);
        assert_eq!(state.gate().in_flight(), 0);
        assert_eq!(get_status(router, "/ping").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn responses_carry_security_and_request_id_headers() {
        let response = app(&ServiceConfig::default())
            .oneshot(Request::get("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert!(headers.contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn incoming_request_id_is_preserved() {
        let response = app(&ServiceConfig::default())
            .oneshot(
                Request::get("/healthz")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-request-id"], "abc-123");
    }

    #[tokio::test]
    async fn rate_limit_uses_forwarded_client() {
        let router = app(&ServiceConfig {
            limiter: speedtest_service::rate_limit::LimiterConfig {
                per_client_limit: 2,
                ..Default::default()
            },
            ..ServiceConfig::default()
        });

        let ping = |ip: &'static str| {
            Request::get("/ping")
                .header("x-forwarded-for", ip)
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..2 {
            let res = router.clone().oneshot(ping("203.0.113.1")).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }
        let res = router.clone().oneshot(ping("203.0.113.1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

        // A different client is unaffected.
        let res = router.oneshot(ping("203.0.113.2")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn download_body_matches_content_length() {
        let response = app(&ServiceConfig::default())
            .oneshot(
                Request::get("/download?size=3000000&parallel=3&min_chunk=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-chunk-count"], "3");
        assert_eq!(response.headers()["content-length"], "3000024");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len(), 3_000_024);
    }

    #[tokio::test]
    async fn admin_routes_absent_when_disabled() {
        let state = AppState::new(
            speedtest_service::ServiceState::new(&ServiceConfig::default()),
            vec![],
            false,
        );
        assert_eq!(
            get_status(router(state), "/admin/api/limiter").await,
            StatusCode::NOT_FOUND
        );
    }
}
