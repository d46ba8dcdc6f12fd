//! Client identification from proxy headers or the connection address.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap};

/// Identifier used when no source yields an address.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// The resolved client identifier for a request.
///
/// The rate-limit middleware stores it in the request extensions; handlers
/// behind it reuse that value instead of resolving again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Resolves the client from, in order: the first `X-Forwarded-For` entry,
/// `X-Real-IP`, `X-Client-IP`, then the peer address.
pub fn resolve(headers: &HeaderMap, extensions: &Extensions) -> ClientId {
    let forwarded = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let from_headers = forwarded
        .or_else(|| header_str(headers, "x-real-ip"))
        .or_else(|| header_str(headers, "x-client-ip"));

    if let Some(client) = from_headers {
        return ClientId(client.to_string());
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(
            || ClientId(UNKNOWN_CLIENT.to_string()),
            |ci| ClientId(ci.0.ip().to_string()),
        )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl<S: Send + Sync> FromRequestParts<S> for ClientId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(id) = parts.extensions.get::<ClientId>() {
            return Ok(id.clone());
        }
        Ok(resolve(&parts.headers, &parts.extensions))
    }
}
