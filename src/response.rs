//! Response assembly shared by the protocol adapters.
//!
//! Every cached or passthrough response carries exactly one `X-Cache-Status`
//! header, set before the body. Cached bodies are read from the published
//! entry on disk — the entry is the sole source of truth for cached bytes.

use std::path::Path;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};

use crate::error::{AppError, AppResult};

/// Name of the cache signaling header.
pub const X_CACHE_STATUS: &str = "x-cache-status";

/// Cache disposition of one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from cache without contacting upstream, or upstream said 304.
    Hit,
    /// Cache was empty or superseded; freshly fetched.
    Miss,
    /// Cache existed and was replaced by a newer upstream copy.
    Expired,
    /// Upstream fetch failed; a cached copy was served instead.
    Stale,
    /// Upstream fetch failed and no cached copy existed.
    Error,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Expired => "EXPIRED",
            CacheStatus::Stale => "STALE",
            CacheStatus::Error => "ERROR",
        }
    }
}

/// Serve the published cache entry at `path`.
pub async fn cached_file(
    path: &Path,
    content_type: Option<&'static str>,
    cache: CacheStatus,
) -> AppResult<Response> {
    let bytes = tokio::fs::read(path).await.map_err(AppError::Io)?;
    Ok(bytes_response(bytes, content_type, cache))
}

/// Build a 200 response from in-memory bytes.
pub fn bytes_response(
    bytes: Vec<u8>,
    content_type: Option<&'static str>,
    cache: CacheStatus,
) -> Response {
    let mut response = Response::new(Body::from(bytes));
    response
        .headers_mut()
        .insert(X_CACHE_STATUS, HeaderValue::from_static(cache.as_str()));
    if let Some(ct) = content_type {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(ct));
    }
    response
}

/// Build a degraded response with a short literal body.
pub fn plain_error(status: StatusCode, cache: CacheStatus, body: &'static str) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(X_CACHE_STATUS, HeaderValue::from_static(cache.as_str()));
    response
}

/// Base URL of this proxy as seen by the client: scheme from
/// `X-Forwarded-Proto` when present (TLS-terminating frontends), authority
/// from the `Host` header.
pub fn request_base_url(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}
