//! npm registry adapter.
//!
//! One wildcard serves three endpoint classes: search (`-/v1/search`,
//! 10-minute TTL), tarballs (immutable), and packument metadata
//! (conditionally revalidated, variant-cached per Accept bucket and query,
//! with `dist.tarball` URLs rewritten to point back at this proxy).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, RawQuery, State},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use filetime::FileTime;
use serde_json::Value;
use tracing::{debug, error};

use crate::cache_meta::{self, CacheMeta};
use crate::error::AppError;
use crate::fetch::{self, within_ttl, Conditional};
use crate::paths::clean_wildcard;
use crate::response::{cached_file, plain_error, request_base_url, CacheStatus, X_CACHE_STATUS};
use crate::sha256_hex;
use crate::state::AppState;

const SEARCH_TTL: Duration = Duration::from_secs(10 * 60);

const ACCEPT_CORGI: &str = "application/vnd.npm.install-v1+json";
const ACCEPT_FULL: &str = "application/json";

/// `GET /npm/{key}/{*path}` — search, tarball, or packument.
pub async fn proxy(
    AxumPath((key, path)): AxumPath<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(base) = state.config.server.npm.get(&key) else {
        return AppError::NotFound(format!("unknown npm registry: {key}")).into_response();
    };
    let Some(cleaned) = clean_wildcard(path.trim_end_matches('/')) else {
        return AppError::NotFound("empty path".into()).into_response();
    };
    let query = query.as_deref().unwrap_or("");

    if is_search_path(&cleaned) {
        return search(&state, &key, base, query).await;
    }
    if is_tarball_path(&cleaned) {
        return tarball(&state, &key, base, &cleaned).await;
    }
    metadata(&state, &key, base, &cleaned, query, &headers).await
}

fn is_tarball_path(path: &str) -> bool {
    path.contains("/-/") && (path.ends_with(".tgz") || path.ends_with(".tar.gz"))
}

fn is_search_path(path: &str) -> bool {
    path.trim_end_matches('/') == "-/v1/search"
}

/// Accept bucket: cache-key component plus the canonical header sent
/// upstream. Unknown Accept values get their own hashed bucket.
fn accept_bucket(accept: &str) -> (String, String) {
    if accept.is_empty() || accept.contains(ACCEPT_CORGI) || accept.contains("*/*") {
        return ("corgi".into(), ACCEPT_CORGI.into());
    }
    if accept.contains(ACCEPT_FULL) {
        return ("full".into(), ACCEPT_FULL.into());
    }
    let digest = sha256_hex(accept.as_bytes());
    (format!("accept-{}", &digest[..16]), accept.to_string())
}

/// Scoped package names go upstream with the scope separator re-encoded.
fn encode_package_name(name: &str) -> String {
    if name.starts_with('@') && name.contains('/') {
        name.replace('/', "%2F")
    } else {
        name.to_string()
    }
}

/// Rewrite every `versions.*.dist.tarball` to point at this proxy,
/// preserving the upstream path and query. Unknown shapes are skipped.
fn rewrite_tarball_urls(packument: &mut Value, base_url: &str, key: &str) -> bool {
    let Some(versions) = packument.get_mut("versions").and_then(|v| v.as_object_mut()) else {
        return false;
    };

    let mut updated = false;
    for version in versions.values_mut() {
        let Some(dist) = version.get_mut("dist").and_then(|d| d.as_object_mut()) else {
            continue;
        };
        let Some(tarball) = dist.get("tarball").and_then(|t| t.as_str()) else {
            continue;
        };
        let Ok(parsed) = url::Url::parse(tarball) else {
            continue;
        };
        if parsed.path().is_empty() {
            continue;
        }
        let mut rewritten = format!("{base_url}/npm/{key}{}", parsed.path());
        if let Some(q) = parsed.query() {
            rewritten.push('?');
            rewritten.push_str(q);
        }
        dist.insert("tarball".to_string(), Value::String(rewritten));
        updated = true;
    }
    updated
}

/// `-/v1/search`: cached per query hash, refreshed after ten minutes.
/// Search responses carry no strong validators, so a successful refetch
/// restarts the TTL clock by bumping the entry mtime.
async fn search(state: &AppState, key: &str, base: &str, query: &str) -> Response {
    let hash = if query.is_empty() {
        "empty".to_string()
    } else {
        sha256_hex(query.as_bytes())
    };
    let dest = state
        .config
        .dir
        .join("npm")
        .join(key)
        .join("search")
        .join(format!("{hash}.json"));

    if within_ttl(&dest, SEARCH_TTL).await {
        return respond_with(&dest, CacheStatus::Hit).await;
    }

    let mut url = format!("{}/-/v1/search", base.trim_end_matches('/'));
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }

    let headers = [("User-Agent", "npm"), ("Accept", ACCEPT_FULL)];
    match fetch::fetch(&state.http, &url, &dest, &headers).await {
        Ok(()) => {
            if let Err(e) = filetime::set_file_mtime(&dest, FileTime::now()) {
                error!(ns = "npm", path = %dest.display(), error = %e, "Cache timestamp update error");
            }
            respond_with(&dest, CacheStatus::Miss).await
        }
        Err(e) => {
            error!(ns = "npm", url = %url, error = %e, "[Downloading]");
            if tokio::fs::metadata(&dest).await.is_err() {
                return plain_error(e.response_status(), CacheStatus::Error, "Please check logs...");
            }
            respond_with(&dest, CacheStatus::Stale).await
        }
    }
}

/// Tarballs are immutable: any cached copy is authoritative.
async fn tarball(state: &AppState, key: &str, base: &str, cleaned: &str) -> Response {
    let url = format!("{}/{}", base.trim_end_matches('/'), cleaned);
    let dest = state
        .config
        .dir
        .join("npm")
        .join(key)
        .join("tarballs")
        .join(cleaned);

    if tokio::fs::metadata(&dest).await.is_ok() {
        return match cached_file(&dest, None, CacheStatus::Hit).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        };
    }

    match fetch::fetch(&state.http, &url, &dest, &[("User-Agent", "npm")]).await {
        Ok(()) => {
            debug!(ns = "npm", url = %url, dest = %dest.display(), "Remote saved");
            match cached_file(&dest, None, CacheStatus::Miss).await {
                Ok(response) => response,
                Err(e) => e.into_response(),
            }
        }
        Err(e) => {
            error!(ns = "npm", url = %url, error = %e, "[Downloading]");
            if tokio::fs::metadata(&dest).await.is_err() {
                return plain_error(e.response_status(), CacheStatus::Error, "Please check logs...");
            }
            match cached_file(&dest, None, CacheStatus::Stale).await {
                Ok(response) => response,
                Err(e) => e.into_response(),
            }
        }
    }
}

/// Packument metadata: conditional revalidation per (package, Accept
/// bucket, query) variant, tarball rewrite on the way out.
async fn metadata(
    state: &AppState,
    key: &str,
    base: &str,
    package: &str,
    query: &str,
    headers: &HeaderMap,
) -> Response {
    let accept = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let (accept_key, upstream_accept) = accept_bucket(accept);

    let mut filename = format!("packument.{accept_key}");
    if !query.is_empty() {
        filename.push('.');
        filename.push_str(&sha256_hex(query.as_bytes()));
    }

    let cache_dir: PathBuf = state
        .config
        .dir
        .join("npm")
        .join(key)
        .join("metadata")
        .join(package);
    let data_file = cache_dir.join(format!("{filename}.json"));
    let meta_file = cache_dir.join(format!("{filename}.meta.json"));

    let mut url = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        encode_package_name(package)
    );
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }

    let cache_exists = tokio::fs::metadata(&data_file).await.is_ok();
    let mut stored = if cache_exists {
        cache_meta::read(&meta_file).await
    } else {
        CacheMeta::default()
    };

    let request_headers = [
        ("User-Agent", "npm"),
        ("Accept", upstream_accept.as_str()),
    ];
    let label = match fetch::fetch_conditional(&state.http, &url, &data_file, &request_headers, &stored)
        .await
    {
        Ok(outcome) => {
            let (label, validators) = match outcome {
                Conditional::NotModified { validators } => (CacheStatus::Hit, validators),
                Conditional::Fetched { validators } => (CacheStatus::Miss, validators),
            };
            if !validators.is_empty() {
                stored.merge(&validators);
                if let Err(e) = cache_meta::write(&meta_file, &stored).await {
                    error!(ns = "npm", path = %meta_file.display(), error = %e, "Cache meta write error");
                }
            }
            label
        }
        Err(e) => {
            error!(ns = "npm", url = %url, error = %e, "[Downloading]");
            if !cache_exists {
                return plain_error(e.response_status(), CacheStatus::Error, "Please check logs...");
            }
            CacheStatus::Stale
        }
    };

    serve_packument(&data_file, &request_base_url(headers), key, &upstream_accept, label).await
}

/// Read the cached packument, rewrite tarball URLs on the response copy,
/// and emit it with the negotiated content type. The disk copy is never
/// modified.
async fn serve_packument(
    data_file: &Path,
    base_url: &str,
    key: &str,
    content_type: &str,
    cache: CacheStatus,
) -> Response {
    let payload = match tokio::fs::read(data_file).await {
        Ok(payload) => payload,
        Err(e) => {
            error!(ns = "npm", path = %data_file.display(), error = %e, "Cache read error");
            return (StatusCode::BAD_REQUEST, "Metadata error").into_response();
        }
    };

    let mut packument: Value = match serde_json::from_slice(&payload) {
        Ok(value) => value,
        Err(e) => {
            error!(ns = "npm", path = %data_file.display(), error = %e, "Metadata unmarshal error");
            return (StatusCode::BAD_REQUEST, "Metadata error").into_response();
        }
    };

    if !rewrite_tarball_urls(&mut packument, base_url, key) {
        debug!(ns = "npm", path = %data_file.display(), "No tarball URLs rewritten");
    }

    let body = match serde_json::to_vec(&packument) {
        Ok(body) => body,
        Err(e) => {
            error!(ns = "npm", error = %e, "Metadata marshal error");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Metadata error").into_response();
        }
    };

    let mut response = Response::new(axum::body::Body::from(body));
    response
        .headers_mut()
        .insert(X_CACHE_STATUS, HeaderValue::from_static(cache.as_str()));
    let ct = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(ACCEPT_FULL));
    response.headers_mut().insert(CONTENT_TYPE, ct);
    response
}

async fn respond_with(dest: &Path, cache: CacheStatus) -> Response {
    match cached_file(dest, Some("application/json"), cache).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
