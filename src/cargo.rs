//! Cargo sparse-registry adapter.
//!
//! Four endpoint families per registry key: the generated `config.json`
//! (pointing cargo's `dl`/`api` back at this proxy), the sparse index
//! (conditionally revalidated with a validator sidecar), immutable `.crate`
//! downloads, and a streaming passthrough for the registry API.

use std::path::Path;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path as AxumPath, RawQuery, State},
    http::{
        header::{ACCEPT, CONTENT_TYPE, USER_AGENT},
        HeaderMap, HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{debug, error};

use crate::cache_meta::{self, CacheMeta};
use crate::config::{CargoEndpoints, CargoSource};
use crate::error::AppError;
use crate::fetch::{self, Conditional};
use crate::paths::{clean_wildcard, is_safe_segment};
use crate::response::{cached_file, plain_error, request_base_url, CacheStatus, X_CACHE_STATUS};
use crate::state::AppState;

const CT_JSON: &str = "application/json";
const CT_CRATE: &str = "application/octet-stream";

/// Headers that apply to a single transport connection and must not cross
/// the proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Registry config served to cargo in place of the upstream's `config.json`.
#[derive(Serialize)]
struct IndexConfig {
    dl: String,
    api: String,
}

fn lookup<'a>(state: &'a AppState, key: &str) -> Result<(&'a CargoSource, CargoEndpoints), Response> {
    let Some(source) = state.config.server.cargo.get(key) else {
        return Err(AppError::NotFound(format!("unknown cargo registry: {key}")).into_response());
    };
    if source.base.trim().is_empty() {
        return Err(AppError::NotFound(format!("cargo registry {key} has no base")).into_response());
    }
    match CargoEndpoints::from_source(source) {
        Ok(endpoints) => Ok((source, endpoints)),
        Err(e) => {
            error!(ns = "cargo_index", key = %key, error = %e, "Config error");
            Err(plain_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn plain_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// `GET /cargo/{key}/{*path}` — sparse index entries and `config.json`,
/// with an optional `index/` prefix on either.
pub async fn index(
    AxumPath((key, path)): AxumPath<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let (_, endpoints) = match lookup(&state, &key) {
        Ok(found) => found,
        Err(response) => return response,
    };

    let Some(cleaned) = clean_wildcard(&path) else {
        return AppError::NotFound("empty path".into()).into_response();
    };
    let rel = cleaned.strip_prefix("index/").unwrap_or(&cleaned);
    if rel.is_empty() {
        return AppError::NotFound("empty path".into()).into_response();
    }

    if rel == "config.json" {
        return generated_config(&state, &key, &headers).await;
    }

    let mut url = format!("{}/{}", endpoints.index.trim_end_matches('/'), rel);
    if let Some(q) = query.as_deref().filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }

    let dest = state.config.dir.join("cargo").join(&key).join("index").join(rel);
    let meta_file = dest.with_file_name(format!(
        "{}.meta.json",
        dest.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));

    let cache_exists = tokio::fs::metadata(&dest).await.is_ok();
    let mut stored = if cache_exists {
        cache_meta::read(&meta_file).await
    } else {
        CacheMeta::default()
    };

    let request_headers = [("User-Agent", "cargo"), ("Accept", CT_JSON)];
    let label = match fetch::fetch_conditional(&state.http, &url, &dest, &request_headers, &stored)
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
                    error!(ns = "cargo_index", path = %meta_file.display(), error = %e, "Cache meta write error");
                }
            }
            label
        }
        Err(e) => {
            error!(ns = "cargo_index", url = %url, error = %e, "[Downloading]");
            if !cache_exists {
                return plain_error(e.response_status(), CacheStatus::Error, "Please check logs...");
            }
            CacheStatus::Stale
        }
    };

    respond_with(&dest, CT_JSON, label).await
}

/// HUB generates the registry `config.json` itself so that cargo's download
/// and API traffic route back through this proxy. Written through to disk
/// once, then served from cache.
async fn generated_config(state: &AppState, key: &str, headers: &HeaderMap) -> Response {
    let dest = state
        .config
        .dir
        .join("cargo")
        .join(key)
        .join("index")
        .join("config.json");

    if tokio::fs::metadata(&dest).await.is_ok() {
        return respond_with(&dest, CT_JSON, CacheStatus::Hit).await;
    }

    let base_url = request_base_url(headers);
    let payload = IndexConfig {
        dl: format!("{base_url}/cargo/{key}/crates/{{crate}}/{{version}}/download"),
        api: format!("{base_url}/cargo/{key}/api"),
    };
    let data = match serde_json::to_vec(&payload) {
        Ok(data) => data,
        Err(e) => {
            error!(ns = "cargo_index", error = %e, "Config marshal error");
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    if let Err(e) = write_through(&dest, &data).await {
        error!(ns = "cargo_index", path = %dest.display(), error = %e, "Config write error");
        return plain_response(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let mut response = Response::new(Body::from(data));
    response
        .headers_mut()
        .insert(X_CACHE_STATUS, HeaderValue::from_static("MISS"));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(CT_JSON));
    response
}

async fn write_through(dest: &Path, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = dest.parent() {
        cache_meta::ensure_dir(parent).await?;
    }
    let mut file = cache_meta::open_private(dest).await?;
    file.write_all(data).await?;
    file.flush().await
}

/// `GET /cargo/{key}/crates/{crate}/{version}/download` — immutable
/// `.crate` artifacts.
pub async fn download_crate(
    AxumPath((key, krate, version)): AxumPath<(String, String, String)>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let (_, endpoints) = match lookup(&state, &key) {
        Ok(found) => found,
        Err(response) => return response,
    };
    if !is_safe_segment(&krate) || !is_safe_segment(&version) {
        return AppError::BadRequest("invalid path".into()).into_response();
    }

    let url = format!(
        "{}/{krate}/{version}/download",
        endpoints.dl.trim_end_matches('/')
    );
    let dest = state
        .config
        .dir
        .join("cargo")
        .join(&key)
        .join("crates")
        .join(&krate)
        .join(format!("{krate}-{version}.crate"));

    if tokio::fs::metadata(&dest).await.is_ok() {
        return respond_with(&dest, CT_CRATE, CacheStatus::Hit).await;
    }

    match fetch::fetch(&state.http, &url, &dest, &[("User-Agent", "cargo")]).await {
        Ok(()) => {
            debug!(ns = "cargo_crates", url = %url, dest = %dest.display(), "Remote saved");
            respond_with(&dest, CT_CRATE, CacheStatus::Miss).await
        }
        Err(e) => {
            error!(ns = "cargo_crates", url = %url, error = %e, "[Downloading]");
            if tokio::fs::metadata(&dest).await.is_err() {
                return plain_error(e.response_status(), CacheStatus::Error, "Please check logs...");
            }
            debug!(ns = "cargo_crates", url = %url, dest = %dest.display(), "Remote served from local file");
            respond_with(&dest, CT_CRATE, CacheStatus::Stale).await
        }
    }
}

/// `GET|HEAD /cargo/{key}/api` — API root passthrough.
pub async fn api_proxy_root(
    AxumPath(key): AxumPath<String>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    api_passthrough(&state, &key, "", query.as_deref(), method, &headers).await
}

/// `GET|HEAD /cargo/{key}/api/{*path}` — streaming API passthrough.
pub async fn api_proxy(
    AxumPath((key, path)): AxumPath<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    api_passthrough(&state, &key, &path, query.as_deref(), method, &headers).await
}

/// No caching here: the upstream response streams through verbatim, minus
/// hop-by-hop headers. Only the client's `Accept` is forwarded.
async fn api_passthrough(
    state: &AppState,
    key: &str,
    raw_path: &str,
    query: Option<&str>,
    method: Method,
    headers: &HeaderMap,
) -> Response {
    let (_, endpoints) = match lookup(state, key) {
        Ok(found) => found,
        Err(response) => return response,
    };

    if method != Method::GET && method != Method::HEAD {
        return plain_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let mut url = endpoints.api.trim_end_matches('/').to_string();
    if let Some(cleaned) = clean_wildcard(raw_path) {
        url.push('/');
        url.push_str(&cleaned);
    }
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }

    let mut request = state
        .http
        .request(method.clone(), &url)
        .header(USER_AGENT, "cargo");
    if let Some(accept) = headers.get(ACCEPT) {
        request = request.header(ACCEPT, accept);
    }

    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(ns = "cargo_api", url = %url, error = %e, "[Proxy]");
            return plain_response(StatusCode::BAD_GATEWAY);
        }
    };

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        response_headers.append(name.clone(), value.clone());
    }
    if !response_headers.contains_key(CONTENT_TYPE) {
        response_headers.insert(CONTENT_TYPE, HeaderValue::from_static(CT_JSON));
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(upstream.bytes_stream())
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

async fn respond_with(dest: &Path, content_type: &'static str, cache: CacheStatus) -> Response {
    match cached_file(dest, Some(content_type), cache).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
