//! Cache-on-read adapters: PyPI simple, Ansible Galaxy, static mirrors.
//!
//! These ecosystems need no revalidation: an entry on disk is served as-is,
//! an absent entry is fetched once, and upstream failures degrade to the
//! cached copy when one exists.

use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::error::AppError;
use crate::fetch;
use crate::paths::clean_wildcard;
use crate::response::{cached_file, plain_error, CacheStatus};
use crate::state::AppState;

/// `GET /pypi/{key}/{*path}`
pub async fn pypi(
    AxumPath((key, path)): AxumPath<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(base) = state.config.server.pypi.get(&key) else {
        return AppError::NotFound(format!("unknown pypi registry: {key}")).into_response();
    };
    serve_mirror(&state, "pypi", &key, base, &path, "pypi").await
}

/// `GET /static/{key}/get/{*path}`
pub async fn static_mirror(
    AxumPath((key, path)): AxumPath<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(base) = state.config.server.static_mirrors.get(&key) else {
        return AppError::NotFound(format!("unknown static registry: {key}")).into_response();
    };
    serve_mirror(&state, "static", &key, base, &path, "hub").await
}

/// `GET /galaxy/{key}/{*path}`
///
/// A galaxy registry configured with a remote `url` behaves like the other
/// mirrors. One configured with a local `dir` serves files straight from
/// that directory, read-only.
pub async fn galaxy(
    AxumPath((key, path)): AxumPath<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(source) = state.config.server.galaxy.get(&key) else {
        return AppError::NotFound(format!("unknown galaxy registry: {key}")).into_response();
    };

    if let Some(base) = source.url.as_deref() {
        return serve_mirror(&state, "galaxy", &key, base, &path, "galaxy").await;
    }
    if let Some(dir) = source.dir.as_deref() {
        return serve_local(dir, &path).await;
    }
    AppError::NotFound(format!("galaxy registry {key} has no url or dir")).into_response()
}

async fn serve_local(dir: &Path, raw_path: &str) -> Response {
    let Some(cleaned) = clean_wildcard(raw_path) else {
        return AppError::NotFound("empty path".into()).into_response();
    };
    let local = dir.join(&cleaned);
    if tokio::fs::metadata(&local).await.is_err() {
        return AppError::NotFound(format!("no such file: {cleaned}")).into_response();
    }
    match cached_file(&local, None, CacheStatus::Hit).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Shared cache-on-read flow: HIT from disk, MISS on first fetch, STALE on
/// fetch failure with a cached copy, ERROR otherwise.
async fn serve_mirror(
    state: &AppState,
    ecosystem: &'static str,
    key: &str,
    upstream_base: &str,
    raw_path: &str,
    user_agent: &'static str,
) -> Response {
    let Some(cleaned) = clean_wildcard(raw_path) else {
        return AppError::NotFound("empty path".into()).into_response();
    };

    let url = format!("{}/{}", upstream_base.trim_end_matches('/'), cleaned);
    let dest = state.config.dir.join(ecosystem).join(key).join(&cleaned);

    if tokio::fs::metadata(&dest).await.is_ok() {
        debug!(ns = ecosystem, path = %dest.display(), "Serving cached file");
        return respond_with(&dest, CacheStatus::Hit).await;
    }

    match fetch::fetch(&state.http, &url, &dest, &[("User-Agent", user_agent)]).await {
        Ok(()) => {
            debug!(ns = ecosystem, url = %url, dest = %dest.display(), "Remote saved");
            respond_with(&dest, CacheStatus::Miss).await
        }
        Err(e) => {
            error!(ns = ecosystem, url = %url, error = %e, "[Downloading]");
            if tokio::fs::metadata(&dest).await.is_err() {
                return plain_error(e.response_status(), CacheStatus::Error, "Please check logs...");
            }
            debug!(ns = ecosystem, url = %url, dest = %dest.display(), "Remote served from local file");
            respond_with(&dest, CacheStatus::Stale).await
        }
    }
}

async fn respond_with(dest: &Path, cache: CacheStatus) -> Response {
    match cached_file(dest, None, cache).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
