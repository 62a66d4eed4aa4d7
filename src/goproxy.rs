//! Go module proxy adapter.
//!
//! Five endpoint shapes hang off one wildcard: `<module>/@v/list`,
//! `<module>/@v/<version>.{info,mod,zip}` and `<module>/@latest`. The cache
//! mirrors the URL 1:1 under `goproxy/<key>/`. Version lists and metadata
//! are refetched on every request (with the cached copy absorbing upstream
//! failures); zips are immutable; `@latest` is refreshed hourly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, State},
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::error::AppError;
use crate::fetch::{self, within_ttl};
use crate::paths::clean_wildcard;
use crate::response::{cached_file, plain_error, CacheStatus};
use crate::state::AppState;

const LATEST_TTL: Duration = Duration::from_secs(60 * 60);
const USER_AGENT: (&str, &str) = ("User-Agent", "go/goproxy");

const CT_TEXT: &str = "text/plain; charset=utf-8";
const CT_JSON: &str = "application/json";
const CT_ZIP: &str = "application/zip";

/// `GET /goproxy/{key}/{*path}` — dispatches on the goproxy suffix.
pub async fn proxy(
    AxumPath((key, path)): AxumPath<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(base) = state.config.server.goproxy.get(&key) else {
        return AppError::NotFound(format!("unknown goproxy registry: {key}")).into_response();
    };
    let Some(cleaned) = clean_wildcard(&path) else {
        return AppError::NotFound("empty path".into()).into_response();
    };

    if let Some(module) = cleaned.strip_suffix("/@v/list") {
        if module.is_empty() {
            return AppError::BadRequest("invalid path".into()).into_response();
        }
        return refetch_endpoint(&state, &key, base, &cleaned, "goproxy_list", CT_TEXT).await;
    }

    if let Some(module) = cleaned.strip_suffix("/@latest") {
        if module.is_empty() {
            return AppError::BadRequest("invalid path".into()).into_response();
        }
        return latest(&state, &key, base, &cleaned).await;
    }

    let Some((module, file)) = cleaned.split_once("/@v/") else {
        return AppError::NotFound(format!("unsupported goproxy path: {cleaned}")).into_response();
    };
    if module.is_empty() || file.is_empty() {
        return AppError::BadRequest("invalid path".into()).into_response();
    }

    if file.ends_with(".info") {
        refetch_endpoint(&state, &key, base, &cleaned, "goproxy_info", CT_JSON).await
    } else if file.ends_with(".mod") {
        refetch_endpoint(&state, &key, base, &cleaned, "goproxy_mod", CT_TEXT).await
    } else if file.ends_with(".zip") {
        zip(&state, &key, base, &cleaned).await
    } else {
        AppError::BadRequest("invalid path".into()).into_response()
    }
}

/// list / .info / .mod: plain fetch on every request, cached fallback.
async fn refetch_endpoint(
    state: &AppState,
    key: &str,
    base: &str,
    cleaned: &str,
    ns: &'static str,
    content_type: &'static str,
) -> Response {
    let url = upstream_url(base, cleaned);
    let dest = cache_dest(state, key, cleaned);

    match fetch::fetch(&state.http, &url, &dest, &[USER_AGENT]).await {
        Ok(()) => {
            debug!(ns = ns, url = %url, dest = %dest.display(), "Remote saved");
            respond_with(&dest, content_type, CacheStatus::Miss).await
        }
        Err(e) => degrade(&url, &dest, content_type, ns, e).await,
    }
}

/// .zip: immutable module archives.
async fn zip(state: &AppState, key: &str, base: &str, cleaned: &str) -> Response {
    let url = upstream_url(base, cleaned);
    let dest = cache_dest(state, key, cleaned);

    if tokio::fs::metadata(&dest).await.is_ok() {
        debug!(ns = "goproxy_zip", path = %dest.display(), "Serving cached file");
        return respond_with(&dest, CT_ZIP, CacheStatus::Hit).await;
    }

    match fetch::fetch(&state.http, &url, &dest, &[USER_AGENT]).await {
        Ok(()) => {
            debug!(ns = "goproxy_zip", url = %url, dest = %dest.display(), "Remote saved");
            respond_with(&dest, CT_ZIP, CacheStatus::Miss).await
        }
        Err(e) => degrade(&url, &dest, CT_ZIP, "goproxy_zip", e).await,
    }
}

/// `@latest`: refreshed when the cached copy is older than one hour.
async fn latest(state: &AppState, key: &str, base: &str, cleaned: &str) -> Response {
    let url = upstream_url(base, cleaned);
    let dest = cache_dest(state, key, cleaned);

    if within_ttl(&dest, LATEST_TTL).await {
        debug!(ns = "goproxy_latest", path = %dest.display(), "Serving cached @latest");
        return respond_with(&dest, CT_JSON, CacheStatus::Hit).await;
    }

    match fetch::fetch(&state.http, &url, &dest, &[USER_AGENT]).await {
        Ok(()) => {
            debug!(ns = "goproxy_latest", url = %url, dest = %dest.display(), "Remote saved");
            respond_with(&dest, CT_JSON, CacheStatus::Miss).await
        }
        Err(e) => degrade(&url, &dest, CT_JSON, "goproxy_latest", e).await,
    }
}

async fn degrade(
    url: &str,
    dest: &Path,
    content_type: &'static str,
    ns: &'static str,
    e: fetch::FetchError,
) -> Response {
    error!(ns = ns, url = %url, error = %e, "[Downloading]");
    if tokio::fs::metadata(dest).await.is_err() {
        // Absent upstream plus absent cache surfaces as gone.
        return plain_error(e.response_status(), CacheStatus::Error, "410 Gone\n");
    }
    debug!(ns = ns, url = %url, dest = %dest.display(), "Remote served from local file");
    respond_with(dest, content_type, CacheStatus::Stale).await
}

fn upstream_url(base: &str, cleaned: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), cleaned)
}

fn cache_dest(state: &AppState, key: &str, cleaned: &str) -> std::path::PathBuf {
    state.config.dir.join("goproxy").join(key).join(cleaned)
}

async fn respond_with(dest: &Path, content_type: &'static str, cache: CacheStatus) -> Response {
    match cached_file(dest, Some(content_type), cache).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
