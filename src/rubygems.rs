//! RubyGems adapter with hybrid freshness.
//!
//! Gem artifacts (`gems/*.gem`) are immutable; everything else on a gem
//! source mutates in place (specs indexes, info files), so a cached entry is
//! only a HIT when it is still byte-identical to the live upstream. The
//! comparison is abstracted behind [`UpstreamEquivalence`] so tests and
//! alternative deployments can substitute cheaper probes.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Path as AxumPath, RawQuery, State},
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::error::{AppError, AppResult};
use crate::fetch;
use crate::paths::clean_wildcard;
use crate::response::{cached_file, plain_error, CacheStatus};
use crate::sha256_hex;
use crate::state::AppState;

/// Content-equality probe between an upstream URL and a local cache entry.
#[async_trait]
pub trait UpstreamEquivalence: Send + Sync {
    /// True when the upstream body is byte-identical to the local file.
    async fn equivalent(&self, url: &str, local: &Path) -> AppResult<bool>;
}

/// Production probe: downloads the upstream body and compares SHA-256
/// digests with the local file. Never touches the cache entry.
pub struct DigestEquivalence {
    client: reqwest::Client,
}

impl DigestEquivalence {
    pub fn new(client: reqwest::Client) -> Self {
        DigestEquivalence { client }
    }
}

#[async_trait]
impl UpstreamEquivalence for DigestEquivalence {
    async fn equivalent(&self, url: &str, local: &Path) -> AppResult<bool> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", "rubygems")
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("equivalence probe failed: {e}")))?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let upstream = response
            .bytes()
            .await
            .map_err(|e| AppError::Internal(format!("equivalence probe read failed: {e}")))?;
        let local_bytes = tokio::fs::read(local).await?;
        Ok(sha256_hex(&upstream) == sha256_hex(&local_bytes))
    }
}

/// `GET /rubygems/{key}` — the source root (`__root` cache entry).
pub async fn proxy_root(
    AxumPath(key): AxumPath<String>,
    RawQuery(query): RawQuery,
    State(state): State<Arc<AppState>>,
) -> Response {
    serve(&state, &key, "", query.as_deref()).await
}

/// `GET /rubygems/{key}/{*path}`
pub async fn proxy(
    AxumPath((key, path)): AxumPath<(String, String)>,
    RawQuery(query): RawQuery,
    State(state): State<Arc<AppState>>,
) -> Response {
    serve(&state, &key, &path, query.as_deref()).await
}

async fn serve(state: &AppState, key: &str, raw_path: &str, query: Option<&str>) -> Response {
    let Some(base) = state.config.server.rubygems.get(key) else {
        return AppError::NotFound(format!("unknown rubygems registry: {key}")).into_response();
    };

    // The source root is a valid resource; it caches under "__root".
    let upstream_path = clean_wildcard(raw_path).unwrap_or_default();
    let cache_key = if upstream_path.is_empty() {
        "__root".to_string()
    } else {
        upstream_path.clone()
    };

    // Query strings select distinct upstream representations; isolate them
    // from the plain entries.
    let query = query.unwrap_or("");
    let cache_path = if query.is_empty() {
        cache_key
    } else {
        format!("_query/{}/{}", sha256_hex(query.as_bytes()), cache_key)
    };

    let mut url = format!("{}/", base.trim_end_matches('/'));
    url.push_str(&upstream_path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }

    let dest = state.config.dir.join("rubygems").join(key).join(&cache_path);

    let cache_exists = tokio::fs::metadata(&dest).await.is_ok();
    if cache_exists {
        let is_gem = upstream_path.starts_with("gems/") && upstream_path.ends_with(".gem");
        if is_gem {
            return respond_with(&dest, CacheStatus::Hit).await;
        }

        match state.gem_probe.equivalent(&url, &dest).await {
            Ok(true) => return respond_with(&dest, CacheStatus::Hit).await,
            Ok(false) => {}
            Err(e) => error!(ns = "rubygems", url = %url, error = %e, "[FilesEqual]"),
        }
    }

    match fetch::fetch(&state.http, &url, &dest, &[("User-Agent", "rubygems")]).await {
        Ok(()) => {
            debug!(ns = "rubygems", url = %url, dest = %dest.display(), "Remote saved");
            let label = if cache_exists {
                CacheStatus::Expired
            } else {
                CacheStatus::Miss
            };
            respond_with(&dest, label).await
        }
        Err(e) => {
            error!(ns = "rubygems", url = %url, error = %e, "[Downloading]");
            if tokio::fs::metadata(&dest).await.is_err() {
                return plain_error(e.response_status(), CacheStatus::Error, "Please check logs...");
            }
            debug!(ns = "rubygems", url = %url, dest = %dest.display(), "Remote served from local file");
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
