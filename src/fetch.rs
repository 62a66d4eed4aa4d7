//! Atomic upstream downloads, with and without HTTP revalidation.
//!
//! Both fetchers share one write discipline: the response body streams into
//! a uniquely named temporary file next to the destination, the file's mtime
//! is set from a parseable `Last-Modified`, and a single rename publishes
//! the entry. The rename is the linearization point — readers either see
//! the previous complete entry or the new one, never a partial write. A
//! drop guard removes the temporary file on every other exit path, so an
//! aborted transfer leaves the cache unchanged.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::StatusCode;
use filetime::FileTime;
use rand::Rng;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::cache_meta::{self, CacheMeta};

/// Request headers supplied by the calling adapter. Always includes a
/// `User-Agent`; may include `Accept`.
pub type RequestHeaders<'a> = &'a [(&'a str, &'a str)];

/// Outcome of a conditional fetch, carrying the validators observed on the
/// upstream response.
#[derive(Debug)]
pub enum Conditional {
    /// Upstream returned `200 OK`; the entry was replaced atomically.
    Fetched { validators: CacheMeta },
    /// Upstream returned `304 Not Modified`; nothing was written.
    NotModified { validators: CacheMeta },
}

/// Failure classes of a fetch, each mapping to the status the caller
/// reports when no cached copy can absorb the failure.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("upstream request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("upstream returned {0}")]
    UpstreamStatus(StatusCode),

    #[error("failed to create destination directory: {0}")]
    CacheDir(#[source] std::io::Error),

    #[error("cache write failed: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// HTTP status surfaced when the failure reaches the client.
    pub fn response_status(&self) -> StatusCode {
        match self {
            FetchError::Transport(e) if e.is_builder() => StatusCode::BAD_REQUEST,
            FetchError::Transport(_) => StatusCode::BAD_GATEWAY,
            FetchError::UpstreamStatus(status) => *status,
            FetchError::CacheDir(_) => StatusCode::CONFLICT,
            FetchError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Fetch `url` into `dest`, revalidating with the stored validators.
///
/// Non-empty `stored.etag` / `stored.last_modified` become `If-None-Match` /
/// `If-Modified-Since` request headers. A `304` answer touches no file.
pub async fn fetch_conditional(
    client: &Client,
    url: &str,
    dest: &Path,
    headers: RequestHeaders<'_>,
    stored: &CacheMeta,
) -> Result<Conditional, FetchError> {
    let mut request = client.get(url);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    if !stored.etag.is_empty() {
        request = request.header(IF_NONE_MATCH, &stored.etag);
    }
    if !stored.last_modified.is_empty() {
        request = request.header(IF_MODIFIED_SINCE, &stored.last_modified);
    }

    let response = request.send().await.map_err(FetchError::Transport)?;
    let validators = CacheMeta {
        etag: header_string(&response, ETAG.as_str()),
        last_modified: header_string(&response, LAST_MODIFIED.as_str()),
    };

    match response.status() {
        StatusCode::NOT_MODIFIED => Ok(Conditional::NotModified { validators }),
        StatusCode::OK => {
            store_body(response, dest, &validators.last_modified).await?;
            Ok(Conditional::Fetched { validators })
        }
        status => Err(FetchError::UpstreamStatus(status)),
    }
}

/// Fetch `url` into `dest` unconditionally. Used for immutable artifacts
/// and endpoints without reliable validators.
pub async fn fetch(
    client: &Client,
    url: &str,
    dest: &Path,
    headers: RequestHeaders<'_>,
) -> Result<(), FetchError> {
    let mut request = client.get(url);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }

    let response = request.send().await.map_err(FetchError::Transport)?;
    let last_modified = header_string(&response, LAST_MODIFIED.as_str());

    match response.status() {
        StatusCode::OK => {
            store_body(response, dest, &last_modified).await?;
            Ok(())
        }
        status => Err(FetchError::UpstreamStatus(status)),
    }
}

/// True when the entry at `dest` exists and its mtime is younger than
/// `ttl`. Used by the TTL-refreshed endpoints.
pub async fn within_ttl(dest: &Path, ttl: std::time::Duration) -> bool {
    match tokio::fs::metadata(dest).await.and_then(|m| m.modified()) {
        Ok(mtime) => SystemTime::now()
            .duration_since(mtime)
            .map(|age| age < ttl)
            .unwrap_or(true),
        Err(_) => false,
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Stream the response body into a temp file beside `dest` and publish it
/// with a single rename.
async fn store_body(
    mut response: reqwest::Response,
    dest: &Path,
    last_modified: &str,
) -> Result<(), FetchError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    cache_meta::ensure_dir(dir).await.map_err(FetchError::CacheDir)?;

    let basename = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let suffix: u16 = rand::rng().random_range(0..1000);
    let temp_path = dir.join(format!(".tmp.{basename}.{nanos}.{suffix}"));

    let guard = TempGuard::new(temp_path.clone());
    {
        let mut file = cache_meta::open_private(&temp_path).await?;
        while let Some(chunk) = response.chunk().await.map_err(FetchError::Transport)? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
    }

    // Carry the upstream timestamp onto the entry so mtime-based freshness
    // (TTL endpoints) observes upstream time, not fetch time.
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc2822(last_modified) {
        filetime::set_file_mtime(&temp_path, FileTime::from_unix_time(parsed.timestamp(), 0))?;
    }

    tokio::fs::rename(&temp_path, dest).await?;
    guard.disarm();
    debug!(dest = %dest.display(), "Cache entry published");
    Ok(())
}

/// Removes the owned temporary file unless the rename happened.
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        TempGuard { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn spawn_upstream(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn no_temp_files(dir: &Path) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(
                !name.to_string_lossy().starts_with(".tmp."),
                "leftover temp file {name:?}"
            );
        }
    }

    #[tokio::test]
    async fn plain_fetch_writes_atomically() {
        let upstream =
            spawn_upstream(Router::new().route("/file", get(|| async { "payload" }))).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("file");

        let client = Client::new();
        fetch(
            &client,
            &format!("http://{upstream}/file"),
            &dest,
            &[("User-Agent", "hub")],
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "payload");
        no_temp_files(dir.path());
    }

    #[tokio::test]
    async fn upstream_error_leaves_cache_untouched() {
        let upstream = spawn_upstream(Router::new().route(
            "/file",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("file");
        std::fs::write(&dest, b"previous").unwrap();

        let client = Client::new();
        let err = fetch(
            &client,
            &format!("http://{upstream}/file"),
            &dest,
            &[("User-Agent", "hub")],
        )
        .await
        .unwrap_err();

        assert_eq!(err.response_status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(std::fs::read(&dest).unwrap(), b"previous");
        no_temp_files(dir.path());
    }

    #[tokio::test]
    async fn conditional_fetch_records_and_replays_validators() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let upstream = spawn_upstream(Router::new().route(
            "/index",
            get(move |headers: HeaderMap| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if headers
                        .get("if-none-match")
                        .is_some_and(|v| v == "\"abc\"")
                    {
                        return StatusCode::NOT_MODIFIED.into_response();
                    }
                    ([("etag", "\"abc\"")], "index body").into_response()
                }
            }),
        ))
        .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("index");
        let client = Client::new();
        let url = format!("http://{upstream}/index");

        let first = fetch_conditional(&client, &url, &dest, &[("User-Agent", "hub")], &CacheMeta::default())
            .await
            .unwrap();
        let validators = match first {
            Conditional::Fetched { validators } => validators,
            other => panic!("expected Fetched, got {other:?}"),
        };
        assert_eq!(validators.etag, "\"abc\"");
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "index body");

        let mtime_before = std::fs::metadata(&dest).unwrap().modified().unwrap();
        let second = fetch_conditional(&client, &url, &dest, &[("User-Agent", "hub")], &validators)
            .await
            .unwrap();
        assert!(matches!(second, Conditional::NotModified { .. }));
        // A 304 writes nothing.
        assert_eq!(
            std::fs::metadata(&dest).unwrap().modified().unwrap(),
            mtime_before
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        no_temp_files(dir.path());
    }

    #[tokio::test]
    async fn last_modified_sets_entry_mtime() {
        let upstream = spawn_upstream(Router::new().route(
            "/dated",
            get(|| async {
                (
                    [("last-modified", "Sun, 06 Nov 1994 08:49:37 GMT")],
                    "dated body",
                )
            }),
        ))
        .await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dated");

        let client = Client::new();
        fetch(
            &client,
            &format!("http://{upstream}/dated"),
            &dest,
            &[("User-Agent", "hub")],
        )
        .await
        .unwrap();

        let mtime = FileTime::from_last_modification_time(&std::fs::metadata(&dest).unwrap());
        assert_eq!(mtime.unix_seconds(), 784111777);
    }

    #[tokio::test]
    async fn transport_error_maps_to_bad_gateway() {
        let client = Client::new();
        let dir = TempDir::new().unwrap();
        let err = fetch(
            &client,
            "http://127.0.0.1:1/unreachable",
            &dir.path().join("x"),
            &[("User-Agent", "hub")],
        )
        .await
        .unwrap_err();
        assert_eq!(err.response_status(), StatusCode::BAD_GATEWAY);
    }
}
