//! End-to-end cache behavior: conditional revalidation, generated cargo
//! config, degraded serving, and cache consistency under concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::Path as AxumPath;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::Value;

mod common;
use common::{dead_upstream, hub_with, serve_hub, spawn_upstream};

const SERDE_INDEX_LINE: &str =
    r#"{"name":"serde","vers":"1.0.0","deps":[],"cksum":"0000","features":{},"yanked":false}"#;

/// Stub sparse index: serves one crate entry with a strong ETag and honors
/// `If-None-Match`.
fn sparse_index_upstream(hits: Arc<AtomicUsize>) -> Router {
    Router::new().route(
        "/index/se/rd/serde",
        get(move |headers: HeaderMap| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                if headers
                    .get("if-none-match")
                    .is_some_and(|v| v == "\"abc\"")
                {
                    return StatusCode::NOT_MODIFIED.into_response();
                }
                ([("etag", "\"abc\"")], SERDE_INDEX_LINE).into_response()
            }
        }),
    )
}

#[tokio::test]
async fn cargo_index_first_fetch_records_validators() {
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = spawn_upstream(sparse_index_upstream(hits.clone())).await;
    let hub = hub_with(|config| {
        config
            .server
            .cargo
            .insert("crates.io".into(), format!("http://{upstream}").into());
    });

    let response = hub.server.get("/cargo/crates.io/index/se/rd/serde").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), SERDE_INDEX_LINE);
    assert_eq!(response.header("x-cache-status"), "MISS");
    assert_eq!(response.header("content-type"), "application/json");

    let entry = hub
        .cache_root
        .path()
        .join("cargo/crates.io/index/se/rd/serde");
    assert_eq!(std::fs::read_to_string(&entry).unwrap(), SERDE_INDEX_LINE);

    let meta: Value = serde_json::from_slice(
        &std::fs::read(entry.with_file_name("serde.meta.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(meta["etag"], "\"abc\"");
}

#[tokio::test]
async fn cargo_index_revalidation_serves_cache_on_304() {
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = spawn_upstream(sparse_index_upstream(hits.clone())).await;
    let hub = hub_with(|config| {
        config
            .server
            .cargo
            .insert("crates.io".into(), format!("http://{upstream}").into());
    });

    let first = hub.server.get("/cargo/crates.io/index/se/rd/serde").await;
    assert_eq!(first.header("x-cache-status"), "MISS");

    let entry = hub
        .cache_root
        .path()
        .join("cargo/crates.io/index/se/rd/serde");
    let mtime_before = std::fs::metadata(&entry).unwrap().modified().unwrap();

    let second = hub.server.get("/cargo/crates.io/index/se/rd/serde").await;
    assert_eq!(second.status_code(), StatusCode::OK);
    assert_eq!(second.text(), SERDE_INDEX_LINE);
    assert_eq!(second.header("x-cache-status"), "HIT");

    // The 304 touched neither the entry nor its bytes.
    assert_eq!(
        std::fs::metadata(&entry).unwrap().modified().unwrap(),
        mtime_before
    );
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cargo_generated_config_roundtrip() {
    let hub = hub_with(|config| {
        config
            .server
            .cargo
            .insert("crates.io".into(), "https://crates.io".to_string().into());
    });

    let first = hub
        .server
        .get("/cargo/crates.io/index/config.json")
        .add_header("host", "h:6587")
        .await;
    assert_eq!(first.status_code(), StatusCode::OK);
    assert_eq!(first.header("x-cache-status"), "MISS");
    let body: Value = first.json();
    assert_eq!(
        body["dl"],
        "http://h:6587/cargo/crates.io/crates/{crate}/{version}/download"
    );
    assert_eq!(body["api"], "http://h:6587/cargo/crates.io/api");

    let second = hub
        .server
        .get("/cargo/crates.io/index/config.json")
        .add_header("host", "h:6587")
        .await;
    assert_eq!(second.header("x-cache-status"), "HIT");
    assert_eq!(second.json::<Value>(), body);

    // The root-level form resolves to the same generated file.
    let root_form = hub
        .server
        .get("/cargo/crates.io/config.json")
        .add_header("host", "h:6587")
        .await;
    assert_eq!(root_form.header("x-cache-status"), "HIT");
}

#[tokio::test]
async fn cargo_index_degrades_to_stale_then_error() {
    let hub = hub_with(|config| {
        config
            .server
            .cargo
            .insert("crates.io".into(), dead_upstream().into());
    });

    // No cache, dead upstream: the classified transport status surfaces.
    let error = hub.server.get("/cargo/crates.io/index/se/rd/serde").await;
    assert_eq!(error.status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(error.header("x-cache-status"), "ERROR");
    assert_eq!(error.text(), "Please check logs...");

    // Seed a cache entry; the same failure now degrades to it.
    let entry = hub
        .cache_root
        .path()
        .join("cargo/crates.io/index/se/rd/serde");
    std::fs::create_dir_all(entry.parent().unwrap()).unwrap();
    std::fs::write(&entry, SERDE_INDEX_LINE).unwrap();

    let stale = hub.server.get("/cargo/crates.io/index/se/rd/serde").await;
    assert_eq!(stale.status_code(), StatusCode::OK);
    assert_eq!(stale.text(), SERDE_INDEX_LINE);
    assert_eq!(stale.header("x-cache-status"), "STALE");
}

#[tokio::test]
async fn unknown_registry_key_is_not_found() {
    let hub = hub_with(|_| {});
    for path in [
        "/pypi/nope/simple/requests/",
        "/cargo/nope/index/config.json",
        "/goproxy/nope/example.com/mod/@latest",
        "/npm/nope/pkg",
        "/rubygems/nope/specs.4.8.gz",
    ] {
        let response = hub.server.get(path).await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND, "{path}");
    }
}

#[tokio::test]
async fn malformed_cargo_base_is_internal_error() {
    let hub = hub_with(|config| {
        config
            .server
            .cargo
            .insert("bad".into(), "not a url".to_string().into());
    });
    let response = hub.server.get("/cargo/bad/index/config.json").await;
    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.text().is_empty());
}

#[tokio::test]
async fn crate_download_is_immutable() {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    let upstream = spawn_upstream(Router::new().route(
        "/api/v1/crates/{krate}/{version}/download",
        get(
            move |AxumPath((krate, version)): AxumPath<(String, String)>| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    format!("crate bytes for {krate}-{version}")
                }
            },
        ),
    ))
    .await;

    let hub = hub_with(|config| {
        config
            .server
            .cargo
            .insert("crates.io".into(), format!("http://{upstream}").into());
    });

    let first = hub
        .server
        .get("/cargo/crates.io/crates/serde/1.0.0/download")
        .await;
    assert_eq!(first.status_code(), StatusCode::OK);
    assert_eq!(first.header("x-cache-status"), "MISS");
    assert_eq!(first.header("content-type"), "application/octet-stream");
    assert_eq!(first.text(), "crate bytes for serde-1.0.0");

    let second = hub
        .server
        .get("/cargo/crates.io/crates/serde/1.0.0/download")
        .await;
    assert_eq!(second.header("x-cache-status"), "HIT");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let entry = hub
        .cache_root
        .path()
        .join("cargo/crates.io/crates/serde/serde-1.0.0.crate");
    assert!(entry.exists());
}

#[tokio::test]
async fn concurrent_first_fetches_leave_consistent_cache() {
    let upstream = spawn_upstream(
        Router::new().route("/simple/requests", get(|| async { "simple index body" })),
    )
    .await;
    let hub = hub_with(|config| {
        config
            .server
            .pypi
            .insert("pypi.org".into(), format!("http://{upstream}"));
    });
    let addr = serve_hub(hub.state.clone()).await;

    let client = reqwest::Client::new();
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let url = format!("http://{addr}/pypi/pypi.org/simple/requests/");
        tasks.push(tokio::spawn(async move {
            let response = client.get(url).send().await.unwrap();
            (response.status(), response.text().await.unwrap())
        }));
    }
    for task in tasks {
        let (status, body) = task.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "simple index body");
    }

    let entry_dir = hub.cache_root.path().join("pypi/pypi.org/simple");
    let entry = entry_dir.join("requests");
    assert_eq!(std::fs::read_to_string(entry).unwrap(), "simple index body");
    for dir_entry in std::fs::read_dir(&entry_dir).unwrap() {
        let name = dir_entry.unwrap().file_name();
        assert!(
            !name.to_string_lossy().starts_with(".tmp."),
            "leftover temp file {name:?}"
        );
    }
}

#[tokio::test]
async fn mirror_degrades_like_the_rest() {
    let hub = hub_with(|config| {
        config.server.pypi.insert("pypi.org".into(), dead_upstream());
    });

    let error = hub.server.get("/pypi/pypi.org/simple/requests/").await;
    assert_eq!(error.status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(error.header("x-cache-status"), "ERROR");

    let entry = hub.cache_root.path().join("pypi/pypi.org/simple/requests");
    std::fs::create_dir_all(entry.parent().unwrap()).unwrap();
    std::fs::write(&entry, "cached index").unwrap();

    let stale = hub.server.get("/pypi/pypi.org/simple/requests/").await;
    assert_eq!(stale.status_code(), StatusCode::OK);
    assert_eq!(stale.text(), "cached index");
    assert_eq!(stale.header("x-cache-status"), "STALE");
}
