//! Router construction and server bootstrap.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::state::AppState;
use crate::{cargo, goproxy, mirror, npm, rubygems};

/// Build the full HTTP surface over a prepared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/pypi/{key}/{*path}", get(mirror::pypi))
        .route("/rubygems/{key}", get(rubygems::proxy_root))
        .route("/rubygems/{key}/", get(rubygems::proxy_root))
        .route("/rubygems/{key}/{*path}", get(rubygems::proxy))
        .route("/galaxy/{key}/{*path}", get(mirror::galaxy))
        .route("/static/{key}/get/{*path}", get(mirror::static_mirror))
        .route("/goproxy/{key}/{*path}", get(goproxy::proxy))
        .route("/npm/{key}/{*path}", get(npm::proxy))
        .route("/cargo/{key}/api", get(cargo::api_proxy_root))
        .route("/cargo/{key}/api/{*path}", get(cargo::api_proxy))
        .route(
            "/cargo/{key}/crates/{crate}/{version}/download",
            get(cargo::download_crate),
        )
        .route("/cargo/{key}/{*path}", get(cargo::index))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn run_server(host: &str, port: u16, config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("failed to create cache root {}", config.dir.display()))?;
    info!(dir = %config.dir.display(), "Using cache directory");

    let state = Arc::new(AppState::new(config)?);
    let app = build_router(state);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid socket address {host}:{port}"))?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(addr = %addr, "Server listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    (StatusCode::OK, headers, r#"{"status": "healthy"}"#)
}
