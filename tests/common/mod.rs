//! Shared helpers for the integration suite: a proxy instance over a
//! temporary cache root, and stub upstream registries on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum_test::TestServer;
use tempfile::TempDir;

use hub::{build_router, AppState, Config};

pub struct TestHub {
    pub server: TestServer,
    pub state: Arc<AppState>,
    // Keeps the cache root alive for the duration of the test.
    pub cache_root: TempDir,
}

/// Build a proxy over a fresh cache root, letting the test fill in the
/// registry maps.
pub fn hub_with(configure: impl FnOnce(&mut Config)) -> TestHub {
    let cache_root = TempDir::new().expect("temp cache root");
    let mut config = Config {
        dir: cache_root.path().to_path_buf(),
        ..Config::default()
    };
    configure(&mut config);

    let state = Arc::new(AppState::new(config).expect("app state"));
    let server = TestServer::new(build_router(state.clone())).expect("test server");
    TestHub {
        server,
        state,
        cache_root,
    }
}

/// Serve a stub upstream registry on an ephemeral port.
pub async fn spawn_upstream(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve upstream");
    });
    addr
}

/// Serve the proxy itself on an ephemeral port, for tests that need real
/// sockets (HEAD requests, concurrent clients).
pub async fn serve_hub(state: Arc<AppState>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind hub");
    let addr = listener.local_addr().expect("hub addr");
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve hub");
    });
    addr
}

/// A dead upstream address: nothing listens on port 1.
pub fn dead_upstream() -> String {
    "http://127.0.0.1:1".to_string()
}
