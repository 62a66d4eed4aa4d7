//! Shared services threaded through every request handler.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::rubygems::{DigestEquivalence, UpstreamEquivalence};

/// Application state: the parsed configuration plus the long-lived clients.
///
/// Wrapped in an `Arc` and shared across handlers. The core holds no other
/// process-wide mutable state; the filesystem under `config.dir` is the only
/// shared mutable resource.
#[derive(Clone)]
pub struct AppState {
    /// Parsed registry configuration, read-only after startup.
    pub config: Arc<Config>,
    /// Shared HTTP client for all upstream traffic.
    pub http: reqwest::Client,
    /// Content-equality probe for the RubyGems hybrid freshness check.
    pub gem_probe: Arc<dyn UpstreamEquivalence>,
}

impl AppState {
    pub fn new(config: Config) -> AppResult<Self> {
        // No overall request timeout: artifact downloads can legitimately
        // run long. Connect attempts are bounded.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to create HTTP client: {e}")))?;

        Ok(AppState {
            config: Arc::new(config),
            gem_probe: Arc::new(DigestEquivalence::new(http.clone())),
            http,
        })
    }
}
