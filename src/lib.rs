//! # HUB — caching reverse proxy for package registries
//!
//! A single-process proxy between build tools and package-registry
//! upstreams: PyPI simple, RubyGems, the Go module proxy, npm, Cargo sparse
//! registries, Ansible Galaxy, and arbitrary static mirrors. Requests map to
//! deterministic cache paths under one filesystem root; missing artifacts
//! are fetched atomically, cached ones are reused, and protocols with
//! validator support are revalidated with conditional HTTP.
//!
//! ## Key modules
//!
//! - [`fetch`]: atomic conditional/plain downloaders
//! - [`cache_meta`]: ETag/Last-Modified sidecar store
//! - [`config`]: registry configuration model
//! - [`server`]: router and bootstrap
//! - per-protocol adapters: [`cargo`], [`npm`], [`goproxy`], [`rubygems`],
//!   [`mirror`]

pub mod cache_meta;
pub mod cargo;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod goproxy;
pub mod mirror;
pub mod npm;
pub mod paths;
pub mod response;
pub mod rubygems;
pub mod server;
pub mod state;

pub use config::{CargoEndpoints, CargoSource, Config, GalaxySource};
pub use error::{AppError, AppResult};
pub use response::{CacheStatus, X_CACHE_STATUS};
pub use server::{build_router, run_server};
pub use state::AppState;

/// SHA-256 of `data` as lowercase hex. Used to derive cache-path
/// components from query strings and Accept headers.
///
/// ```
/// assert_eq!(hub::sha256_hex(b"").len(), 64);
/// ```
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
