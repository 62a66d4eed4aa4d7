//! Configuration model for the proxy.
//!
//! The configuration is a YAML document naming the cache root and, per
//! ecosystem, a map of registry key → upstream. Most ecosystems take a bare
//! URL; Cargo accepts either a bare URL (treated as `base`) or a mapping
//! with explicit `index`/`dl`/`api` endpoints; Galaxy accepts a remote `url`
//! or a local `dir`.
//!
//! ```yaml
//! dir: /var/cache/hub
//! server:
//!   pypi:
//!     pypi.org: https://pypi.org
//!   cargo:
//!     crates.io: https://crates.io
//!     internal:
//!       base: https://crates.internal
//!       index: https://crates.internal/sparse
//! ```
//!
//! The document is loaded once at startup and read-only thereafter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use url::Url;

use crate::error::{AppError, AppResult};

/// Top-level configuration: cache root plus the per-ecosystem registries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Filesystem root for all cache state.
    pub dir: PathBuf,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Registry maps, one per supported ecosystem.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub cargo: HashMap<String, CargoSource>,
    #[serde(default)]
    pub galaxy: HashMap<String, GalaxySource>,
    #[serde(default)]
    pub pypi: HashMap<String, String>,
    #[serde(default)]
    pub rubygems: HashMap<String, String>,
    #[serde(default, rename = "static")]
    pub static_mirrors: HashMap<String, String>,
    #[serde(default)]
    pub goproxy: HashMap<String, String>,
    #[serde(default)]
    pub npm: HashMap<String, String>,
}

/// A Cargo registry source: either a bare base URL or a mapping overriding
/// individual endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "CargoSourceRepr")]
pub struct CargoSource {
    pub base: String,
    pub index: Option<String>,
    pub dl: Option<String>,
    pub api: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CargoSourceRepr {
    Base(String),
    Full {
        #[serde(default)]
        base: String,
        #[serde(default)]
        index: Option<String>,
        #[serde(default)]
        dl: Option<String>,
        #[serde(default)]
        api: Option<String>,
    },
}

impl From<CargoSourceRepr> for CargoSource {
    fn from(repr: CargoSourceRepr) -> Self {
        match repr {
            CargoSourceRepr::Base(base) => CargoSource {
                base,
                ..CargoSource::default()
            },
            CargoSourceRepr::Full {
                base,
                index,
                dl,
                api,
            } => CargoSource {
                base,
                index,
                dl,
                api,
            },
        }
    }
}

impl From<String> for CargoSource {
    fn from(base: String) -> Self {
        CargoSource {
            base,
            ..CargoSource::default()
        }
    }
}

/// A Galaxy registry source: a remote proxy target or a local directory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GalaxySource {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Resolved Cargo endpoints for one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CargoEndpoints {
    pub index: String,
    pub dl: String,
    pub api: String,
}

impl CargoEndpoints {
    /// Resolve the endpoints for a source, defaulting `api`/`dl`/`index`
    /// from `base`. A base that is empty or not an absolute http(s) URL is
    /// a configuration error.
    pub fn from_source(source: &CargoSource) -> AppResult<Self> {
        let trimmed = source.base.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(AppError::Internal("empty cargo base URL".into()));
        }
        let parsed = Url::parse(trimmed)
            .map_err(|_| AppError::Internal(format!("invalid cargo base URL: {:?}", source.base)))?;
        if parsed.scheme().is_empty() || parsed.host_str().is_none() {
            return Err(AppError::Internal(format!(
                "invalid cargo base URL: {:?}",
                source.base
            )));
        }

        Ok(CargoEndpoints {
            index: source
                .index
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("{trimmed}/index")),
            dl: source
                .dl
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("{trimmed}/api/v1/crates")),
            api: source
                .api
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("{trimmed}/api")),
        })
    }
}

impl Config {
    /// Load and parse the YAML configuration file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| AppError::Internal(format!("config parse error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cargo_source_accepts_bare_string() {
        let config: Config = serde_yaml::from_str(
            r#"
dir: /tmp/hub
server:
  cargo:
    crates.io: https://crates.io
"#,
        )
        .unwrap();
        let source = &config.server.cargo["crates.io"];
        assert_eq!(source.base, "https://crates.io");
        assert!(source.index.is_none());
    }

    #[test]
    fn cargo_source_accepts_mapping() {
        let config: Config = serde_yaml::from_str(
            r#"
dir: /tmp/hub
server:
  cargo:
    internal:
      base: https://crates.internal
      index: https://crates.internal/sparse
"#,
        )
        .unwrap();
        let source = &config.server.cargo["internal"];
        assert_eq!(source.base, "https://crates.internal");
        assert_eq!(source.index.as_deref(), Some("https://crates.internal/sparse"));
        assert!(source.dl.is_none());
    }

    #[test]
    fn endpoints_default_from_base() {
        let source = CargoSource {
            base: "https://crates.io/".into(),
            ..CargoSource::default()
        };
        let endpoints = CargoEndpoints::from_source(&source).unwrap();
        assert_eq!(endpoints.index, "https://crates.io/index");
        assert_eq!(endpoints.dl, "https://crates.io/api/v1/crates");
        assert_eq!(endpoints.api, "https://crates.io/api");
    }

    #[test]
    fn endpoints_honor_overrides() {
        let source = CargoSource {
            base: "https://crates.io".into(),
            index: Some("https://index.crates.io".into()),
            dl: Some("https://static.crates.io/crates".into()),
            api: None,
        };
        let endpoints = CargoEndpoints::from_source(&source).unwrap();
        assert_eq!(endpoints.index, "https://index.crates.io");
        assert_eq!(endpoints.dl, "https://static.crates.io/crates");
        assert_eq!(endpoints.api, "https://crates.io/api");
    }

    #[test]
    fn endpoints_reject_malformed_base() {
        for base in ["", "   ", "not a url", "/relative/only"] {
            let source = CargoSource {
                base: base.into(),
                ..CargoSource::default()
            };
            assert!(CargoEndpoints::from_source(&source).is_err(), "base {base:?}");
        }
    }

    #[test]
    fn galaxy_source_accepts_url_or_dir() {
        let config: Config = serde_yaml::from_str(
            r#"
dir: /tmp/hub
server:
  galaxy:
    remote:
      url: https://galaxy.ansible.com
    local:
      dir: /srv/galaxy
"#,
        )
        .unwrap();
        assert!(config.server.galaxy["remote"].url.is_some());
        assert_eq!(
            config.server.galaxy["local"].dir.as_deref(),
            Some(Path::new("/srv/galaxy"))
        );
    }
}
