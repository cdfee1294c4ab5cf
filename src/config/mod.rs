//! Agent and proxy configuration.
//!
//! Defaults mirror the deployed agent: the `steppingstones-cache-v1` store
//! and the stylesheets, scripts, and fonts the application needs to boot
//! offline. Both can be replaced from a JSON document, and the cache name can
//! be overridden with `OFFCACHE_CACHE_NAME`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default cache version identifier.
pub const DEFAULT_CACHE_NAME: &str = "steppingstones-cache-v1";

/// Environment variable that overrides the cache version identifier.
pub const CACHE_NAME_ENV: &str = "OFFCACHE_CACHE_NAME";

/// Root path served as the last-resort offline page.
pub const OFFLINE_PAGE: &str = "/";

/// Default static asset list, pre-cached at install time.
pub const DEFAULT_STATIC_ASSETS: &[&str] = &[
    "/",
    "/static/css/bootstrap.min.css",
    "/static/css/bootstrap.min.css.map",
    "/static/scripts/bootstrap.bundle.min.js",
    "/static/scripts/bootstrap.bundle.min.js.map",
    "/static/scripts/jquery.min.js",
    "/static/scripts/moment.min.js",
    "/static/scripts/pdfmake.min.js",
    "/static/scripts/datetime-moment.min.js",
    "/static/fonts/exo/exo.css",
    "/static/fonts/exo/Exo-200.woff2",
    "/static/fonts/exo/Exo-400.woff2",
    "/static/fonts/exo/Exo-200.ttf",
    "/static/fonts/exo/Exo-400.ttf",
    "/static/fontawesomefree/css/fontawesome.min.css",
    "/static/fontawesomefree/css/regular.min.css",
    "/static/fontawesomefree/css/solid.min.css",
    "/static/css/event_table.css",
    "/static/scripts/event_table.js",
    "/static/scripts/jquery.formset.js",
    "/static/scripts/jquery.expander.js",
    "/static/scripts/bootstrap_input.js",
    "/static/scripts/safe-nonce.min.js",
    "/static/scripts/ss-forms.js",
    "/static/scripts/maintainscroll.min.js",
    "/static/fonts/RobotoMono-Regular.ttf",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cache name must not be empty")]
    EmptyCacheName,

    #[error("static asset `{0}` is not a root-relative path")]
    RelativeAsset(String),
}

/// What one agent version caches.
///
/// # Examples
///
/// ```
/// use offcache::config::AgentConfig;
///
/// let config = AgentConfig::from_json_str(
///     r#"{ "cache_name": "site-v2", "static_assets": ["/", "/app.js"] }"#,
/// ).unwrap();
/// assert_eq!(config.cache_name, "site-v2");
/// assert_eq!(config.static_assets.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Cache version identifier; stores with any other name are purged on activation.
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    /// Root-relative paths fetched and stored during install, in order.
    #[serde(default = "default_static_assets")]
    pub static_assets: Vec<String>,
}

fn default_cache_name() -> String {
    DEFAULT_CACHE_NAME.to_owned()
}

fn default_static_assets() -> Vec<String> {
    DEFAULT_STATIC_ASSETS.iter().map(|s| (*s).to_owned()).collect()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cache_name: default_cache_name(),
            static_assets: default_static_assets(),
        }
    }
}

impl AgentConfig {
    pub fn new(cache_name: impl Into<String>, static_assets: &[&str]) -> Self {
        Self {
            cache_name: cache_name.into(),
            static_assets: static_assets.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    /// Parses and validates a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Applies `OFFCACHE_CACHE_NAME` if it is set and non-empty.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(name) = std::env::var(CACHE_NAME_ENV).ok().filter(|v| !v.is_empty()) {
            self.cache_name = name;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::EmptyCacheName);
        }
        if let Some(bad) = self.static_assets.iter().find(|a| !a.starts_with('/')) {
            return Err(ConfigError::RelativeAsset(bad.clone()));
        }
        Ok(())
    }
}

/// Settings for the offline proxy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyConfig {
    /// Address the proxy listens on.
    pub listen: String,
    /// Origin (`host:port`) requests are forwarded to.
    pub origin: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl ProxyConfig {
    pub fn new(listen: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            origin: origin.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
