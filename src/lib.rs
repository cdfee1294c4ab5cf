//! # offcache
//!
//! A network-first offline caching agent. It owns one versioned cache store,
//! pre-caches the assets an application needs to boot, purges stores left by
//! older versions, and answers GET requests from the network when it can and
//! from the cache when it cannot.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offcache::agent::OfflineAgent;
//! use offcache::cache::MemoryStorage;
//! use offcache::config::{AgentConfig, ProxyConfig};
//! use offcache::fetch::HttpFetcher;
//! use offcache::host::Registration;
//! use offcache::server::ProxyServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = ProxyConfig::new("127.0.0.1:8080", "127.0.0.1:8000");
//!     let network = Arc::new(HttpFetcher::new(&proxy.origin));
//!
//!     let agent = OfflineAgent::new(
//!         AgentConfig::default().with_env_overrides(),
//!         Arc::new(MemoryStorage::new()),
//!         network.clone(),
//!     );
//!     let registration = Arc::new(Registration::new());
//!     registration.register(Arc::new(agent)).await?;
//!
//!     ProxyServer::bind(&proxy).await?.run(registration, network).await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod cache;
pub mod config;
pub mod fetch;
pub mod host;
pub mod http;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use agent::{AgentError, FetchOutcome, LifecycleEvent, OfflineAgent, ResponseSource};
pub use cache::{CacheKey, CacheStorage, MemoryStorage};
pub use config::AgentConfig;
pub use http::{Headers, Method, Request, Response, StatusCode};
