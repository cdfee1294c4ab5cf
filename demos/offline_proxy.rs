//! Runs the offline proxy in front of a local origin.
//!
//! ```text
//! OFFCACHE_ORIGIN=127.0.0.1:8000 RUST_LOG=offcache=debug cargo run --example offline_proxy
//! ```
//!
//! An optional first argument names a JSON agent config file.

use std::sync::Arc;

use offcache::agent::OfflineAgent;
use offcache::cache::MemoryStorage;
use offcache::config::{AgentConfig, ProxyConfig};
use offcache::fetch::HttpFetcher;
use offcache::host::Registration;
use offcache::server::ProxyServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offcache=info")),
        )
        .init();

    let agent_config = match std::env::args().nth(1) {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    }
    .with_env_overrides();

    let listen = std::env::var("OFFCACHE_LISTEN").unwrap_or_else(|_| "127.0.0.1:8080".into());
    let origin = std::env::var("OFFCACHE_ORIGIN").unwrap_or_else(|_| "127.0.0.1:8000".into());
    let proxy = ProxyConfig::new(listen, origin);

    let network = Arc::new(HttpFetcher::new(&proxy.origin).connect_timeout(proxy.connect_timeout()));
    let registration = Arc::new(Registration::new());

    let agent = OfflineAgent::new(agent_config, Arc::new(MemoryStorage::new()), network.clone());
    if let Err(e) = registration.register(Arc::new(agent)).await {
        // Without an installed version every request passes straight through.
        tracing::warn!(error = %e, "agent install failed; proxying without offline support");
    }

    let server = ProxyServer::bind(&proxy).await?;
    println!("offline proxy on http://{} → {}", server.local_addr(), proxy.origin);
    server.run(registration, network).await?;
    Ok(())
}
