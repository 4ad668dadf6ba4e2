//! URL cache proxy server
//!
//! Loads configuration, sets up logging, and serves until Ctrl-C.

use anyhow::Context;
use std::env;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use url_cache_proxy::{ProxyConfig, ProxyServer};

/// # Usage
/// ```bash
/// # Start with default config (url_cache_proxy.yaml, or built-in defaults if absent)
/// cargo run
///
/// # Start with custom config
/// cargo run -- /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "url_cache_proxy.yaml".to_string());

    let config = if Path::new(&config_path).exists() {
        info!("Loading configuration from: {}", config_path);
        ProxyConfig::from_file(&config_path)
            .with_context(|| format!("invalid configuration in {}", config_path))?
    } else {
        info!("No configuration at {}, using defaults", config_path);
        ProxyConfig::default()
    };

    info!("  - Listen address: {}", config.listen_address);
    info!("  - Cache directory: {}", config.cache_dir.display());
    info!("  - Persist headers: {}", config.persist_headers);
    info!("  - Origin timeout: {:?}", config.origin_timeout());

    let server = ProxyServer::bind(&config).await.context("failed to start proxy")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    server.serve_until(shutdown).await?;
    info!("Proxy stopped");
    Ok(())
}
