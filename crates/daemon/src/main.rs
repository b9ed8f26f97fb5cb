//! Cyreal core daemon (cyreald)
//!
//! Long-lived service that:
//! - Owns the configured physical serial links
//! - Multiplexes them to RFC-1918 agents over JSON-RPC 2.0 / HTTPS
//! - Adapts its own behavior through the governor hierarchy
//!
//! Default bind: 127.0.0.1:3500
//! JSON-RPC endpoint: POST /a2a
//! Notification stream: wss /a2a/ws

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cyreald::config::CoreConfig;
use cyreald::runtime::CoreRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cyreald=debug")),
        )
        .init();

    info!("Starting Cyreal core daemon (cyreald)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // The external loader hands the core a validated record; standalone runs
    // read a JSON rendition from CYREAL_CONFIG or fall back to defaults.
    let config = match std::env::var("CYREAL_CONFIG") {
        Ok(path) => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading configuration {}", path))?;
            serde_json::from_slice::<CoreConfig>(&bytes)
                .with_context(|| format!("parsing configuration {}", path))?
        }
        Err(_) => CoreConfig::default(),
    };

    let runtime = CoreRuntime::build(config)
        .await
        .context("core startup refused")?;

    runtime.run().await
}
