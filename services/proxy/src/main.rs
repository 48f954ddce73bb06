//! dockgate
//!
//! mTLS terminating proxy for per-tenant container daemons.
//!
//! This service:
//! - Obtains its proxy-facing and node-facing TLS identities
//! - Accepts client connections and verifies their certificates
//! - Resolves each client identity to a backend via the directory service
//! - Relays the connection to that backend

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dockgate_proxy::{Cli, Config, LogFormat, ProxyTls, Server};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_cli(Cli::parse())?;

    // Prefer RUST_LOG, fall back to --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!("Starting dockgate");
    info!(
        bind_addr = %config.listener.bind_addr,
        lookup_url = %config.resolver.endpoint_template,
        workers = config.pool.workers,
        queue_capacity = config.pool.queue_capacity,
        backend_mode = ?config.connector.mode,
        "Configuration loaded"
    );

    let server = match start(&config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Startup failed");
            return Err(e);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!(reason = e.reason_code(), error = %e, "Listener stopped");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}

async fn start(config: &Config) -> Result<Server> {
    let tls = ProxyTls::load(config).await?;
    Server::bind(config, &tls).await
}
