//! Assembles the listener, worker pool and per-connection pipeline.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dockgate_tls::{Credentials, DirLayout, TlsDir, TlsMaterial};
use tracing::info;

use crate::config::{BackendMode, Config, ConnectorConfig, TlsSource};
use crate::error::ProxyError;
use crate::proxy::{Connector, InboundConnection, Listener, Pipeline, Resolver, WorkerPool};
use crate::stats::ProxyStats;

/// Time open sessions get to finish once the listener has stopped.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The two TLS identities the proxy holds.
#[derive(Debug, Clone)]
pub struct ProxyTls {
    /// Presented to clients; its CA authenticates client certificates.
    pub proxy_facing: TlsMaterial,
    /// Presented to backends; its CA authenticates backend certificates.
    pub node_facing: TlsMaterial,
}

impl ProxyTls {
    /// Load both identities from the configured source.
    pub async fn load(config: &Config) -> Result<Self> {
        match &config.tls {
            TlsSource::Dirs { proxy, node } => {
                let proxy_facing = TlsDir::new(proxy, DirLayout::Server)
                    .load()
                    .context("Failed to load proxy-facing TLS material")?;
                let node_facing = TlsDir::new(node, DirLayout::Client)
                    .load()
                    .context("Failed to load node-facing TLS material")?;
                info!(proxy_dir = %proxy.display(), node_dir = %node.display(), "TLS material loaded from disk");
                Ok(Self {
                    proxy_facing,
                    node_facing,
                })
            }
            TlsSource::Endpoint { url } => {
                let client = reqwest::Client::builder()
                    .timeout(config.credentials_timeout)
                    .build()
                    .context("Failed to build credentials client")?;
                let credentials = Credentials::fetch(&client, url)
                    .await
                    .context("Failed to fetch proxy credentials")?;
                info!(url = %url, "TLS material fetched");
                Ok(Self {
                    proxy_facing: credentials.proxy_facing().clone(),
                    node_facing: credentials.node_facing().clone(),
                })
            }
        }
    }
}

/// A bound proxy, ready to serve.
pub struct Server {
    listener: Listener,
    pool: WorkerPool<InboundConnection>,
    stats: Arc<ProxyStats>,
}

impl Server {
    /// Build TLS configs, spawn the workers and bind the listener.
    pub async fn bind(config: &Config, tls: &ProxyTls) -> Result<Self> {
        let server_tls = tls
            .proxy_facing
            .server_config()
            .context("Invalid proxy-facing TLS material")?;

        let resolver =
            Resolver::new(config.resolver.clone()).context("Failed to build directory client")?;
        let connector = build_connector(&config.connector, &tls.node_facing)?;

        info!(
            lookup_url = %resolver.config().endpoint_template,
            backend_port = resolver.config().backend_port,
            "Resolver ready"
        );

        let stats = Arc::new(ProxyStats::default());
        let pipeline = Arc::new(Pipeline::new(resolver, connector, Arc::clone(&stats)));
        let pool = WorkerPool::spawn(config.pool, pipeline);
        let pool_config = pool.config();

        let listener = Listener::bind(
            config.listener.clone(),
            server_tls,
            pool.admission(),
            Arc::clone(&stats),
        )
        .await
        .with_context(|| format!("Failed to bind {}", config.listener.bind_addr))?;

        info!(
            workers = pool_config.workers,
            queue_capacity = pool_config.queue_capacity,
            "Proxy ready"
        );

        Ok(Self {
            listener,
            pool,
            stats,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// Serve until the listener fails.
    ///
    /// Open sessions get [`SHUTDOWN_GRACE`] to finish before they are
    /// aborted, so a fatal listener error always reaches the caller.
    pub async fn run(self) -> Result<(), ProxyError> {
        let result = self.listener.run().await;
        // The listener held the only admission handle besides the pool's.
        self.pool.drain(SHUTDOWN_GRACE).await;
        result
    }
}

fn build_connector(config: &ConnectorConfig, node_facing: &TlsMaterial) -> Result<Connector> {
    let connector = match config.mode {
        BackendMode::Tls => {
            let client_tls = node_facing
                .client_config(config.verification)
                .context("Invalid node-facing TLS material")?;
            Connector::tls(client_tls, config.server_name.clone())
        }
        BackendMode::Unix => Connector::unix(&config.socket_path),
    };
    Ok(connector.with_timeout(config.connect_timeout))
}
