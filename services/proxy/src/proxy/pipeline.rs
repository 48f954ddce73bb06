//! Per-connection work done by a pool worker.
//!
//! identity -> directory lookup -> backend dial -> relay. Any failure before
//! the relay starts closes the inbound leg and abandons the connection.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn, Instrument};

use super::connector::Connector;
use super::listener::InboundConnection;
use super::pool::ConnectionHandler;
use super::resolver::Resolver;
use super::session::Session;
use crate::error::ProxyError;
use crate::stats::ProxyStats;

/// Routes an established inbound connection to its backend.
pub struct Pipeline {
    resolver: Resolver,
    connector: Connector,
    stats: Arc<ProxyStats>,
}

impl Pipeline {
    pub fn new(resolver: Resolver, connector: Connector, stats: Arc<ProxyStats>) -> Self {
        Self {
            resolver,
            connector,
            stats,
        }
    }

    async fn serve(&self, conn: InboundConnection) {
        let InboundConnection { mut stream, .. } = conn;

        let peer_chain = stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default();

        let (identity, route) = match self.resolver.resolve(&peer_chain).await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.reject(&e);
                close_inbound(&mut stream).await;
                return;
            }
        };
        info!(
            user_id = %identity.subject_id,
            role = %identity.role,
            backend_id = %route.backend_id,
            backend_status = %route.status,
            backend_addr = %route.resolved_address,
            "Backend resolved"
        );

        let backend = match self.connector.connect(&route).await {
            Ok(backend) => backend,
            Err(e) => {
                self.reject(&e);
                close_inbound(&mut stream).await;
                return;
            }
        };
        info!(backend = %self.connector.target(&route), "Backend connected");

        self.stats.sessions_active.fetch_add(1, Ordering::Relaxed);
        let report = Session::new(stream, backend).proxy().await;
        self.stats.sessions_active.fetch_sub(1, Ordering::Relaxed);

        ProxyStats::incr(&self.stats.sessions_completed);
        self.stats
            .bytes_upstream
            .fetch_add(report.upload.bytes, Ordering::Relaxed);
        self.stats
            .bytes_downstream
            .fetch_add(report.download.bytes, Ordering::Relaxed);
    }

    fn reject(&self, err: &ProxyError) {
        let counter = match err {
            ProxyError::Identity(_) => &self.stats.identity_failed,
            ProxyError::BackendUnreachable { .. } => &self.stats.backend_failed,
            _ => &self.stats.resolve_failed,
        };
        ProxyStats::incr(counter);
        warn!(reason = err.reason_code(), error = %err, "Connection rejected");
    }
}

#[async_trait]
impl ConnectionHandler<InboundConnection> for Pipeline {
    async fn handle(&self, worker_id: usize, conn: InboundConnection) {
        let span = tracing::info_span!("connection", worker = worker_id, peer = %conn.peer_addr);
        self.serve(conn).instrument(span).await
    }
}

async fn close_inbound<S: AsyncWrite + Unpin>(stream: &mut S) {
    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "Inbound close error");
    }
}
