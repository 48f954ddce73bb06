//! TLS listener and admission.
//!
//! The accept loop runs on a single task. For each TCP connection it:
//! 1. completes the inbound mTLS handshake (bounded by the handshake timeout)
//! 2. hands the established stream to the worker pool, waiting while the
//!    admission queue is full
//!
//! Handshakes run on the accept task so that a saturated pool also stops
//! new handshakes. A failed handshake drops only that connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::pool::Admission;
use crate::error::ProxyError;
use crate::stats::ProxyStats;

/// Default bind address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:2376";

/// Default bound on the inbound handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a transient accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for the listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Upper bound on the inbound TLS handshake. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }
}

/// An inbound connection whose mTLS handshake has completed.
#[derive(Debug)]
pub struct InboundConnection {
    pub stream: TlsStream<TcpStream>,
    pub peer_addr: SocketAddr,
}

/// Accepts TCP connections, terminates TLS and feeds the worker pool.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    admission: Admission<InboundConnection>,
    stats: Arc<ProxyStats>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(
        config: ListenerConfig,
        tls: Arc<ServerConfig>,
        admission: Admission<InboundConnection>,
        stats: Arc<ProxyStats>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(ProxyError::Listener)?;
        let local_addr = listener.local_addr().map_err(ProxyError::Listener)?;

        info!(
            bind_addr = %local_addr,
            handshake_timeout_ms = config.handshake_timeout.map(|t| t.as_millis() as u64),
            "Listener bound"
        );

        Ok(Self {
            config,
            listener,
            acceptor: TlsAcceptor::from(tls),
            admission,
            stats,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop.
    ///
    /// Only returns on a fatal listener error or when the pool has shut down.
    pub async fn run(self) -> Result<(), ProxyError> {
        let local_addr = self.local_addr().map_err(ProxyError::Listener)?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let (tcp, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "Transient accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    return Err(ProxyError::Listener(e));
                }
            };
            ProxyStats::incr(&self.stats.connections_accepted);
            debug!(peer_addr = %peer_addr, "Connection accepted");

            let stream = match self.handshake(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    ProxyStats::incr(&self.stats.handshakes_failed);
                    warn!(
                        peer_addr = %peer_addr,
                        reason = e.reason_code(),
                        error = %e,
                        "Inbound handshake failed"
                    );
                    continue;
                }
            };

            if self.admission.available() == 0 {
                debug!(peer_addr = %peer_addr, "Admission queue full, waiting for a worker");
            }
            self.admission
                .admit(InboundConnection { stream, peer_addr })
                .await?;
            ProxyStats::incr(&self.stats.connections_admitted);
        }
    }

    async fn handshake(&self, tcp: TcpStream) -> Result<TlsStream<TcpStream>, ProxyError> {
        tcp.set_nodelay(true).map_err(ProxyError::Handshake)?;

        let accept = self.acceptor.accept(tcp);
        match self.config.handshake_timeout {
            Some(limit) => match timeout(limit, accept).await {
                Ok(result) => result.map_err(ProxyError::Handshake),
                Err(_) => Err(ProxyError::Handshake(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "handshake timeout",
                ))),
            },
            None => accept.await.map_err(ProxyError::Handshake),
        }
    }
}

/// Accept errors that concern one connection or a momentary resource
/// shortage rather than the listening socket itself.
fn is_transient_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new(DEFAULT_BIND_ADDR.parse().unwrap());
        assert_eq!(config.bind_addr.port(), 2376);
        assert_eq!(config.handshake_timeout, Some(DEFAULT_HANDSHAKE_TIMEOUT));
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(
            libc::EMFILE
        )));
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(
            libc::EBADF
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }
}
