//! Backend dialing.
//!
//! Two transports are supported:
//! - TLS over TCP to the resolved `host:port`, authenticated with the
//!   node-facing identity
//! - a same-host unix control socket (the backend daemon's own socket)
//!
//! The connector never touches the inbound leg; on failure the caller is
//! responsible for closing it.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::resolver::ResolvedRoute;
use crate::error::ProxyError;

/// Default timeout covering dial and handshake to a backend.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default backend control socket for unix mode.
pub const DEFAULT_BACKEND_SOCKET: &str = "/var/run/docker.sock";

/// How backends are reached.
#[derive(Debug, Clone)]
pub enum BackendTransport {
    /// TLS over TCP to the resolved address.
    Tls {
        config: Arc<ClientConfig>,
        /// Name to verify the backend certificate against. Defaults to the
        /// resolved IP address.
        server_name: Option<ServerName<'static>>,
    },
    /// Unix domain socket on this host.
    Unix { path: PathBuf },
}

/// Opens the outbound leg for a resolved route.
#[derive(Debug, Clone)]
pub struct Connector {
    transport: BackendTransport,
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(transport: BackendTransport) -> Self {
        Self {
            transport,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// TLS transport using the node-facing client config.
    pub fn tls(config: Arc<ClientConfig>, server_name: Option<ServerName<'static>>) -> Self {
        Self::new(BackendTransport::Tls {
            config,
            server_name,
        })
    }

    /// Unix socket transport.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::new(BackendTransport::Unix { path: path.into() })
    }

    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Human readable backend target for logs and errors.
    pub fn target(&self, route: &ResolvedRoute) -> String {
        match &self.transport {
            BackendTransport::Tls { .. } => route.resolved_address.to_string(),
            BackendTransport::Unix { path } => format!("unix:{}", path.display()),
        }
    }

    /// Dial the backend for `route`.
    pub async fn connect(&self, route: &ResolvedRoute) -> Result<BackendStream, ProxyError> {
        let target = self.target(route);
        debug!(backend = %target, backend_id = %route.backend_id, "Connecting to backend");

        match timeout(self.connect_timeout, self.dial(route)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ProxyError::BackendUnreachable {
                backend: target,
                source,
            }),
            Err(_) => Err(ProxyError::BackendUnreachable {
                backend: target,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timeout"),
            }),
        }
    }

    async fn dial(&self, route: &ResolvedRoute) -> io::Result<BackendStream> {
        match &self.transport {
            BackendTransport::Tls {
                config,
                server_name,
            } => {
                let addr = route.resolved_address;
                let tcp = TcpStream::connect(addr).await?;
                tcp.set_nodelay(true)?;

                let name = server_name
                    .clone()
                    .unwrap_or_else(|| ServerName::IpAddress(addr.ip().into()));
                let tls = TlsConnector::from(Arc::clone(config))
                    .connect(name, tcp)
                    .await?;
                Ok(BackendStream::Tls(Box::new(tls)))
            }
            BackendTransport::Unix { path } => {
                Ok(BackendStream::Unix(UnixStream::connect(path).await?))
            }
        }
    }
}

/// An established backend connection.
#[derive(Debug)]
pub enum BackendStream {
    Tls(Box<TlsStream<TcpStream>>),
    Unix(UnixStream),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
            BackendStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
            BackendStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
            BackendStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
            BackendStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
