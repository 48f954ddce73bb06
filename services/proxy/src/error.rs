//! Per-connection error taxonomy.

use std::io;

use thiserror::Error;

use crate::proxy::IdentityError;

/// Errors raised while serving a single inbound connection.
///
/// Everything except [`ProxyError::Listener`] is scoped to one connection:
/// it is logged, the connection's legs are closed, and the worker moves on.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Inbound TLS handshake failed or timed out.
    #[error("handshake_failed: {0}")]
    Handshake(#[source] io::Error),

    /// Peer certificates carry no usable identity.
    #[error("identity_failed: {0}")]
    Identity(#[from] IdentityError),

    /// The directory could not be reached.
    #[error("directory_unavailable: {url}: {source}")]
    DirectoryUnavailable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The directory answered with an error status or an undecodable body.
    #[error("directory_error: {url}: {reason}")]
    Directory { url: String, reason: String },

    /// The backend address from the directory did not resolve.
    #[error("address_resolution_failed: {addr}: {reason}")]
    AddressResolution { addr: String, reason: String },

    /// Dialing or handshaking with the backend failed.
    #[error("backend_unreachable: {backend}: {source}")]
    BackendUnreachable {
        backend: String,
        #[source]
        source: io::Error,
    },

    /// The worker pool no longer accepts connections.
    #[error("pool_closed")]
    PoolClosed,

    /// The listening socket failed in a way that is not worth retrying.
    #[error("listener_failed: {0}")]
    Listener(#[source] io::Error),
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::Handshake(_) => "handshake_failed",
            ProxyError::Identity(_) => "identity_failed",
            ProxyError::DirectoryUnavailable { .. } => "directory_unavailable",
            ProxyError::Directory { .. } => "directory_error",
            ProxyError::AddressResolution { .. } => "address_resolution_failed",
            ProxyError::BackendUnreachable { .. } => "backend_unreachable",
            ProxyError::PoolClosed => "pool_closed",
            ProxyError::Listener(_) => "listener_failed",
        }
    }
}
