//! mTLS terminating proxy.
//!
//! This module provides:
//! - TLS listener with client certificate authentication
//! - Bounded worker pool with backpressure on accept
//! - Identity extraction from the peer certificate chain
//! - Directory lookup of the per-tenant backend
//! - Backend dialing (TLS or unix socket)
//! - Bidirectional relay with two-phase teardown
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener (mTLS) -> Admission queue -> Worker
//!                                                   |
//!                     Identity -> Resolver -> Connector -> Session -> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, Pipeline, PoolConfig, WorkerPool};
//!
//! let pipeline = Arc::new(Pipeline::new(resolver, connector, Arc::clone(&stats)));
//! let pool = WorkerPool::spawn(PoolConfig::new(5), pipeline);
//!
//! let config = ListenerConfig::new("0.0.0.0:2376".parse()?);
//! let listener = Listener::bind(config, server_tls, pool.admission(), stats).await?;
//! listener.run().await?;
//! ```

mod connector;
mod identity;
mod listener;
mod pipeline;
mod pool;
mod resolver;
mod session;

pub use connector::{
    BackendStream, BackendTransport, Connector, DEFAULT_BACKEND_SOCKET, DEFAULT_CONNECT_TIMEOUT,
};
pub use identity::{extract_identity, Identity, IdentityError};
pub use listener::{
    InboundConnection, Listener, ListenerConfig, DEFAULT_BIND_ADDR, DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use pipeline::Pipeline;
pub use pool::{Admission, ConnectionHandler, PoolConfig, WorkerPool, DEFAULT_WORKERS};
pub use resolver::{
    resolve_backend_address, ResolvedRoute, Resolver, ResolverConfig, DEFAULT_BACKEND_PORT,
    DEFAULT_DIRECTORY_TIMEOUT, ROLE_PLACEHOLDER, USER_ID_PLACEHOLDER,
};
pub use session::{CopyEnd, Direction, DirectionReport, ReadUnblocker, RelayReport, Session};
