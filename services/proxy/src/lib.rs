//! dockgate proxy
//!
//! Terminates mutually authenticated TLS from clients, derives a routing
//! identity from the client certificate, looks up that identity's backend
//! in a directory service and relays the byte stream to it.

pub mod config;
pub mod error;
pub mod proxy;
pub mod server;
pub mod stats;

pub use config::{BackendMode, Cli, Config, ConnectorConfig, LogFormat, TlsSource};
pub use error::ProxyError;
pub use proxy::{
    extract_identity, Connector, Identity, IdentityError, InboundConnection, Listener,
    ListenerConfig, Pipeline, PoolConfig, RelayReport, ResolvedRoute, Resolver, ResolverConfig,
    Session, WorkerPool,
};
pub use server::{ProxyTls, Server};
pub use stats::{ProxyStats, StatsSnapshot};
