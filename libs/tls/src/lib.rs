//! TLS material for the dockgate proxy.
//!
//! The proxy runs two unrelated trust domains:
//! - proxy-facing: terminates inbound mTLS and verifies client certificates
//! - node-facing: the identity the proxy presents to backend daemons
//!
//! Material for either role comes from a directory of PEM files
//! ([`TlsDir`]) or from the credentials endpoint ([`Credentials`]), and is
//! turned into rustls configs by [`TlsMaterial`].

mod credentials;
mod dir;
mod error;
mod material;

pub use credentials::{credentials_url, Credentials, SUBJECT_PLACEHOLDER};
pub use dir::{DirLayout, TlsDir};
pub use error::TlsError;
pub use material::{ServerVerification, TlsMaterial};
