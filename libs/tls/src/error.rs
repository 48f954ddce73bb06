//! Error types for TLS material loading.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading TLS material or building rustls configs.
///
/// All of these are startup-time failures: the proxy refuses to start
/// rather than run with partial trust configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM file could not be read.
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// PEM data could not be parsed.
    #[error("invalid PEM in {what}: {source}")]
    Pem {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// The certificate PEM held no certificates.
    #[error("no certificate found in {what}")]
    MissingCertificate { what: &'static str },

    /// The key PEM held no private key.
    #[error("no private key found")]
    MissingPrivateKey,

    /// None of the CA certificates could be added to the trust store.
    #[error("CA bundle contains no usable certificates")]
    EmptyCaBundle,

    /// rustls rejected the assembled configuration.
    #[error("tls config error: {0}")]
    Config(#[from] rustls::Error),

    /// The client certificate verifier could not be built.
    #[error("client verifier error: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    /// The credentials endpoint could not be reached.
    #[error("credentials endpoint {url} unavailable: {source}")]
    CredentialsUnavailable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The credentials endpoint answered with a non-success status.
    #[error("credentials endpoint {url} returned status {status}")]
    CredentialsStatus { url: String, status: u16 },

    /// The credentials payload was not the expected JSON document.
    #[error("invalid credentials payload from {url}: {source}")]
    CredentialsPayload {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}
