//! Credentials endpoint client.
//!
//! The API serves both trust domains in one document:
//!
//! ```json
//! {
//!   "docker":  { "ca": "...", "cert": "...", "key": "..." },
//!   "clients": { "ca": "...", "cert": "...", "key": "..." }
//! }
//! ```
//!
//! `clients` is the material used to terminate inbound connections and
//! `docker` is the identity the proxy presents to backends.

use serde::Deserialize;
use tracing::info;

use crate::error::TlsError;
use crate::material::TlsMaterial;

/// Placeholder replaced with the proxy's subject in the credentials URL.
pub const SUBJECT_PLACEHOLDER: &str = ":subject";

/// TLS material for both roles as served by the credentials endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    /// Node-facing material.
    pub docker: TlsMaterial,
    /// Proxy-facing material.
    pub clients: TlsMaterial,
}

impl Credentials {
    /// Material for terminating inbound client connections.
    pub fn proxy_facing(&self) -> &TlsMaterial {
        &self.clients
    }

    /// Material for authenticating the proxy to backends.
    pub fn node_facing(&self) -> &TlsMaterial {
        &self.docker
    }

    /// Fetch credentials from the endpoint.
    pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<Self, TlsError> {
        info!(url = %url, "Fetching credentials");

        let resp = client
            .get(url)
            .send()
            .await
            .map_err(|source| TlsError::CredentialsUnavailable {
                url: url.to_string(),
                source,
            })?;

        if !resp.status().is_success() {
            return Err(TlsError::CredentialsStatus {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|source| TlsError::CredentialsUnavailable {
                url: url.to_string(),
                source,
            })?;

        Self::from_json(url, &body)
    }

    fn from_json(url: &str, body: &str) -> Result<Self, TlsError> {
        serde_json::from_str(body).map_err(|source| TlsError::CredentialsPayload {
            url: url.to_string(),
            source,
        })
    }
}

/// Expand the credentials URL template for `subject`.
pub fn credentials_url(template: &str, subject: &str) -> String {
    template.replacen(SUBJECT_PLACEHOLDER, subject, 1)
}
