//! PEM material and rustls config construction.
//!
//! Each trust domain (proxy-facing, node-facing) is described by one
//! [`TlsMaterial`]: a CA bundle, a certificate chain and a private key.
//! The CA bundle is used both to verify peers and as the only root store,
//! so a certificate issued by one domain never validates in the other.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use serde::Deserialize;
use tracing::warn;

use crate::error::TlsError;

/// How the node-facing leg treats the backend's server certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerVerification {
    /// Verify the backend certificate against the role's CA.
    #[default]
    Verify,
    /// Accept any backend certificate.
    ///
    /// Only meant for deployments where the backend network is isolated and
    /// the backend identity is vouched for by topology. The proxy still
    /// presents its own client certificate.
    Skip,
}

/// PEM-encoded CA bundle, certificate chain and private key for one role.
#[derive(Clone, Deserialize)]
pub struct TlsMaterial {
    /// CA bundle used as the trust root for this role.
    #[serde(rename = "ca")]
    pub ca_pem: String,
    /// Certificate chain presented by the proxy.
    #[serde(rename = "cert")]
    pub cert_pem: String,
    /// Private key for `cert_pem`.
    #[serde(rename = "key")]
    pub key_pem: String,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_pem_len", &self.ca_pem.len())
            .field("cert_pem_len", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl TlsMaterial {
    /// Create material from PEM strings.
    pub fn new(
        ca_pem: impl Into<String>,
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Self {
        Self {
            ca_pem: ca_pem.into(),
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// Build the server config used to terminate inbound connections.
    ///
    /// Every client must present a certificate that chains to this role's CA.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let provider = crypto_provider();
        let roots = Arc::new(self.root_store()?);
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone()).build()?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain()?, self.private_key()?)?;

        Ok(Arc::new(config))
    }

    /// Build the client config used to dial backends.
    pub fn client_config(
        &self,
        verification: ServerVerification,
    ) -> Result<Arc<ClientConfig>, TlsError> {
        let provider = crypto_provider();
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let config = match verification {
            ServerVerification::Verify => builder
                .with_root_certificates(self.root_store()?)
                .with_client_auth_cert(self.cert_chain()?, self.private_key()?)?,
            ServerVerification::Skip => {
                warn!("backend server certificate verification is disabled");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(SkipServerVerification {
                        provider,
                    }))
                    .with_client_auth_cert(self.cert_chain()?, self.private_key()?)?
            }
        };

        Ok(Arc::new(config))
    }

    /// Parse the certificate chain.
    pub fn cert_chain(&self) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        parse_certs(&self.cert_pem, "certificate")
    }

    /// Parse the private key.
    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>, TlsError> {
        rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .map_err(|source| TlsError::Pem {
                what: "private key",
                source,
            })?
            .ok_or(TlsError::MissingPrivateKey)
    }

    /// Build a root store holding only this role's CA bundle.
    pub fn root_store(&self) -> Result<RootCertStore, TlsError> {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(parse_certs(&self.ca_pem, "CA bundle")?);
        if ignored > 0 {
            warn!(added, ignored, "some CA certificates could not be parsed");
        }
        if added == 0 {
            return Err(TlsError::EmptyCaBundle);
        }
        Ok(roots)
    }
}

fn parse_certs(pem: &str, what: &'static str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem { what, source })?;

    if certs.is_empty() {
        return Err(TlsError::MissingCertificate { what });
    }
    Ok(certs)
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server certificate verifier that accepts any certificate but still checks
/// handshake signatures.
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_parse_material() {
        let (cert, key) = self_signed();
        let material = TlsMaterial::new(cert.clone(), cert, key);

        assert_eq!(material.cert_chain().unwrap().len(), 1);
        assert!(material.private_key().is_ok());
        assert_eq!(material.root_store().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_key() {
        let (cert, _) = self_signed();
        let material = TlsMaterial::new(cert.clone(), cert, "");
        assert!(matches!(
            material.private_key(),
            Err(TlsError::MissingPrivateKey)
        ));
    }

    #[test]
    fn test_missing_ca() {
        let (cert, key) = self_signed();
        let material = TlsMaterial::new("", cert, key);
        assert!(matches!(
            material.root_store(),
            Err(TlsError::MissingCertificate { what: "CA bundle" })
        ));
        assert!(material.server_config().is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let (cert, key) = self_signed();
        let material = TlsMaterial::new(cert.clone(), cert, key.clone());
        let rendered = format!("{material:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(&key));
    }

    #[test]
    fn test_build_configs() {
        let (cert, key) = self_signed();
        let material = TlsMaterial::new(cert.clone(), cert, key);

        assert!(material.server_config().is_ok());
        assert!(material.client_config(ServerVerification::Verify).is_ok());
        assert!(material.client_config(ServerVerification::Skip).is_ok());
    }
}
