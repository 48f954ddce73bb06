//! Identity-based backend resolution.
//!
//! Every connection is resolved afresh: the peer identity is substituted
//! into the lookup template, the directory answers with the backend's bare
//! host, and the fixed backend port is appended before DNS resolution.
//! Nothing is cached.
//!
//! Directory response:
//!
//! ```json
//! { "id": "i1", "addr": "10.0.0.5", "status": "running" }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use serde::Deserialize;
use tracing::debug;

use super::identity::{extract_identity, Identity};
use crate::error::ProxyError;

/// Port every backend daemon listens on.
pub const DEFAULT_BACKEND_PORT: u16 = 2376;

/// Default timeout for a directory request.
pub const DEFAULT_DIRECTORY_TIMEOUT: Duration = Duration::from_secs(10);

/// Placeholder for the subject CommonName in the lookup template.
pub const USER_ID_PLACEHOLDER: &str = ":userId";

/// Placeholder for the first OrganizationalUnit in the lookup template.
pub const ROLE_PLACEHOLDER: &str = ":role";

/// Resolver configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Lookup URL template containing `:userId` and `:role`.
    pub endpoint_template: String,
    /// Port appended to the directory's bare host.
    pub backend_port: u16,
    /// Timeout for one directory request.
    pub request_timeout: Duration,
}

impl ResolverConfig {
    pub fn new(endpoint_template: impl Into<String>) -> Self {
        Self {
            endpoint_template: endpoint_template.into(),
            backend_port: DEFAULT_BACKEND_PORT,
            request_timeout: DEFAULT_DIRECTORY_TIMEOUT,
        }
    }
}

/// Directory answer for one identity.
#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    #[serde(default)]
    id: String,
    addr: String,
    #[serde(default)]
    status: String,
}

/// Backend location resolved for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    /// Backend instance id reported by the directory.
    pub backend_id: String,
    /// Bare host reported by the directory.
    pub raw_address: String,
    /// Instance status reported by the directory.
    pub status: String,
    /// `raw_address` joined with the backend port and resolved.
    pub resolved_address: SocketAddr,
}

/// Maps a verified peer identity to a backend address.
#[derive(Debug, Clone)]
pub struct Resolver {
    config: ResolverConfig,
    client: reqwest::Client,
}

impl Resolver {
    /// Create a resolver with its own HTTP client.
    pub fn new(config: ResolverConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Build the lookup URL for an identity.
    pub fn lookup_url(&self, identity: &Identity) -> String {
        expand_template(
            &self.config.endpoint_template,
            &[
                (USER_ID_PLACEHOLDER, identity.subject_id.as_str()),
                (ROLE_PLACEHOLDER, identity.role.as_str()),
            ],
        )
    }

    /// Extract the identity from the peer chain and resolve its backend.
    pub async fn resolve(
        &self,
        peer_chain: &[CertificateDer<'_>],
    ) -> Result<(Identity, ResolvedRoute), ProxyError> {
        let identity = extract_identity(peer_chain)?;
        let route = self.resolve_identity(&identity).await?;
        Ok((identity, route))
    }

    /// Query the directory for an identity and resolve the backend address.
    pub async fn resolve_identity(&self, identity: &Identity) -> Result<ResolvedRoute, ProxyError> {
        let url = self.lookup_url(identity);
        debug!(url = %url, "Resolving backend");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| ProxyError::DirectoryUnavailable {
                url: url.clone(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProxyError::Directory {
                url,
                reason: format!("status {status}"),
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|source| ProxyError::DirectoryUnavailable {
                url: url.clone(),
                source,
            })?;

        let entry: DirectoryEntry =
            serde_json::from_slice(&body).map_err(|e| ProxyError::Directory {
                url: url.clone(),
                reason: format!("invalid response body: {e}"),
            })?;

        if entry.addr.trim().is_empty() {
            return Err(ProxyError::Directory {
                url,
                reason: "empty backend address".to_string(),
            });
        }

        let resolved_address = resolve_backend_address(&entry.addr, self.config.backend_port).await?;

        Ok(ResolvedRoute {
            backend_id: entry.id,
            raw_address: entry.addr,
            status: entry.status,
            resolved_address,
        })
    }
}

/// Join a bare host with `port` and resolve it to one socket address.
pub async fn resolve_backend_address(host: &str, port: u16) -> Result<SocketAddr, ProxyError> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');

    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProxyError::AddressResolution {
            addr: format!("{host}:{port}"),
            reason: e.to_string(),
        })?;

    addrs.next().ok_or_else(|| ProxyError::AddressResolution {
        addr: format!("{host}:{port}"),
        reason: "no addresses".to_string(),
    })
}

/// Replace the first occurrence of each placeholder in `template`.
///
/// Substituted values are never rescanned, so an identity that happens to
/// contain a placeholder string cannot alter the URL shape. This differs from
/// replacing `:userId` and then `:role` in sequence: there a subject ID of
/// `x:role` would have its own `:role` substituted, giving `/xdev/:role`
/// instead of `/x:role/dev`.
fn expand_template(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut hits: Vec<(usize, &str, &str)> = substitutions
        .iter()
        .filter_map(|(placeholder, value)| {
            template
                .find(placeholder)
                .map(|pos| (pos, *placeholder, *value))
        })
        .collect();
    hits.sort_by_key(|(pos, _, _)| *pos);

    let mut out = String::with_capacity(template.len());
    let mut cursor = 0;
    for (pos, placeholder, value) in hits {
        if pos < cursor {
            continue;
        }
        out.push_str(&template[cursor..pos]);
        out.push_str(value);
        cursor = pos + placeholder.len();
    }
    out.push_str(&template[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use axum::{extract::Path, http::StatusCode, routing::get, Json, Router};
    use rstest::rstest;
    use tokio::net::TcpListener;

    use crate::proxy::IdentityError;

    fn identity(subject_id: &str, role: &str) -> Identity {
        Identity {
            subject_id: subject_id.to_string(),
            role: role.to_string(),
        }
    }

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn resolver(base: &str) -> Resolver {
        Resolver::new(ResolverConfig::new(format!(
            "{base}/api/v1/proxy/instance/:userId/:role"
        )))
        .unwrap()
    }

    #[rstest]
    #[case("http://api/instance/:userId/:role", "alice", "dev", "http://api/instance/alice/dev")]
    #[case("http://api/:role?user=:userId", "bob", "ops", "http://api/ops?user=bob")]
    #[case("http://api/:userId/:userId", "carol", "dev", "http://api/carol/:userId")]
    #[case("http://api/static", "dave", "dev", "http://api/static")]
    #[case("http://api/:userId/:role", "x:role", "dev", "http://api/x:role/dev")]
    fn test_lookup_url(
        #[case] template: &str,
        #[case] subject_id: &str,
        #[case] role: &str,
        #[case] expected: &str,
    ) {
        let resolver = Resolver::new(ResolverConfig::new(template)).unwrap();
        assert_eq!(resolver.lookup_url(&identity(subject_id, role)), expected);
    }

    #[tokio::test]
    async fn test_resolve_backend_address() {
        let addr = resolve_backend_address("10.0.0.5", 2376).await.unwrap();
        assert_eq!(addr.to_string(), "10.0.0.5:2376");

        let addr = resolve_backend_address("[::1]", 2376).await.unwrap();
        assert_eq!(addr.to_string(), "[::1]:2376");
    }

    #[tokio::test]
    async fn test_resolve_from_directory() {
        let router = Router::new().route(
            "/api/v1/proxy/instance/{user}/{role}",
            get(|Path((user, role)): Path<(String, String)>| async move {
                assert_eq!(user, "alice");
                assert_eq!(role, "dev");
                Json(serde_json::json!({"id": "i1", "addr": "10.0.0.5", "status": "ok"}))
            }),
        );
        let base = serve(router).await;

        let route = resolver(&base)
            .resolve_identity(&identity("alice", "dev"))
            .await
            .unwrap();

        assert_eq!(route.backend_id, "i1");
        assert_eq!(route.raw_address, "10.0.0.5");
        assert_eq!(route.status, "ok");
        assert_eq!(
            route.resolved_address,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 2376)
        );
    }

    #[tokio::test]
    async fn test_missing_optional_fields() {
        let router = Router::new().route(
            "/api/v1/proxy/instance/{user}/{role}",
            get(|| async { Json(serde_json::json!({"addr": "127.0.0.1"})) }),
        );
        let base = serve(router).await;

        let route = resolver(&base)
            .resolve_identity(&identity("alice", "dev"))
            .await
            .unwrap();
        assert_eq!(route.backend_id, "");
        assert_eq!(route.resolved_address.to_string(), "127.0.0.1:2376");
    }

    #[tokio::test]
    async fn test_directory_error_status() {
        let router = Router::new().route(
            "/api/v1/proxy/instance/{user}/{role}",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let base = serve(router).await;

        let err = resolver(&base)
            .resolve_identity(&identity("alice", "dev"))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "directory_error");
    }

    #[tokio::test]
    async fn test_directory_bad_body() {
        let router = Router::new().route(
            "/api/v1/proxy/instance/{user}/{role}",
            get(|| async { "not json" }),
        );
        let base = serve(router).await;

        let err = resolver(&base)
            .resolve_identity(&identity("alice", "dev"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Directory { .. }));
    }

    #[tokio::test]
    async fn test_directory_empty_addr() {
        let router = Router::new().route(
            "/api/v1/proxy/instance/{user}/{role}",
            get(|| async { Json(serde_json::json!({"id": "i1", "addr": ""})) }),
        );
        let base = serve(router).await;

        let err = resolver(&base)
            .resolve_identity(&identity("alice", "dev"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Directory { .. }));
    }

    #[tokio::test]
    async fn test_directory_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = resolver(&format!("http://{addr}"))
            .resolve_identity(&identity("alice", "dev"))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "directory_unavailable");
    }

    #[tokio::test]
    async fn test_unresolvable_address() {
        let router = Router::new().route(
            "/api/v1/proxy/instance/{user}/{role}",
            get(|| async { Json(serde_json::json!({"addr": "backend.invalid"})) }),
        );
        let base = serve(router).await;

        let err = resolver(&base)
            .resolve_identity(&identity("alice", "dev"))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "address_resolution_failed");
    }

    #[tokio::test]
    async fn test_no_identity_means_no_lookup() {
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let router = Router::new().route(
            "/api/v1/proxy/instance/{user}/{role}",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({"addr": "127.0.0.1"}))
                }
            }),
        );
        let base = serve(router).await;

        let mut params = rcgen::CertificateParams::default();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, "alice");
        params.distinguished_name = dn;
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        let chain = vec![cert.der().clone()];

        let err = resolver(&base).resolve(&chain).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Identity(IdentityError::NoQualifyingCertificate)
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
