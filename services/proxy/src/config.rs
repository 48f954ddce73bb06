//! Proxy configuration.
//!
//! Flags (with `DOCKGATE_*` environment fallbacks) are parsed once by
//! [`Cli`] and turned into an immutable [`Config`] at startup. Nothing
//! re-reads the environment afterwards.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, ValueEnum};
use dockgate_tls::{credentials_url, ServerVerification, SUBJECT_PLACEHOLDER};
use rustls::pki_types::ServerName;

use crate::proxy::{
    ListenerConfig, PoolConfig, ResolverConfig, DEFAULT_BACKEND_PORT, DEFAULT_BACKEND_SOCKET,
    ROLE_PLACEHOLDER, USER_ID_PLACEHOLDER,
};

/// Placeholder for the API base URL in endpoint templates.
pub const API_PLACEHOLDER: &str = ":api";

/// dockgate - mTLS terminating proxy for per-tenant container daemons.
#[derive(Debug, Clone, Parser)]
#[command(name = "dockgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on.
    #[arg(short, long, env = "DOCKGATE_BIND", default_value = "0.0.0.0:2376")]
    pub bind: SocketAddr,

    /// Base URL of the API serving credentials and the directory.
    #[arg(
        short,
        long,
        env = "DOCKGATE_API_URL",
        default_value = "http://localhost:3000"
    )]
    pub api_url: String,

    /// Credentials endpoint template (`:api`, `:subject`).
    #[arg(
        short,
        long,
        env = "DOCKGATE_CREDENTIALS_URL",
        default_value = ":api/api/v1/proxy/credentials/:subject"
    )]
    pub credentials_url: String,

    /// Directory lookup template (`:api`, `:userId`, `:role`).
    #[arg(
        short,
        long,
        env = "DOCKGATE_LOOKUP_URL",
        default_value = ":api/api/v1/proxy/instance/:userId/:role"
    )]
    pub lookup_url: String,

    /// Subject the proxy fetches its own credentials for.
    #[arg(short, long, env = "DOCKGATE_SUBJECT", default_value = "localhost")]
    pub subject: String,

    /// Directory holding the proxy-facing `ca.pem`, `server-cert.pem`, `server-key.pem`.
    #[arg(long, env = "DOCKGATE_PROXY_TLS_DIR", requires = "node_tls_dir")]
    pub proxy_tls_dir: Option<PathBuf>,

    /// Directory holding the node-facing `ca.pem`, `cert.pem`, `key.pem`.
    #[arg(long, env = "DOCKGATE_NODE_TLS_DIR", requires = "proxy_tls_dir")]
    pub node_tls_dir: Option<PathBuf>,

    /// Number of connection workers.
    #[arg(short, long, env = "DOCKGATE_WORKERS", default_value_t = 5)]
    pub workers: usize,

    /// Connections allowed to wait for a worker. Defaults to the worker count.
    #[arg(long, env = "DOCKGATE_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// How backends are reached.
    #[arg(long, env = "DOCKGATE_BACKEND_MODE", value_enum, default_value_t = BackendMode::Tls)]
    pub backend_mode: BackendMode,

    /// Backend control socket used in unix mode.
    #[arg(long, env = "DOCKGATE_BACKEND_SOCKET", default_value = DEFAULT_BACKEND_SOCKET)]
    pub backend_socket: PathBuf,

    /// Port appended to directory addresses.
    #[arg(long, env = "DOCKGATE_BACKEND_PORT", default_value_t = DEFAULT_BACKEND_PORT)]
    pub backend_port: u16,

    /// TLS server name to verify backends against instead of their IP.
    #[arg(long, env = "DOCKGATE_BACKEND_SERVER_NAME")]
    pub backend_server_name: Option<String>,

    /// Do not verify backend certificates.
    #[arg(long, env = "DOCKGATE_INSECURE_SKIP_BACKEND_VERIFY")]
    pub insecure_skip_backend_verify: bool,

    /// Inbound TLS handshake timeout in milliseconds (0 disables it).
    #[arg(long, env = "DOCKGATE_HANDSHAKE_TIMEOUT_MS", default_value_t = 10_000)]
    pub handshake_timeout_ms: u64,

    /// Backend dial and handshake timeout in milliseconds.
    #[arg(long, env = "DOCKGATE_CONNECT_TIMEOUT_MS", default_value_t = 5_000)]
    pub connect_timeout_ms: u64,

    /// Directory and credentials request timeout in milliseconds.
    #[arg(long, env = "DOCKGATE_DIRECTORY_TIMEOUT_MS", default_value_t = 10_000)]
    pub directory_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "DOCKGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "DOCKGATE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendMode {
    /// TLS over TCP to the address from the directory.
    Tls,
    /// The local backend control socket.
    Unix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Where the two TLS identities come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSource {
    /// PEM files on disk.
    Dirs { proxy: PathBuf, node: PathBuf },
    /// The credentials endpoint, already expanded for the subject.
    Endpoint { url: String },
}

/// Backend connector settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub mode: BackendMode,
    pub socket_path: PathBuf,
    pub server_name: Option<ServerName<'static>>,
    pub verification: ServerVerification,
    pub connect_timeout: Duration,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listener: ListenerConfig,
    pub pool: PoolConfig,
    pub resolver: ResolverConfig,
    pub connector: ConnectorConfig,
    pub tls: TlsSource,
    /// Timeout for the startup credentials request.
    pub credentials_timeout: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Validate parsed flags and build the runtime configuration.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        ensure!(cli.workers >= 1, "--workers must be at least 1");
        let queue_capacity = cli.queue_capacity.unwrap_or(cli.workers);
        ensure!(queue_capacity >= 1, "--queue-capacity must be at least 1");

        let api_url = cli.api_url.trim_end_matches('/');
        let lookup_url = expand_api(&cli.lookup_url, api_url);
        ensure!(
            lookup_url.contains(USER_ID_PLACEHOLDER) && lookup_url.contains(ROLE_PLACEHOLDER),
            "--lookup-url must contain {USER_ID_PLACEHOLDER} and {ROLE_PLACEHOLDER}: {lookup_url}"
        );

        let tls = match (cli.proxy_tls_dir, cli.node_tls_dir) {
            (Some(proxy), Some(node)) => TlsSource::Dirs { proxy, node },
            (None, None) => {
                let template = expand_api(&cli.credentials_url, api_url);
                ensure!(
                    template.contains(SUBJECT_PLACEHOLDER),
                    "--credentials-url must contain {SUBJECT_PLACEHOLDER}: {template}"
                );
                TlsSource::Endpoint {
                    url: credentials_url(&template, &cli.subject),
                }
            }
            _ => bail!("--proxy-tls-dir and --node-tls-dir must be given together"),
        };

        if cli.backend_mode == BackendMode::Unix {
            ensure!(
                !cli.backend_socket.as_os_str().is_empty(),
                "--backend-socket is required in unix mode"
            );
        }

        let server_name = cli
            .backend_server_name
            .map(|name| {
                ServerName::try_from(name.clone())
                    .with_context(|| format!("invalid --backend-server-name: {name}"))
            })
            .transpose()?;

        let directory_timeout = Duration::from_millis(cli.directory_timeout_ms);

        let mut listener = ListenerConfig::new(cli.bind);
        listener.handshake_timeout =
            (cli.handshake_timeout_ms > 0).then(|| Duration::from_millis(cli.handshake_timeout_ms));

        let mut resolver = ResolverConfig::new(lookup_url);
        resolver.backend_port = cli.backend_port;
        resolver.request_timeout = directory_timeout;

        Ok(Self {
            listener,
            pool: PoolConfig {
                workers: cli.workers,
                queue_capacity,
            },
            resolver,
            connector: ConnectorConfig {
                mode: cli.backend_mode,
                socket_path: cli.backend_socket,
                server_name,
                verification: if cli.insecure_skip_backend_verify {
                    ServerVerification::Skip
                } else {
                    ServerVerification::Verify
                },
                connect_timeout: Duration::from_millis(cli.connect_timeout_ms),
            },
            tls,
            credentials_timeout: directory_timeout,
            log_level: cli.log_level,
            log_format: cli.log_format,
        })
    }
}

fn expand_api(template: &str, api_url: &str) -> String {
    template.replacen(API_PLACEHOLDER, api_url, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Result<Config> {
        let cli = Cli::try_parse_from(std::iter::once("dockgate").chain(args.iter().copied()))?;
        Config::from_cli(cli)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();

        assert_eq!(config.listener.bind_addr, "0.0.0.0:2376".parse().unwrap());
        assert_eq!(
            config.listener.handshake_timeout,
            Some(Duration::from_secs(10))
        );
        assert_eq!(config.pool, PoolConfig::new(5));
        assert_eq!(
            config.resolver.endpoint_template,
            "http://localhost:3000/api/v1/proxy/instance/:userId/:role"
        );
        assert_eq!(config.resolver.backend_port, 2376);
        assert_eq!(
            config.tls,
            TlsSource::Endpoint {
                url: "http://localhost:3000/api/v1/proxy/credentials/localhost".to_string()
            }
        );
        assert_eq!(config.connector.mode, BackendMode::Tls);
        assert_eq!(config.connector.verification, ServerVerification::Verify);
        assert_eq!(config.connector.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_tls_dirs() {
        let config = parse(&["--proxy-tls-dir", "/etc/p", "--node-tls-dir", "/etc/n"]).unwrap();
        assert_eq!(
            config.tls,
            TlsSource::Dirs {
                proxy: PathBuf::from("/etc/p"),
                node: PathBuf::from("/etc/n"),
            }
        );
    }

    #[test]
    fn test_single_tls_dir_rejected() {
        assert!(parse(&["--proxy-tls-dir", "/etc/p"]).is_err());
    }

    #[test]
    fn test_queue_capacity_follows_workers() {
        let config = parse(&["-w", "8"]).unwrap();
        assert_eq!(config.pool.workers, 8);
        assert_eq!(config.pool.queue_capacity, 8);

        let config = parse(&["-w", "8", "--queue-capacity", "2"]).unwrap();
        assert_eq!(config.pool.queue_capacity, 2);
    }

    #[rstest]
    #[case::zero_workers(&["-w", "0"])]
    #[case::zero_queue(&["--queue-capacity", "0"])]
    #[case::lookup_without_role(&["-l", ":api/instance/:userId"])]
    #[case::credentials_without_subject(&["-c", ":api/credentials"])]
    #[case::bad_server_name(&["--backend-server-name", "not a name!"])]
    fn test_invalid(#[case] args: &[&str]) {
        assert!(parse(args).is_err());
    }

    #[rstest]
    #[case("http://api:3000", "http://api:3000/x/:userId/:role")]
    #[case("http://api:3000/", "http://api:3000/x/:userId/:role")]
    fn test_api_expansion(#[case] api: &str, #[case] expected: &str) {
        let config = parse(&["-a", api, "-l", ":api/x/:userId/:role"]).unwrap();
        assert_eq!(config.resolver.endpoint_template, expected);
    }

    #[test]
    fn test_backend_flags() {
        let config = parse(&[
            "--backend-mode",
            "unix",
            "--backend-socket",
            "/run/daemon.sock",
            "--insecure-skip-backend-verify",
            "--handshake-timeout-ms",
            "0",
        ])
        .unwrap();

        assert_eq!(config.connector.mode, BackendMode::Unix);
        assert_eq!(config.connector.socket_path, PathBuf::from("/run/daemon.sock"));
        assert_eq!(config.connector.verification, ServerVerification::Skip);
        assert_eq!(config.listener.handshake_timeout, None);
    }
}
