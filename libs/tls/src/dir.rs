//! TLS material stored as PEM files in a directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::TlsError;
use crate::material::TlsMaterial;

/// File naming convention inside a TLS directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirLayout {
    /// `ca.pem`, `server-cert.pem`, `server-key.pem`.
    Server,
    /// `ca.pem`, `cert.pem`, `key.pem`.
    Client,
}

/// A directory holding the CA bundle, certificate and key for one role.
#[derive(Debug, Clone)]
pub struct TlsDir {
    path: PathBuf,
    layout: DirLayout,
}

impl TlsDir {
    pub fn new(path: impl Into<PathBuf>, layout: DirLayout) -> Self {
        Self {
            path: path.into(),
            layout,
        }
    }

    pub fn ca_path(&self) -> PathBuf {
        self.path.join("ca.pem")
    }

    pub fn cert_path(&self) -> PathBuf {
        match self.layout {
            DirLayout::Server => self.path.join("server-cert.pem"),
            DirLayout::Client => self.path.join("cert.pem"),
        }
    }

    pub fn key_path(&self) -> PathBuf {
        match self.layout {
            DirLayout::Server => self.path.join("server-key.pem"),
            DirLayout::Client => self.path.join("key.pem"),
        }
    }

    /// Read all three PEM files.
    pub fn load(&self) -> Result<TlsMaterial, TlsError> {
        debug!(path = %self.path.display(), layout = ?self.layout, "Loading TLS directory");

        Ok(TlsMaterial::new(
            read_pem(&self.ca_path())?,
            read_pem(&self.cert_path())?,
            read_pem(&self.key_path())?,
        ))
    }
}

fn read_pem(path: &Path) -> Result<String, TlsError> {
    fs::read_to_string(path).map_err(|source| TlsError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let server = TlsDir::new("/etc/certs/proxy", DirLayout::Server);
        assert_eq!(server.ca_path(), PathBuf::from("/etc/certs/proxy/ca.pem"));
        assert_eq!(
            server.cert_path(),
            PathBuf::from("/etc/certs/proxy/server-cert.pem")
        );
        assert_eq!(
            server.key_path(),
            PathBuf::from("/etc/certs/proxy/server-key.pem")
        );

        let client = TlsDir::new("/etc/certs/node", DirLayout::Client);
        assert_eq!(client.cert_path(), PathBuf::from("/etc/certs/node/cert.pem"));
        assert_eq!(client.key_path(), PathBuf::from("/etc/certs/node/key.pem"));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ca.pem"), "ca").unwrap();
        fs::write(dir.path().join("cert.pem"), "cert").unwrap();
        fs::write(dir.path().join("key.pem"), "key").unwrap();

        let material = TlsDir::new(dir.path(), DirLayout::Client).load().unwrap();
        assert_eq!(material.ca_pem, "ca");
        assert_eq!(material.cert_pem, "cert");
        assert_eq!(material.key_pem, "key");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ca.pem"), "ca").unwrap();

        let err = TlsDir::new(dir.path(), DirLayout::Server).load().unwrap_err();
        match err {
            TlsError::ReadFile { path, .. } => {
                assert_eq!(path, dir.path().join("server-cert.pem"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
