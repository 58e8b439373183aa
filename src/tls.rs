//! TLS configuration for client sockets (rustls).
//!
//! Only configuration loading and socket wrapping live here; the handshake
//! itself is rustls's business and happens lazily on the connection's first
//! read or write, on an executor thread.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Certificate and key locations for a TLS-terminating worker.
#[derive(Debug, Clone)]
pub struct ServerTlsConfig {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl ServerTlsConfig {
    /// Use the PEM certificate chain and private key at the given paths.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> ServerTlsConfig {
        ServerTlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// Load the certificate chain and key and build the rustls config.
    pub(crate) fn build(&self) -> crate::Result<Arc<rustls::ServerConfig>> {
        let certs = rustls_pemfile::certs(&mut open(&self.cert_path)?)
            .collect::<Result<Vec<_>, _>>()
            .map_err(crate::Error::new_tls)?;
        let key = rustls_pemfile::private_key(&mut open(&self.key_path)?)
            .map_err(crate::Error::new_tls)?
            .ok_or_else(|| crate::Error::new_tls("no private key found"))?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(crate::Error::new_tls)?;
        Ok(Arc::new(config))
    }
}

fn open(path: &Path) -> crate::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(crate::Error::new_tls)
}
