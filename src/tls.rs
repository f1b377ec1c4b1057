//! TLS acceptor for the public listeners.
//!
//! Loads a PEM certificate chain and private key into a rustls server
//! config. The shard listener never uses this; peers talk plain HTTP.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

/// Certificate or key could not be loaded.
#[derive(Error, Debug)]
pub enum TlsError {
    /// File could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Certificate PEM did not parse.
    #[error("invalid certificate in {path}: {reason}")]
    Certificate {
        /// File path.
        path: PathBuf,
        /// Parser error.
        reason: String,
    },
    /// Certificate file held no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    /// Private key PEM did not parse.
    #[error("invalid private key in {path}: {reason}")]
    PrivateKey {
        /// File path.
        path: PathBuf,
        /// Parser error.
        reason: String,
    },
    /// rustls refused the certificate/key pair.
    #[error("tls config: {0}")]
    Config(#[from] rustls::Error),
}

/// Build an acceptor from PEM files.
pub fn load_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor, TlsError> {
    let cert_pem = read(cert_file)?;
    let key_pem = read(key_file)?;

    let certs = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate {
            path: cert_file.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_file.to_path_buf()));
    }

    let key = PrivateKeyDer::from_pem_slice(&key_pem).map_err(|e| TlsError::PrivateKey {
        path: key_file.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
    // WebSocket upgrades need HTTP/1.1
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    log::info!("[Relay] Loaded TLS certificate from {}", cert_file.display());
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_certificate_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_acceptor(&dir.path().join("cert.pem"), &dir.path().join("key.pem"))
            .err()
            .unwrap();
        assert!(matches!(err, TlsError::Read { .. }), "unexpected error: {err}");
    }

    #[test]
    fn test_empty_certificate_file() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();

        let err = load_acceptor(&cert, &key).err().unwrap();
        assert!(matches!(err, TlsError::NoCertificates(_)), "unexpected error: {err}");
    }
}
