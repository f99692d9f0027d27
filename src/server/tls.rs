//! TLS certificate and key loading.
//!
//! PEM files configured via `httpd.certificate`/`httpd.private_key` are
//! loaded once at bind time into a rustls acceptor; a broken or missing
//! file is a fatal bind error, not something to retry per connection.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

/// Errors loading the TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM file could not be read.
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    /// The certificate file contained no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// The key file contained no private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// rustls rejected the certificate/key pair.
    #[error("invalid certificate or key: {0}")]
    Config(#[from] rustls::Error),
}

/// Builds a TLS acceptor from PEM certificate chain and private key files.
pub fn acceptor(certificate: &Path, private_key: &Path) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certificates(certificate)?;
    let key = load_private_key(private_key)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}
