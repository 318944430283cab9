//! TLS support for serving scenarios over `wss://` (feature `tls-rustls`).
//!
//! Only the server side is provided: load a PEM certificate chain and key,
//! build a [`TlsAcceptor`], and hand it to
//! [`FixtureServer::with_tls`](crate::FixtureServer::with_tls).

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;

/// Errors raised while setting up or accepting TLS.
#[derive(Error, Debug)]
pub enum TlsError {
    /// Reading a file or the handshake failed.
    #[error("TLS I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// rustls refused the certificate or key.
    #[error("TLS configuration error: {0}")]
    Configuration(String),

    /// The certificate file held no certificates.
    #[error("no certificates found in file")]
    NoCertificatesFound,

    /// The key file held no supported private key.
    #[error("no private key found in file")]
    NoPrivateKeyFound,
}

/// Build a server configuration for a single certificate chain.
///
/// # Errors
///
/// Returns [`TlsError::Configuration`] if the key does not match the chain
/// or is not supported.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| TlsError::Configuration(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Server-side TLS acceptor.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Wrap a rustls server configuration.
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            inner: tokio_rustls::TlsAcceptor::from(config),
        }
    }

    /// Load a PEM certificate chain and private key and build an acceptor.
    ///
    /// # Errors
    ///
    /// Returns any error from [`load_certs_from_file`],
    /// [`load_private_key_from_file`] or [`server_config`].
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let certs = load_certs_from_file(cert_path)?;
        let key = load_private_key_from_file(key_path)?;
        Ok(Self::new(server_config(certs, key)?))
    }

    /// Run the TLS handshake on an accepted stream.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Io`] if the handshake fails.
    pub async fn accept<S>(&self, stream: S) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Ok(self.inner.accept(stream).await?)
    }
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish_non_exhaustive()
    }
}

/// Read every certificate from a PEM file.
///
/// # Errors
///
/// Returns [`TlsError::Io`] if the file cannot be read and
/// [`TlsError::NoCertificatesFound`] if it holds none.
pub fn load_certs_from_file(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificatesFound);
    }

    Ok(certs)
}

/// Read the first PKCS#1, PKCS#8 or SEC1 private key from a PEM file.
///
/// # Errors
///
/// Returns [`TlsError::Io`] if the file cannot be read and
/// [`TlsError::NoPrivateKeyFound`] if it holds no key.
pub fn load_private_key_from_file(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item? {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(TlsError::NoPrivateKeyFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_with(contents: &[u8]) -> NamedTempFile {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(contents).unwrap();
        temp.flush().unwrap();
        temp
    }

    #[test]
    fn test_tls_error_display_and_source() {
        let io_err = TlsError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(io_err.to_string().contains("TLS I/O error"));
        assert!(io_err.source().is_some());

        let config_err = TlsError::Configuration("bad config".to_string());
        assert!(config_err.to_string().contains("bad config"));
        assert!(config_err.source().is_none());
    }

    #[test]
    fn test_load_certs_errors() {
        let missing = load_certs_from_file(Path::new("/nonexistent/path/cert.pem"));
        assert!(matches!(missing, Err(TlsError::Io(_))));

        let temp = temp_with(b"not a certificate\n");
        let result = load_certs_from_file(temp.path());
        assert!(matches!(result, Err(TlsError::NoCertificatesFound)));
    }

    #[test]
    fn test_load_private_key_errors() {
        let missing = load_private_key_from_file(Path::new("/nonexistent/path/key.pem"));
        assert!(matches!(missing, Err(TlsError::Io(_))));

        let temp = temp_with(b"");
        let result = load_private_key_from_file(temp.path());
        assert!(matches!(result, Err(TlsError::NoPrivateKeyFound)));
    }

    #[test]
    fn test_acceptor_from_generated_pem() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_file = temp_with(cert.cert.pem().as_bytes());
        let key_file = temp_with(cert.key_pair.serialize_pem().as_bytes());

        let acceptor = TlsAcceptor::from_pem_files(cert_file.path(), key_file.path()).unwrap();
        assert_eq!(format!("{acceptor:?}"), "TlsAcceptor { .. }");
    }

    #[test]
    fn test_key_file_as_cert_rejected() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key_file = temp_with(cert.key_pair.serialize_pem().as_bytes());
        assert!(matches!(
            load_certs_from_file(key_file.path()),
            Err(TlsError::NoCertificatesFound)
        ));
    }
}
