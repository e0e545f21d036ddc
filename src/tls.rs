//! TLS material handling.
//!
//! Certificates arrive as in-memory PEM rather than file paths, so the
//! supervising loop can swap them without touching the filesystem.

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};

/// ALPN protocols offered to clients, preferred first.
#[cfg(feature = "http2")]
pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1"];
#[cfg(not(feature = "http2"))]
pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"http/1.1"];

/// A PEM encoded private key and certificate chain.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
}

impl Certificate {
    pub fn new(key: impl Into<Vec<u8>>, cert: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            cert: cert.into(),
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("key", &"<redacted>")
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .finish()
    }
}

fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("unreadable certificate PEM: {}", e)))?;

    if certs.is_empty() {
        return Err(Error::Tls("no certificates found in PEM data".into()));
    }
    Ok(certs)
}

fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("unreadable key PEM: {}", e)))?
        .ok_or_else(|| Error::Tls("no private key found in PEM data".into()))
}

/// Builds a rustls server configuration from in-memory PEM material.
pub fn server_config(certificate: &Certificate) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs(&certificate.cert)?;
    let key = load_private_key(&certificate.key)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;

    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

/// Builds the acceptor that wraps accepted streams in TLS.
pub fn acceptor(certificate: &Certificate) -> Result<TlsAcceptor> {
    let config = server_config(certificate)?;
    log::debug!(
        "tls acceptor configured, alpn {:?}",
        config
            .alpn_protocols
            .iter()
            .map(|p| String::from_utf8_lossy(p))
            .collect::<Vec<_>>()
    );
    Ok(TlsAcceptor::from(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOT_A_CERT: &str = "-----BEGIN CERTIFICATE-----\nbm90IGEgY2VydGlmaWNhdGU=\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_empty_material_is_rejected() {
        let err = server_config(&Certificate::new(Vec::new(), Vec::new())).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert!(err.to_string().contains("no certificates"));
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let err = server_config(&Certificate::new("garbage", NOT_A_CERT)).unwrap_err();
        assert!(err.to_string().contains("no private key"), "{}", err);
    }

    #[test]
    fn test_debug_redacts_key() {
        let certificate = Certificate::new("secret-key", "cert");
        let rendered = format!("{:?}", certificate);
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("4 bytes"));
    }

    #[test]
    fn test_alpn_ends_with_http1() {
        assert_eq!(ALPN_PROTOCOLS.last(), Some(&&b"http/1.1"[..]));
    }
}
