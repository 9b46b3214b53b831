//! rustls configuration for the CSI QUIC transport.
//!
//! Both sides pin the `ring` provider and TLS 1.3, which QUIC requires, and
//! negotiate the [`ALPN`] protocol id.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::CsiError;

/// ALPN protocol id spoken by [`CsiServer`](super::server::CsiServer).
pub const ALPN: &[u8] = b"rk8s-csi/1";

fn tls_err(what: &str, path: &Path, e: impl std::fmt::Display) -> CsiError {
    CsiError::TransportError(format!("{what} {}: {e}", path.display()))
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CsiError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| tls_err("open certificates", path, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err("parse certificates", path, e))?;
    if certs.is_empty() {
        return Err(tls_err("load certificates", path, "no certificates found"));
    }
    Ok(certs)
}

/// Load the first private key in a PEM file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, CsiError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| tls_err("load private key", path, e))
}

/// Server configuration presenting `cert_chain` signed for the node.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig, CsiError> {
    let mut config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(CsiError::transport)?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(CsiError::transport)?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// Client configuration trusting `roots`.
pub fn client_config(
    roots: Vec<CertificateDer<'static>>,
) -> Result<rustls::ClientConfig, CsiError> {
    let mut store = rustls::RootCertStore::empty();
    for cert in roots {
        store.add(cert).map_err(CsiError::transport)?;
    }
    let mut config = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(CsiError::transport)?
        .with_root_certificates(store)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}
