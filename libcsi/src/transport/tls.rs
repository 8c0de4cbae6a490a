//! rustls configuration for the CSI QUIC transport.
//!
//! QUIC requires TLS 1.3, so both builders pin the protocol version and the
//! `ring` crypto provider explicitly instead of relying on a process-wide
//! default.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rcgen::{CertificateParams, KeyPair};
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use super::ALPN_CSI;
use crate::error::CsiError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error<E: std::fmt::Display>(e: E) -> CsiError {
    CsiError::TransportError(format!("TLS configuration: {e}"))
}

/// Server configuration presenting `cert_chain`.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig, CsiError> {
    let mut config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(tls_error)?;
    config.alpn_protocols = vec![ALPN_CSI.to_vec()];
    Ok(config)
}

/// Server configuration from PEM-encoded certificate chain and key files.
pub fn server_config_from_pem(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<rustls::ServerConfig, CsiError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    server_config(certs, key)
}

/// Client configuration trusting exactly `roots`.
pub fn client_config(roots: &[CertificateDer<'static>]) -> Result<rustls::ClientConfig, CsiError> {
    let mut store = RootCertStore::empty();
    for cert in roots {
        store.add(cert.clone()).map_err(tls_error)?;
    }
    let mut config = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .with_root_certificates(store)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_CSI.to_vec()];
    Ok(config)
}

pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, CsiError> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path).map_err(|e| {
        CsiError::TransportError(format!("open {}: {e}", path.display()))
    })?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CsiError::TransportError(format!("invalid certs in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(CsiError::TransportError(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, CsiError> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path).map_err(|e| {
        CsiError::TransportError(format!("open {}: {e}", path.display()))
    })?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CsiError::TransportError(format!("invalid key in {}: {e}", path.display())))?
        .ok_or_else(|| CsiError::TransportError(format!("no private key in {}", path.display())))
}

/// A freshly generated self-signed certificate and its key.
pub struct SelfSigned {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

/// Generate a self-signed certificate valid for `names`.
pub fn self_signed(names: &[String]) -> Result<SelfSigned, CsiError> {
    let key = KeyPair::generate().map_err(tls_error)?;
    let params = CertificateParams::new(names.to_vec()).map_err(tls_error)?;
    let cert = params.self_signed(&key).map_err(tls_error)?;
    Ok(SelfSigned {
        cert: cert.der().clone(),
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_pair_builds_both_configs() {
        let pair = self_signed(&["localhost".to_owned()]).unwrap();
        let server = server_config(vec![pair.cert.clone()], pair.key).unwrap();
        assert_eq!(server.alpn_protocols, vec![ALPN_CSI.to_vec()]);
        let client = client_config(&[pair.cert]).unwrap();
        assert_eq!(client.alpn_protocols, vec![ALPN_CSI.to_vec()]);
    }

    #[test]
    fn pem_files_load() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["localhost".to_owned()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let cert_path = dir.path().join("tls.crt");
        let key_path = dir.path().join("tls.key");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();

        assert_eq!(load_certs(&cert_path).unwrap().len(), 1);
        server_config_from_pem(&cert_path, &key_path).unwrap();
    }

    #[test]
    fn missing_pem_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_certs(dir.path().join("absent.crt")),
            Err(CsiError::TransportError(_))
        ));
    }
}
