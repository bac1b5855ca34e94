//! TLS front door and backend TLS client

use crate::certificate::CertificateIndex;
use rustls::crypto::ring;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Server config choosing the certificate by SNI from `index`
pub fn server_config(index: Arc<CertificateIndex>) -> Result<ServerConfig, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(index);

    // Connections are served with HTTP/1 only
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

pub fn acceptor(index: Arc<CertificateIndex>) -> Result<TlsAcceptor, rustls::Error> {
    Ok(TlsAcceptor::from(Arc::new(server_config(index)?)))
}

/// Client used for `https` backends, trusting the webpki root set
pub fn backend_connector() -> Result<TlsConnector, rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_advertises_http1() {
        let config = server_config(Arc::new(CertificateIndex::default())).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_backend_connector_builds() {
        assert!(backend_connector().is_ok());
    }
}
