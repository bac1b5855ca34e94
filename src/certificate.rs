//! Per-hostname certificate index for TLS termination
//! Loads `<site-root>/<name>/cert.pem` and `key.pem` for every TLS-enabled site

use crate::registry::{Registry, RegistryError, Site};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to read {path} for domain {domain}: {source}")]
    Read {
        domain: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificate found in {path} for domain {domain}")]
    NoCertificate { domain: String, path: PathBuf },

    #[error("no private key found in {path} for domain {domain}")]
    NoPrivateKey { domain: String, path: PathBuf },

    #[error("private key does not match certificate for domain {domain}: {source}")]
    KeyMismatch {
        domain: String,
        source: rustls::Error,
    },

    #[error("unsupported private key for domain {domain}: {source}")]
    UnsupportedKey {
        domain: String,
        source: rustls::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Immutable hostname -> certificate snapshot
#[derive(Debug, Default)]
pub struct CertificateIndex {
    certs: HashMap<String, Arc<CertifiedKey>>,
}

impl CertificateIndex {
    /// Build the index from every TLS-enabled site in the registry
    pub fn load(registry: &Registry, site_root: &Path) -> Result<Self, CertificateError> {
        let sites = registry.list_tls_enabled()?;
        Self::build(site_root, &sites)
    }

    /// Build the index from `sites`, skipping those without TLS.
    ///
    /// Fails on the first site whose material cannot be loaded; a partial
    /// index is never returned.
    pub fn build(site_root: &Path, sites: &[Site]) -> Result<Self, CertificateError> {
        let mut certs = HashMap::new();

        for site in sites.iter().filter(|s| s.tls_enabled) {
            let dir = site_root.join(&site.name);
            let key = load_certified_key(&site.domain, &dir.join(CERT_FILE), &dir.join(KEY_FILE))?;
            info!("Loaded certificate for {} from {}", site.domain, dir.display());
            certs.insert(site.domain.clone(), Arc::new(key));
        }

        Ok(Self { certs })
    }

    /// Certificate for `server_name`, exact match only
    pub fn select(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.get(server_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.certs.keys().map(String::as_str)
    }
}

impl ResolvesServerCert for CertificateIndex {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            debug!("TLS client sent no server name");
            return None;
        };

        let selected = self.select(server_name);
        if selected.is_none() {
            debug!("No certificate for server name {}", server_name);
        }
        selected
    }
}

fn load_certified_key(
    domain: &str,
    cert_path: &Path,
    key_path: &Path,
) -> Result<CertifiedKey, CertificateError> {
    let certs = load_certs(domain, cert_path)?;
    let key = load_private_key(domain, key_path)?;

    let signing_key = any_supported_type(&key).map_err(|source| CertificateError::UnsupportedKey {
        domain: domain.to_string(),
        source,
    })?;

    let certified = CertifiedKey::new(certs, signing_key);
    certified
        .keys_match()
        .map_err(|source| CertificateError::KeyMismatch {
            domain: domain.to_string(),
            source,
        })?;

    Ok(certified)
}

fn open(domain: &str, path: &Path) -> Result<BufReader<File>, CertificateError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CertificateError::Read {
            domain: domain.to_string(),
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(domain: &str, path: &Path) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let mut reader = open(domain, path)?;

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertificateError::Read {
            domain: domain.to_string(),
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(CertificateError::NoCertificate {
            domain: domain.to_string(),
            path: path.to_path_buf(),
        });
    }

    Ok(certs)
}

fn load_private_key(domain: &str, path: &Path) -> Result<PrivateKeyDer<'static>, CertificateError> {
    let mut reader = open(domain, path)?;

    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CertificateError::Read {
            domain: domain.to_string(),
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CertificateError::NoPrivateKey {
            domain: domain.to_string(),
            path: path.to_path_buf(),
        })
}
