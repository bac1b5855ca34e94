//! Backend resolution
//! Maps a request's host to the origin it should be forwarded to

use crate::registry::{Registry, RegistryError};
use async_trait::async_trait;
use hyper::Uri;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("invalid backend URL '{url}': {reason}")]
    InvalidBackend { url: String, reason: String },

    #[error("registry lookup task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A parsed origin base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    base: Url,
}

impl Backend {
    pub fn parse(url: &str) -> Result<Self, RouteError> {
        let invalid = |reason: String| RouteError::InvalidBackend {
            url: url.to_string(),
            reason,
        };

        let base = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", base.scheme())));
        }
        if base.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }

        Ok(Self { base })
    }

    pub fn is_https(&self) -> bool {
        self.base.scheme() == "https"
    }

    pub fn scheme(&self) -> &str {
        self.base.scheme()
    }

    /// Host as used for connecting and for TLS server name (IPv6 without brackets)
    pub fn host(&self) -> &str {
        match self.base.host() {
            Some(url::Host::Ipv6(_)) => self
                .base
                .host_str()
                .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
                .unwrap_or_default(),
            _ => self.base.host_str().unwrap_or_default(),
        }
    }

    pub fn port(&self) -> u16 {
        self.base.port_or_known_default().unwrap_or(80)
    }

    /// Value for the forwarded Host header: host plus any explicit port
    pub fn authority(&self) -> String {
        let host = self.base.host_str().unwrap_or_default();
        match self.base.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Base URL followed by the inbound path and query
    pub fn target_uri(&self, path_and_query: &str) -> Result<Uri, RouteError> {
        let prefix = self.base.path().trim_end_matches('/');
        let suffix = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        };

        let uri = format!("{}://{}{}{}", self.scheme(), self.authority(), prefix, suffix);
        uri.parse().map_err(|e: hyper::http::uri::InvalidUri| RouteError::InvalidBackend {
            url: uri.clone(),
            reason: e.to_string(),
        })
    }
}

/// Resolves a host to a backend
#[async_trait]
pub trait Router: Send + Sync {
    /// `Ok(None)` means no route exists for `host`
    async fn resolve(&self, host: &str) -> Result<Option<Backend>, RouteError>;
}

/// Looks every host up in the registry
pub struct RegistryRouter {
    registry: Arc<Registry>,
}

impl RegistryRouter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Router for RegistryRouter {
    async fn resolve(&self, host: &str) -> Result<Option<Backend>, RouteError> {
        let registry = self.registry.clone();
        let host = host.to_string();

        // SQLite access is blocking, keep it off the runtime workers
        let site = tokio::task::spawn_blocking(move || registry.lookup_by_host(&host)).await??;

        site.map(|s| Backend::parse(&s.backend_url)).transpose()
    }
}

/// Sends every request to one backend fixed at startup
pub struct FixedRouter {
    backend: Backend,
}

impl FixedRouter {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Router for FixedRouter {
    async fn resolve(&self, _host: &str) -> Result<Option<Backend>, RouteError> {
        Ok(Some(self.backend.clone()))
    }
}
