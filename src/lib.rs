//! WebProxy - A multi-tenant HTTP/HTTPS reverse proxy
//!
//! Provides:
//! - Host-based routing against a SQLite site registry
//! - Per-site TLS certificates selected by SNI
//! - A two-tier allow/disallow request filter
//! - Structured request logging
//! - An authenticated admin API for registering sites

pub mod access_log;
pub mod admin;
pub mod certificate;
pub mod config;
pub mod proxy;
pub mod registry;
pub mod route;
pub mod tls;
pub mod waf;

pub use access_log::{AccessLog, LogEntry};
pub use admin::AdminServer;
pub use certificate::{CertificateError, CertificateIndex};
pub use config::{
    AccessLogTarget, AdminConfig, LogMode, PipelineConfig, ProxyModeConfig, StartConfig,
};
pub use proxy::{Pipeline, ProxyServer};
pub use registry::{Registry, RegistryError, Site};
pub use route::{Backend, FixedRouter, RegistryRouter, Router};
pub use waf::{RuleDocument, RuleEngine, Verdict};
