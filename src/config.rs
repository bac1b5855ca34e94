//! Typed configuration, validated once at startup

use crate::access_log::AccessLog;
use crate::route::Backend;
use clap::ValueEnum;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),

    #[error("invalid proxy target: {0}")]
    Target(#[from] crate::route::RouteError),
}

/// Request log destination as given on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogMode {
    /// Print request records to stdout
    Cli,
    /// Append request records to --log-path
    Save,
    /// No request records
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessLogTarget {
    Stdout,
    File(PathBuf),
    Disabled,
}

impl AccessLogTarget {
    /// `save` needs a path, the other modes must not have one
    pub fn from_mode(mode: LogMode, path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match (mode, path) {
            (LogMode::Save, Some(path)) => Ok(Self::File(path)),
            (LogMode::Save, None) => Err(ConfigError::Invalid(
                "--log-path is required when --log-mode is save".into(),
            )),
            (_, Some(_)) => Err(ConfigError::Invalid(
                "--log-path is only valid with --log-mode save".into(),
            )),
            (LogMode::Cli, None) => Ok(Self::Stdout),
            (LogMode::Off, None) => Ok(Self::Disabled),
        }
    }

    pub fn open(&self) -> std::io::Result<Option<AccessLog>> {
        Ok(match self {
            Self::Stdout => Some(AccessLog::stdout()),
            Self::File(path) => Some(AccessLog::file(path)?),
            Self::Disabled => None,
        })
    }
}

/// Per-request behaviour of the routing pipeline; fixed after construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Bound on backend connect and on waiting for the response head
    pub backend_timeout: Duration,
    /// Largest body buffered for inspection
    pub max_body_bytes: usize,
    /// Log every routed host at info level
    pub debug: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            debug: false,
        }
    }
}

impl PipelineConfig {
    pub fn new(
        backend_timeout_secs: u64,
        max_body_bytes: usize,
        debug: bool,
    ) -> Result<Self, ConfigError> {
        if backend_timeout_secs == 0 {
            return Err(ConfigError::Invalid("--backend-timeout must be at least 1 second".into()));
        }
        if max_body_bytes == 0 {
            return Err(ConfigError::Invalid("--max-body-bytes must be positive".into()));
        }

        Ok(Self {
            backend_timeout: Duration::from_secs(backend_timeout_secs),
            max_body_bytes,
            debug,
        })
    }
}

/// Registry-backed mode: HTTP plus optional HTTPS listener
#[derive(Debug, Clone)]
pub struct StartConfig {
    pub http_addr: SocketAddr,
    pub https_addr: Option<SocketAddr>,
    pub db_path: PathBuf,
    pub site_root: PathBuf,
    pub rules_path: Option<PathBuf>,
    pub access_log: AccessLogTarget,
    pub pipeline: PipelineConfig,
}

impl StartConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(https) = self.https_addr {
            if https == self.http_addr {
                return Err(ConfigError::Invalid(format!(
                    "HTTP and HTTPS listeners cannot share {}",
                    https
                )));
            }
        }
        Ok(())
    }
}

/// Single-target mode: every request goes to one backend
#[derive(Debug, Clone)]
pub struct ProxyModeConfig {
    pub listen_addr: SocketAddr,
    pub target: Backend,
    pub rules_path: Option<PathBuf>,
    pub access_log: AccessLogTarget,
    pub pipeline: PipelineConfig,
}

impl ProxyModeConfig {
    pub fn new(
        listen_addr: SocketAddr,
        proxy_ip: &str,
        proxy_port: u16,
        rules_path: Option<PathBuf>,
        access_log: AccessLogTarget,
        pipeline: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        let host = match proxy_ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
            _ => proxy_ip.to_string(),
        };
        let target = Backend::parse(&format!("http://{}:{}", host, proxy_port))?;

        Ok(Self {
            listen_addr,
            target,
            rules_path,
            access_log,
            pipeline,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
    pub db_path: PathBuf,
}

pub fn listen_addr(ip: Option<IpAddr>, port: u16) -> SocketAddr {
    SocketAddr::new(ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_target_rules() {
        assert_eq!(
            AccessLogTarget::from_mode(LogMode::Save, Some("req.log".into())).unwrap(),
            AccessLogTarget::File("req.log".into())
        );
        assert_eq!(
            AccessLogTarget::from_mode(LogMode::Cli, None).unwrap(),
            AccessLogTarget::Stdout
        );
        assert_eq!(
            AccessLogTarget::from_mode(LogMode::Off, None).unwrap(),
            AccessLogTarget::Disabled
        );

        assert!(AccessLogTarget::from_mode(LogMode::Save, None).is_err());
        assert!(AccessLogTarget::from_mode(LogMode::Cli, Some("req.log".into())).is_err());
        assert!(AccessLogTarget::from_mode(LogMode::Off, Some("req.log".into())).is_err());
    }

    #[test]
    fn test_pipeline_config_bounds() {
        let config = PipelineConfig::new(5, 1024, true).unwrap();
        assert_eq!(config.backend_timeout, Duration::from_secs(5));
        assert!(config.debug);

        assert!(PipelineConfig::new(0, 1024, false).is_err());
        assert!(PipelineConfig::new(5, 0, false).is_err());
    }

    #[test]
    fn test_proxy_mode_target() {
        let config = ProxyModeConfig::new(
            listen_addr(None, 8080),
            "127.0.0.1",
            3000,
            None,
            AccessLogTarget::Disabled,
            PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(config.target.authority(), "127.0.0.1:3000");
        assert_eq!(config.listen_addr.port(), 8080);

        let v6 = ProxyModeConfig::new(
            listen_addr(None, 8080),
            "::1",
            3000,
            None,
            AccessLogTarget::Disabled,
            PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(v6.target.authority(), "[::1]:3000");

        assert!(ProxyModeConfig::new(
            listen_addr(None, 8080),
            "bad host name",
            3000,
            None,
            AccessLogTarget::Disabled,
            PipelineConfig::default(),
        )
        .is_err());
    }

    #[test]
    fn test_start_config_rejects_shared_port() {
        let config = StartConfig {
            http_addr: listen_addr(None, 8080),
            https_addr: Some(listen_addr(None, 8080)),
            db_path: "server.db".into(),
            site_root: "website".into(),
            rules_path: None,
            access_log: AccessLogTarget::Disabled,
            pipeline: PipelineConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
