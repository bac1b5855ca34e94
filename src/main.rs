//! WebProxy - Main entry point
//!
//! A multi-tenant HTTP/HTTPS reverse proxy

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use webproxy::config::{self, DEFAULT_MAX_BODY_BYTES};
use webproxy::{
    tls, AccessLogTarget, AdminConfig, AdminServer, CertificateIndex, FixedRouter, LogMode,
    Pipeline, PipelineConfig, ProxyModeConfig, ProxyServer, Registry, RegistryRouter, Router,
    RuleEngine, StartConfig,
};

/// WebProxy - A multi-tenant HTTP/HTTPS reverse proxy
#[derive(Parser, Debug)]
#[command(name = "webproxy")]
#[command(author = "WebProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A multi-tenant HTTP/HTTPS reverse proxy")]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Route by host against the site registry (HTTP and HTTPS)
    Start(StartArgs),

    /// Forward every request to a single backend
    Proxy(ProxyArgs),

    /// Run the admin API used to register sites
    Admin(AdminArgs),
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// WAF rules file (YAML); filtering is off without it
    #[arg(long, env = "WAF_RULES")]
    waf_rules: Option<PathBuf>,

    /// Seconds allowed for backend connect and response head
    #[arg(long, default_value_t = 30)]
    backend_timeout: u64,

    /// Largest request body buffered for inspection
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    /// Log every routed host
    #[arg(long)]
    debug: bool,

    /// Path of the request log file (log mode save)
    #[arg(long)]
    log_path: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Address to bind listeners on
    #[arg(long)]
    listen_ip: Option<IpAddr>,

    /// HTTP port
    #[arg(long = "http", alias = "http-port", default_value_t = 80)]
    http_port: u16,

    /// HTTPS port
    #[arg(long = "https", alias = "https-port", default_value_t = 443)]
    https_port: u16,

    /// Serve plain HTTP only
    #[arg(long)]
    no_https: bool,

    /// Registry database path
    #[arg(long, env = "DB_PATH", default_value = "./server.db")]
    db_path: PathBuf,

    /// Directory holding `<name>/cert.pem` and `<name>/key.pem`
    #[arg(long, env = "SITE_ROOT", default_value = "./website")]
    site_root: PathBuf,

    /// Request log mode
    #[arg(long, value_enum, default_value = "off")]
    log_mode: LogMode,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Args, Debug)]
struct ProxyArgs {
    /// Address to bind the listener on
    #[arg(long)]
    listen_ip: Option<IpAddr>,

    /// Port to listen on
    #[arg(long)]
    server_port: u16,

    /// Backend port
    #[arg(long)]
    proxy_port: u16,

    /// Backend IP
    #[arg(long, default_value = "127.0.0.1")]
    proxy_ip: String,

    /// Request log mode
    #[arg(long, value_enum, default_value = "cli")]
    log_mode: LogMode,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Args, Debug)]
struct AdminArgs {
    /// Address to bind the admin API on
    #[arg(long)]
    listen_ip: Option<IpAddr>,

    /// Admin API port
    #[arg(long, alias = "web-port", default_value_t = 7788)]
    port: u16,

    /// Registry database path
    #[arg(long, env = "DB_PATH", default_value = "./server.db")]
    db_path: PathBuf,
}

impl PipelineArgs {
    fn config(&self) -> Result<PipelineConfig> {
        Ok(PipelineConfig::new(self.backend_timeout, self.max_body_bytes, self.debug)?)
    }
}

impl StartArgs {
    fn into_config(self) -> Result<StartConfig> {
        let config = StartConfig {
            http_addr: config::listen_addr(self.listen_ip, self.http_port),
            https_addr: (!self.no_https)
                .then(|| config::listen_addr(self.listen_ip, self.https_port)),
            db_path: self.db_path,
            site_root: self.site_root,
            access_log: AccessLogTarget::from_mode(self.log_mode, self.pipeline.log_path.clone())?,
            pipeline: self.pipeline.config()?,
            rules_path: self.pipeline.waf_rules,
        };
        config.validate()?;
        Ok(config)
    }
}

impl ProxyArgs {
    fn into_config(self) -> Result<ProxyModeConfig> {
        Ok(ProxyModeConfig::new(
            config::listen_addr(self.listen_ip, self.server_port),
            &self.proxy_ip,
            self.proxy_port,
            self.pipeline.waf_rules.clone(),
            AccessLogTarget::from_mode(self.log_mode, self.pipeline.log_path.clone())?,
            self.pipeline.config()?,
        )?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Starting WebProxy v1.0.0");

    match cli.command {
        Commands::Start(args) => run_start(args.into_config()?).await,
        Commands::Proxy(args) => run_proxy(args.into_config()?).await,
        Commands::Admin(args) => {
            run_admin(AdminConfig {
                listen_addr: config::listen_addr(args.listen_ip, args.port),
                db_path: args.db_path,
            })
            .await
        }
    }
}

/// Assemble the pipeline; any configuration problem aborts startup here
fn build_pipeline(
    router: Arc<dyn Router>,
    rules_path: Option<&PathBuf>,
    access_log: &AccessLogTarget,
    config: PipelineConfig,
) -> Result<Pipeline> {
    let mut pipeline = Pipeline::new(router, config).context("failed to build backend TLS client")?;

    if let Some(path) = rules_path {
        let rules = RuleEngine::from_file(path).context("failed to load WAF rules")?;
        info!("WAF rules loaded from {}", path.display());
        pipeline = pipeline.with_rules(rules);
    }

    if let Some(log) = access_log.open().context("failed to open request log")? {
        pipeline = pipeline.with_access_log(log);
    }

    Ok(pipeline)
}

async fn run_start(config: StartConfig) -> Result<()> {
    let registry = Arc::new(
        Registry::open(&config.db_path)
            .with_context(|| format!("failed to open registry at {}", config.db_path.display()))?,
    );
    info!("Registry opened at: {}", config.db_path.display());

    let pipeline = build_pipeline(
        Arc::new(RegistryRouter::new(registry.clone())),
        config.rules_path.as_ref(),
        &config.access_log,
        config.pipeline.clone(),
    )?;

    // Certificates are loaded before any listener binds so a bad site aborts startup
    let https = match config.https_addr {
        Some(addr) => {
            let index = CertificateIndex::load(&registry, &config.site_root)
                .context("failed to load SSL certificates")?;
            info!("Loaded {} certificate(s) from {}", index.len(), config.site_root.display());
            let acceptor = tls::acceptor(Arc::new(index)).context("failed to build TLS config")?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind HTTPS listener on {}", addr))?;
            Some((listener, acceptor))
        }
        None => None,
    };

    let http_listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http_addr))?;

    let server = Arc::new(ProxyServer::new(pipeline));
    tokio::spawn(server.clone().serve_http(http_listener));
    if let Some((listener, acceptor)) = https {
        tokio::spawn(server.clone().serve_https(listener, acceptor));
    }

    info!("WebProxy started successfully");
    wait_for_shutdown().await
}

async fn run_proxy(config: ProxyModeConfig) -> Result<()> {
    info!(
        "Forwarding {} to {}",
        config.listen_addr,
        config.target.authority()
    );

    let pipeline = build_pipeline(
        Arc::new(FixedRouter::new(config.target.clone())),
        config.rules_path.as_ref(),
        &config.access_log,
        config.pipeline.clone(),
    )?;

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    let server = Arc::new(ProxyServer::new(pipeline));
    tokio::spawn(server.serve_http(listener));

    wait_for_shutdown().await
}

async fn run_admin(config: AdminConfig) -> Result<()> {
    let registry = Arc::new(
        Registry::open(&config.db_path)
            .with_context(|| format!("failed to open registry at {}", config.db_path.display()))?,
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind admin listener on {}", config.listen_addr))?;

    tokio::spawn(Arc::new(AdminServer::new(registry)).serve(listener));

    wait_for_shutdown().await
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");
    Ok(())
}
