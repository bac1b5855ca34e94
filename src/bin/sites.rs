//! CLI tool for managing the site registry
//!
//! Usage:
//!   webproxy-sites add <name> <domain> <backend-url> [--tls]
//!   webproxy-sites list [--json]
//!   webproxy-sites token [<value>]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use webproxy::{Registry, RegistryError, Site};

/// CLI tool for managing WebProxy sites
#[derive(Parser, Debug)]
#[command(name = "webproxy-sites")]
#[command(author = "WebProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Manage sites and admin tokens for WebProxy")]
struct Args {
    /// Database path
    #[arg(long, env = "DB_PATH", default_value = "./server.db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a new site
    Add {
        /// Site name; certificates live in <site-root>/<name>/
        name: String,

        /// Domain name (e.g., www.example.com)
        domain: String,

        /// Backend base URL (e.g., http://127.0.0.1:3000)
        backend_url: String,

        /// Serve this site over HTTPS
        #[arg(long)]
        tls: bool,
    },

    /// List all sites
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add an admin API token (generated when omitted)
    Token {
        value: Option<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let registry = Registry::open(&args.db_path)
        .with_context(|| format!("failed to open registry at {}", args.db_path.display()))?;

    match args.command {
        Commands::Add {
            name,
            domain,
            backend_url,
            tls,
        } => match registry.insert(Site::new(&name, &domain, &backend_url, tls)) {
            Ok(site) => {
                println!("Added site:");
                print_site(&site);
            }
            Err(RegistryError::Duplicate(domain)) => {
                eprintln!("A site for {} already exists", domain);
                std::process::exit(1);
            }
            Err(e) => return Err(e.into()),
        },

        Commands::List { json } => {
            let sites = registry.list_sites()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&sites)?);
                return Ok(());
            }

            if sites.is_empty() {
                println!("No sites found");
                return Ok(());
            }

            println!("{:<20} {:<40} {:<5} {:<40}", "NAME", "DOMAIN", "TLS", "BACKEND");
            println!("{}", "-".repeat(108));

            for site in &sites {
                println!(
                    "{:<20} {:<40} {:<5} {:<40}",
                    site.name,
                    site.domain,
                    if site.tls_enabled { "yes" } else { "no" },
                    site.backend_url
                );
            }

            println!("\nTotal: {} site(s)", sites.len());
        }

        Commands::Token { value } => {
            let token = registry.add_token(value.as_deref())?;
            println!("{}", token);
        }
    }

    Ok(())
}

fn print_site(site: &Site) {
    println!("  Name:     {}", site.name);
    println!("  Domain:   {}", site.domain);
    println!("  Backend:  {}", site.backend_url);
    println!("  TLS:      {}", site.tls_enabled);
}
