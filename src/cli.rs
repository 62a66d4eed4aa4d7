//! Command-line interface.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::server;

/// Caching reverse proxy for package registries
#[derive(Parser)]
#[command(name = "hub")]
#[command(about = "Caching reverse proxy for package registry upstreams")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy server
    Serve {
        /// Path to the YAML configuration file
        #[arg(long, short, default_value = "hub.yaml")]
        config: PathBuf,
        /// Host to bind the server to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(long, short, default_value_t = 6587)]
        port: u16,
    },
}

/// Parse arguments and execute.
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hub=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, host, port } => {
            let config = Config::load(&config)
                .with_context(|| format!("failed to load config {}", config.display()))?;
            server::run_server(&host, port, config).await
        }
    }
}
