//! Dormant: operator CLI for a persisted job store.
//!
//! Subcommands:
//! - `list`: print every persisted job
//! - `check`: validate the stored document
//! - `cancel`: remove one job
//! - `clear`: remove every job

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "dormant")]
#[command(about = "Inspect and maintain a Dormant job store", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true, env = "DORMANT_CONFIG")]
    config: Option<PathBuf>,

    /// Job document, overriding the configured store path
    #[arg(long, global = true, env = "DORMANT_STORE")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every persisted job
    List,

    /// Validate the stored job document
    Check,

    /// Cancel one job and persist the result
    Cancel {
        /// Job id
        id: u32,
    },

    /// Cancel every job and persist the empty registry
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dormant=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut registry_config =
        config::load(cli.config.as_deref()).map_err(|e| miette::miette!("{}", e))?;
    if let Some(store) = cli.store {
        registry_config.store_path = store;
    }
    tracing::debug!(store = %registry_config.store_path.display(), "using job store");

    match cli.command {
        Commands::List => commands::list(&registry_config).await,
        Commands::Check => commands::check(&registry_config).await,
        Commands::Cancel { id } => commands::cancel(registry_config, id).await,
        Commands::Clear => commands::clear(registry_config).await,
    }
}
