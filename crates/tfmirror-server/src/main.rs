//! tfmirror - verified Terraform/OpenTofu release mirror

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tfmirror_server::cmd;
use tfmirror_server::config::{Config, LoggingSection};
use tfmirror_server::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { out } => {
            init_logging(None);
            cmd::keys::keygen(out.as_deref())
        }
        Commands::Sign { input, output } => {
            init_logging(None);
            cmd::keys::sign(&input, output.as_deref())
        }
        Commands::Serve => cmd::serve::serve(&load_config(&cli.config)?).await,
        Commands::Sync { mirror } => cmd::sync::sync(&load_config(&cli.config)?, &mirror).await,
        Commands::Status {
            mirror,
            history,
            json,
        } => {
            let config = load_config(&cli.config)?;
            cmd::status::status(&config, mirror.as_deref(), history, json).await
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?;
    init_logging(Some(&config.logging));
    Ok(config)
}

/// `TFMIRROR_LOG`, then `RUST_LOG`, then the configured level.
fn init_logging(logging: Option<&LoggingSection>) {
    let fallback = logging.map_or("info", |l| l.level.as_str());
    let filter = std::env::var("TFMIRROR_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| {
            EnvFilter::try_new(fallback).unwrap_or_else(|e| {
                eprintln!("WARN: invalid log level '{fallback}' ({e}); using 'info'");
                EnvFilter::new("info")
            })
        });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.is_some_and(|l| l.json) {
        builder.json().init();
    } else {
        builder.init();
    }
}
