//! tfmirror - Terraform/OpenTofu release mirror
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
//!
//! Server and command-line front end for `tfmirror-core`.
//!
//! # Commands
//!
//! - `tfmirror serve`: scheduler plus the HTTP read API
//! - `tfmirror sync <mirror>`: one run in the foreground
//! - `tfmirror status [<mirror>]`: version counts and recent runs
//! - `tfmirror keygen` / `tfmirror sign`: Ed25519 keys for self-hosted
//!   upstreams that publish signed checksum manifests

pub mod api;
pub mod cmd;
pub mod config;
pub mod context;
pub mod error;
pub mod status;

pub use api::{AppState, admin_router, router};
pub use config::{Config, ConfigError};
pub use context::Engine;
pub use error::ApiError;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "tfmirror")]
#[command(author, version, about = "tfmirror - verified Terraform/OpenTofu release mirror")]
pub struct Cli {
    /// Configuration file
    #[arg(
        long,
        short,
        global = true,
        env = "TFMIRROR_CONFIG",
        default_value = config::DEFAULT_CONFIG_PATH
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the scheduler and the HTTP API
    Serve,
    /// Sync one mirror now and print the result
    Sync {
        /// Mirror name
        mirror: String,
    },
    /// Show mirror state and recent sync runs
    Status {
        /// Mirror name (all mirrors if omitted)
        mirror: Option<String>,
        /// Number of recent runs to show
        #[arg(long, default_value_t = 5)]
        history: u32,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Generate an Ed25519 key pair for signing checksum manifests
    Keygen {
        /// Also write the secret key to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Sign a checksum manifest with TFMIRROR_MANIFEST_KEY
    Sign {
        /// Manifest to sign
        input: PathBuf,
        /// Signature output (defaults to `<input>.sig`)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}
