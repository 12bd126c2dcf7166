//! DSC Connector Host
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Command-line host for the `dsc-transfer` data plane.
//!
//! # Overview
//!
//! - **run**: reconciles transfers left over by a previous process, starts
//!   new transfers from descriptor files and waits for all of them
//! - **status**: prints persisted transfer records as JSON
//! - **cancel**: abandons a paused transfer
//! - **refresh-endpoint**: stores a renewed endpoint reference for a waiting
//!   transfer
//!
//! State lives in the SQLite database named by `DSC_DATABASE_URL`, so the
//! commands can be run from separate processes against the same database.

pub mod commands;
pub mod config;
pub mod error;

pub use config::ConnectorConfig;
pub use error::{ConnectorError, Result};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dsc-connector")]
#[command(author, version, about = "Resumable data-space transfer host", long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Transfer state database
    #[arg(long, global = true, env = "DSC_DATABASE_URL")]
    pub database_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resume interrupted transfers and start new ones
    ///
    /// Waits until every transfer finishes. Ctrl-C or SIGTERM pauses all
    /// running transfers at their next chunk boundary.
    Run {
        /// Transfer descriptor JSON files
        descriptors: Vec<PathBuf>,
    },

    /// Show transfer state and progress
    Status {
        /// Only show this transfer
        transfer_id: Option<String>,
    },

    /// Abandon a paused transfer
    Cancel {
        transfer_id: String,
    },

    /// Replace the endpoint reference of a transfer
    RefreshEndpoint {
        transfer_id: String,

        /// Endpoint reference JSON file
        file: PathBuf,
    },
}
