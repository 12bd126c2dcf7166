//! DSC Connector - Main entry point

use clap::Parser;
use dsc_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use dsc_connector::{Cli, Commands, ConnectorConfig, ConnectorError};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // `run` is long-lived and reports progress; one-shot commands stay quiet
    let level = match (&cli.command, cli.verbose) {
        (_, true) => LogLevel::Debug,
        (Commands::Run { .. }, false) => LogLevel::Info,
        _ => LogLevel::Warn,
    };
    let base = LogConfig::builder()
        .level(level)
        .output(LogOutput::Console)
        .log_file_prefix("dsc-connector")
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env_with(base.clone()).unwrap_or(base);
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> dsc_connector::Result<()> {
    let mut config = ConnectorConfig::load().map_err(|e| ConnectorError::config(e.to_string()))?;
    if let Some(ref url) = cli.database_url {
        config.database_url = url.clone();
    }

    match &cli.command {
        Commands::Run { descriptors } => {
            dsc_connector::commands::run::run(&config, descriptors).await
        },

        Commands::Status { transfer_id } => {
            dsc_connector::commands::status::run(&config, transfer_id.as_deref()).await
        },

        Commands::Cancel { transfer_id } => {
            dsc_connector::commands::cancel::run(&config, transfer_id)
                .await
                .map(|_| ())
        },

        Commands::RefreshEndpoint { transfer_id, file } => {
            dsc_connector::commands::refresh::run(&config, transfer_id, file).await
        },
    }
}
