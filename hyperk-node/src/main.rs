//! # hyperk Node Daemon
//!
//! Runs on a hypervisor host, provisions virtual machines from base images
//! and serves the instance REST API.
//!
//! ## Usage
//! ```bash
//! hyperk-node --config /etc/hyperk/node.yaml
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use hyperk_node::cli::Args;
use hyperk_node::config::{Config, DEFAULT_CONFIG_PATH};
use hyperk_node::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    if args.log_json {
        hyperk_common::init_logging_json(&args.log_level)?;
    } else {
        hyperk_common::init_logging(&args.log_level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting hyperk Node Daemon"
    );

    // Load configuration
    let config = match &args.config {
        Some(config_path) => {
            // Explicit config file provided
            match Config::load(config_path) {
                Ok(cfg) => {
                    info!(config_path = %config_path, "Configuration loaded");
                    cfg.with_cli_overrides(&args)
                }
                Err(e) => {
                    error!(error = %e, path = %config_path, "Failed to load configuration");
                    return Err(e);
                }
            }
        }
        None => {
            // Try default location, fall back to CLI-only config
            match Config::load(DEFAULT_CONFIG_PATH) {
                Ok(cfg) => {
                    info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                    cfg.with_cli_overrides(&args)
                }
                Err(_) => {
                    info!("No config file found, using CLI arguments and defaults");
                    Config::default_with_cli(&args)
                }
            }
        }
    };

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e);
    }

    info!(
        listen = %config.server.listen_address,
        hypervisor = ?config.hypervisor.backend,
        max_jobs = config.provisioning.max_concurrent_jobs,
        "Node daemon configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
