//! CLI entry point for PlugHost.
//!
//! This binary provides the `plughost` command: install and remove plugins,
//! inspect the catalog, and run plugin procedures.

mod cli;
mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::commands::Host;
use crate::config::HostConfig;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = dotenvy::dotenv();
    init_tracing(if cli.verbose { "debug" } else { "info" });

    let config = HostConfig::load(cli.config.as_deref())?;
    let host = Host::open(&config)?;

    let outcome = commands::run(&host, cli.command).await;
    host.shutdown().await;
    outcome
}

/// Initialize the tracing subscriber with the given default log level.
///
/// Logs go to stderr so command output on stdout stays parseable.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
