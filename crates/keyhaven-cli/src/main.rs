//! CLI entry point for Keyhaven.
//!
//! This binary provides the `keyhaven` command: vault administration
//! subcommands plus `serve`, which speaks the broker's JSON message protocol
//! over stdin/stdout.

mod cli;
mod commands;
mod config;
mod serve;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::Config;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env(&cli.config)?;
    init_tracing(&config.log_level, config.log_json);

    match cli.command {
        Commands::Init => commands::cmd_init(&config).await,
        Commands::Status => commands::cmd_status(&config).await,
        Commands::Providers => {
            commands::cmd_providers();
            Ok(())
        }
        Commands::Add {
            provider,
            name,
            endpoint,
        } => commands::cmd_add(&config, &provider, name, endpoint).await,
        Commands::List => commands::cmd_list(&config).await,
        Commands::Update {
            id,
            name,
            endpoint,
            clear_endpoint,
            secret,
        } => commands::cmd_update(&config, &id, name, endpoint, clear_endpoint, secret).await,
        Commands::Remove { id } => commands::cmd_remove(&config, &id).await,
        Commands::Passwd => commands::cmd_passwd(&config).await,
        Commands::Reset { yes } => commands::cmd_reset(&config, yes).await,
        Commands::Allow { action } => commands::cmd_allow(&config, action).await,
        Commands::Endpoint { action } => commands::cmd_endpoint(&config, action).await,
        Commands::History { limit, clear } => commands::cmd_history(&config, limit, clear).await,
        Commands::Settings {
            auto_lock,
            history,
            max_history,
        } => commands::cmd_settings(&config, auto_lock, history, max_history).await,
        Commands::Serve => serve::cmd_serve(&config).await,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
///
/// Output goes to stderr; stdout belongs to `serve`.
fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
