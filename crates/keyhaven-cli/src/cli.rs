//! CLI argument definitions for Keyhaven.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Keyhaven -- a local vault that brokers API calls without exposing keys.
#[derive(Parser)]
#[command(
    name = "keyhaven",
    version,
    about = "Keyhaven -- local credential vault and request broker",
    long_about = "Stores provider API keys encrypted under a master password and proxies \
                  calls from allow-listed callers, injecting the key so callers never see it."
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, short, global = true, default_value = "keyhaven.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new vault protected by a master password.
    Init,

    /// Show vault state, allow-list size and settings.
    Status,

    /// List the providers Keyhaven can call.
    Providers,

    /// Store a credential (the secret is read from the terminal).
    Add {
        /// Provider id, e.g. `openai`.
        provider: String,

        /// Display name; defaults to the provider's name.
        #[arg(long)]
        name: Option<String>,

        /// Base URL, required for self-hosted providers.
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// List stored credentials (secrets are never shown).
    List,

    /// Change a stored credential.
    Update {
        /// Credential id.
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long, conflicts_with = "clear_endpoint")]
        endpoint: Option<String>,

        /// Remove the stored endpoint URL.
        #[arg(long)]
        clear_endpoint: bool,

        /// Prompt for a replacement secret.
        #[arg(long)]
        secret: bool,
    },

    /// Delete a stored credential.
    Remove {
        /// Credential id.
        id: String,
    },

    /// Change the master password.
    Passwd,

    /// Destroy the vault and its credentials.
    Reset {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },

    /// Manage the caller allow-list.
    Allow {
        #[command(subcommand)]
        action: AllowAction,
    },

    /// Manage per-credential custom endpoints.
    Endpoint {
        #[command(subcommand)]
        action: EndpointAction,
    },

    /// Show or clear request history.
    History {
        /// Show at most this many entries.
        #[arg(long, short)]
        limit: Option<usize>,

        /// Delete all history entries.
        #[arg(long, conflicts_with = "limit")]
        clear: bool,
    },

    /// Show or change persisted settings.
    Settings {
        /// Auto-lock after this many idle minutes (0 disables).
        #[arg(long)]
        auto_lock: Option<u32>,

        /// Enable or disable request history.
        #[arg(long)]
        history: Option<bool>,

        /// Maximum number of history entries kept.
        #[arg(long)]
        max_history: Option<usize>,
    },

    /// Serve the JSON-lines message protocol on stdin/stdout.
    Serve,
}

#[derive(Subcommand)]
pub enum AllowAction {
    /// Allow an origin (URL or bare hostname).
    Add { origin: String },
    /// Revoke an origin.
    Remove { origin: String },
    /// List allowed hostnames.
    List,
}

#[derive(Subcommand)]
pub enum EndpointAction {
    /// Point a credential at a custom base URL.
    Set { id: String, url: String },
    /// Remove a credential's custom base URL.
    Remove { id: String },
}
