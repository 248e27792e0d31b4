//! Administrative subcommands.
//!
//! Each command opens the SQLite-backed vault, does one thing and exits.
//! Commands that touch credentials unlock first, using `KEYHAVEN_PASSWORD`
//! when set and prompting on the terminal otherwise.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use keyhaven_broker::{DomainAllowList, HistoryLog, SessionGuard};
use keyhaven_kernel::IpcBus;
use keyhaven_vault::{
    CredentialStore, CredentialUpdate, NewCredential, SqliteBackend, VaultManager, VaultStatus,
    providers,
};
use tracing::info;
use zeroize::Zeroizing;

use crate::cli::{AllowAction, EndpointAction};
use crate::config::{Config, password_from_env};

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

/// Open the vault stored under `config.data_dir`, creating the directory if
/// needed.
pub async fn open_vault(config: &Config) -> Result<Arc<VaultManager>> {
    if !config.data_dir.exists() {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data directory {}", config.data_dir.display())
        })?;
    }

    let db_path = config.db_path();
    let backend = SqliteBackend::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    let store = CredentialStore::new(Arc::new(backend));
    let vault = VaultManager::load(store, IpcBus::default())
        .await
        .context("failed to load vault")?;
    info!(path = %db_path.display(), status = %vault.status(), "vault opened");
    Ok(Arc::new(vault))
}

/// Unlock with the environment password or an interactive prompt.
pub async fn unlock(vault: &VaultManager) -> Result<()> {
    match vault.status() {
        VaultStatus::NoVault => bail!("no vault found; run `keyhaven init` first"),
        VaultStatus::Unlocked => return Ok(()),
        VaultStatus::Locked => {}
    }

    let password = match password_from_env() {
        Some(p) => p,
        None => prompt_hidden("Master password")?,
    };
    if !vault.unlock(&password).await.context("failed to unlock vault")? {
        bail!("incorrect password");
    }
    Ok(())
}

/// Read a value from the terminal without echoing it.
fn prompt_hidden(label: &str) -> Result<Zeroizing<String>> {
    let value = dialoguer::Password::new()
        .with_prompt(label)
        .interact()
        .context("failed to read input")?;
    Ok(Zeroizing::new(value))
}

/// Prompt twice for a new master password.
fn prompt_new_password() -> Result<Zeroizing<String>> {
    let password = dialoguer::Password::new()
        .with_prompt("New master password")
        .with_confirmation("Repeat password", "Passwords do not match, try again")
        .interact()
        .context("failed to read password")?;
    Ok(Zeroizing::new(password))
}

// ---------------------------------------------------------------------------
// Vault lifecycle
// ---------------------------------------------------------------------------

pub async fn cmd_init(config: &Config) -> Result<()> {
    let vault = open_vault(config).await?;
    if vault.is_installed() {
        bail!("a vault already exists in {}", config.data_dir.display());
    }

    let password = match password_from_env() {
        Some(p) => p,
        None => prompt_new_password()?,
    };
    vault.create(&password).await.context("failed to create vault")?;

    println!();
    println!("  [+] Vault created at {}", config.db_path().display());
    println!("  Next: `keyhaven add <provider>` and `keyhaven allow add <origin>`.");
    println!();
    Ok(())
}

pub async fn cmd_status(config: &Config) -> Result<()> {
    let vault = open_vault(config).await?;
    let store = vault.store();
    let domains = store.allowed_domains().await?;
    let history = store.history().await?;
    let settings = store.settings().await?;

    println!();
    println!("  Keyhaven Status");
    println!("  ===============");
    println!();
    println!("  Version:          {}", env!("CARGO_PKG_VERSION"));
    println!("  Database:         {}", config.db_path().display());
    println!("  Vault:            {}", vault.status());
    println!("  Allowed domains:  {}", domains.len());
    println!(
        "  History:          {} entries ({})",
        history.len(),
        if settings.history_enabled { "enabled" } else { "disabled" }
    );
    if settings.auto_lock_minutes == 0 {
        println!("  Auto-lock:        disabled");
    } else {
        println!("  Auto-lock:        {} min", settings.auto_lock_minutes);
    }
    println!();
    Ok(())
}

pub async fn cmd_passwd(config: &Config) -> Result<()> {
    let vault = open_vault(config).await?;
    if !vault.is_installed() {
        bail!("no vault found; run `keyhaven init` first");
    }

    let old = match password_from_env() {
        Some(p) => p,
        None => prompt_hidden("Current master password")?,
    };
    if !vault.unlock(&old).await.context("failed to unlock vault")? {
        bail!("incorrect password");
    }
    let new = prompt_new_password()?;
    if !vault
        .change_password(&old, &new)
        .await
        .context("failed to change password")?
    {
        bail!("incorrect password");
    }

    println!("  [+] Master password changed");
    Ok(())
}

pub async fn cmd_reset(config: &Config, confirmed: bool) -> Result<()> {
    if !confirmed {
        bail!("reset destroys every stored credential; re-run with --yes to confirm");
    }
    let vault = open_vault(config).await?;
    vault.reset().await.context("failed to reset vault")?;
    println!("  [+] Vault reset; allow-list, history and settings were kept");
    Ok(())
}

pub fn cmd_providers() {
    println!();
    for p in providers() {
        let base = if p.requires_caller_endpoint {
            "(endpoint required)"
        } else {
            p.base_url
        };
        println!("  {:<12} {:<24} {}", p.id, p.display_name, base);
    }
    println!();
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

pub async fn cmd_add(
    config: &Config,
    provider: &str,
    name: Option<String>,
    endpoint: Option<String>,
) -> Result<()> {
    let vault = open_vault(config).await?;
    unlock(&vault).await?;

    let secret = prompt_hidden("Secret")?;
    let mut new = NewCredential::new(provider, secret.as_str());
    if let Some(name) = name {
        new = new.with_display_name(name);
    }
    if let Some(endpoint) = endpoint {
        new = new.with_endpoint(endpoint);
    }

    let id = vault
        .add_credential(&new)
        .await
        .context("failed to add credential")?;
    println!("  [+] Stored credential {id}");
    Ok(())
}

pub async fn cmd_list(config: &Config) -> Result<()> {
    let vault = open_vault(config).await?;
    unlock(&vault).await?;

    let summaries = vault.list_summaries()?;
    let endpoints = vault.custom_endpoints().await?;
    if summaries.is_empty() {
        println!("  No credentials stored.");
        return Ok(());
    }

    println!();
    for s in &summaries {
        println!("  {}  {:<12} {}", s.id, s.provider_id, s.display_name);
        if let Some(url) = &s.endpoint_url {
            println!("      endpoint: {url}");
        }
        if let Some(url) = endpoints.get(&s.id) {
            println!("      custom endpoint: {url}");
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_update(
    config: &Config,
    id: &str,
    name: Option<String>,
    endpoint: Option<String>,
    clear_endpoint: bool,
    secret: bool,
) -> Result<()> {
    let vault = open_vault(config).await?;
    unlock(&vault).await?;

    let mut update = CredentialUpdate::default();
    update.display_name = name;
    if clear_endpoint {
        update.endpoint_url = Some(None);
    } else if let Some(url) = endpoint {
        update.endpoint_url = Some(Some(url));
    }
    if secret {
        update.secret_value = Some(prompt_hidden("New secret")?.as_str().to_owned());
    }
    if update.is_empty() {
        bail!("nothing to update; pass --name, --endpoint, --clear-endpoint or --secret");
    }

    if !vault
        .update_credential(id, &update)
        .await
        .context("failed to update credential")?
    {
        bail!("no credential with id {id}");
    }
    println!("  [+] Updated credential {id}");
    Ok(())
}

pub async fn cmd_remove(config: &Config, id: &str) -> Result<()> {
    let vault = open_vault(config).await?;
    unlock(&vault).await?;

    if !vault
        .delete_credential(id)
        .await
        .context("failed to delete credential")?
    {
        bail!("no credential with id {id}");
    }
    println!("  [+] Removed credential {id}");
    Ok(())
}

pub async fn cmd_endpoint(config: &Config, action: EndpointAction) -> Result<()> {
    let vault = open_vault(config).await?;
    unlock(&vault).await?;

    match action {
        EndpointAction::Set { id, url } => {
            if !vault.set_custom_endpoint(&id, &url).await? {
                bail!("no credential with id {id}");
            }
            println!("  [+] {id} -> {url}");
        }
        EndpointAction::Remove { id } => {
            if vault.remove_custom_endpoint(&id).await? {
                println!("  [+] Custom endpoint removed from {id}");
            } else {
                println!("  [=] {id} had no custom endpoint");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Allow-list, history, settings
// ---------------------------------------------------------------------------

pub async fn cmd_allow(config: &Config, action: AllowAction) -> Result<()> {
    let vault = open_vault(config).await?;
    let allowlist = DomainAllowList::new(vault.store().clone());

    match action {
        AllowAction::Add { origin } => {
            if allowlist.add(&origin).await? {
                println!("  [+] Allowed {origin}");
            } else {
                println!("  [=] {origin} is already allowed");
            }
        }
        AllowAction::Remove { origin } => {
            if allowlist.remove(&origin).await? {
                println!("  [+] Removed {origin}");
            } else {
                println!("  [=] {origin} was not allowed");
            }
        }
        AllowAction::List => {
            let entries = allowlist.list().await?;
            if entries.is_empty() {
                println!("  No domains allowed.");
            }
            for e in entries {
                println!("  {:<32} added {}", e.domain, e.added_at.format("%Y-%m-%d %H:%M"));
            }
        }
    }
    Ok(())
}

pub async fn cmd_history(config: &Config, limit: Option<usize>, clear: bool) -> Result<()> {
    let vault = open_vault(config).await?;
    let history = HistoryLog::new(vault.store().clone());

    if clear {
        history.clear().await?;
        println!("  [+] History cleared");
        return Ok(());
    }

    let entries = history.list(limit).await?;
    if entries.is_empty() {
        println!("  No requests recorded.");
    }
    for e in entries {
        println!(
            "  {}  {:>3}  {:>6}ms  {:<12} {:<24} {}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            e.http_status,
            e.duration_ms,
            e.provider_id,
            e.caller_domain,
            e.endpoint_path,
        );
    }
    Ok(())
}

pub async fn cmd_settings(
    config: &Config,
    auto_lock: Option<u32>,
    history: Option<bool>,
    max_history: Option<usize>,
) -> Result<()> {
    let vault = open_vault(config).await?;
    let store = vault.store().clone();

    if let Some(minutes) = auto_lock {
        SessionGuard::new(Arc::clone(&vault))
            .set_auto_lock_minutes(minutes)
            .await?;
    }
    if history.is_some() || max_history.is_some() {
        let mut settings = store.settings().await?;
        if let Some(enabled) = history {
            settings.history_enabled = enabled;
        }
        if let Some(max) = max_history {
            settings.max_history_entries = max;
        }
        store.save_settings(&settings).await?;
    }

    print_settings(&store).await
}

async fn print_settings(store: &CredentialStore) -> Result<()> {
    let settings = store.settings().await?;
    println!();
    println!("  autoLockMinutes:    {}", settings.auto_lock_minutes);
    println!("  historyEnabled:     {}", settings.history_enabled);
    println!("  maxHistoryEntries:  {}", settings.max_history_entries);
    println!();
    Ok(())
}
