//! Encrypted credential vault for Keyhaven.
//!
//! Stores third-party API credentials encrypted at rest and holds them in
//! plaintext only while the vault is unlocked.
//!
//! # Modules
//!
//! - [`crypto`] -- PBKDF2-HMAC-SHA256 key derivation, AES-256-GCM, zeroizing
//!   key holder, base64 helpers.
//! - [`provider`] -- the static provider table.
//! - [`model`] -- persisted and in-memory data shapes.
//! - [`store`] -- key-value backends and the typed [`CredentialStore`].
//! - [`manager`] -- the [`VaultManager`] lock state machine.
//! - [`error`] -- unified error type.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use keyhaven_kernel::IpcBus;
//! use keyhaven_vault::{CredentialStore, NewCredential, VaultManager};
//!
//! # async fn example() -> keyhaven_vault::Result<()> {
//! let vault = VaultManager::load(CredentialStore::in_memory(), IpcBus::default()).await?;
//! vault.create("correct-horse-battery").await?;
//! vault.add_credential(&NewCredential::new("openai", "sk-...")).await?;
//! vault.lock().await;
//!
//! assert!(vault.unlock("correct-horse-battery").await?);
//! let entry = vault.find_by_provider("openai")?;
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod manager;
pub mod model;
pub mod provider;
pub mod store;

pub use error::{Result, VaultError};
pub use manager::VaultManager;
pub use model::{
    CredentialEntry, CredentialSummary, CredentialUpdate, DomainAllowEntry, HistoryEntry,
    NewCredential, Settings, VaultRecord, VaultStatus,
};
pub use provider::{ProviderConfig, find_provider, providers};
pub use store::{CredentialStore, KvBackend, MemoryBackend, SqliteBackend};
