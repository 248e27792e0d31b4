//! Vault lock state machine.
//!
//! [`VaultManager`] is the sole owner of the derived key and the decrypted
//! credential list.  States:
//!
//! ```text
//!   NoVault --create--> Unlocked <--unlock-- Locked
//!                          |                   ^
//!                          +------lock---------+
//!   any --reset--> NoVault
//! ```
//!
//! All mutating operations are serialized through an async gate so that the
//! read-modify-encrypt-write cycle against the single vault record is never
//! interleaved.  Readers take a short synchronous read lock on the state and
//! always receive clones, never references into the live list.
//!
//! Mutations are transactional: the list is copied, the copy is changed,
//! encrypted and persisted, and only then swapped in.  If persisting fails
//! the copy is dropped and the in-memory state still matches storage.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use keyhaven_kernel::{Event, IpcBus, LockReason};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, DerivedKey, SALT_LEN};
use crate::error::{Result, VaultError};
use crate::model::{
    CredentialEntry, CredentialSummary, CredentialUpdate, NewCredential, VaultRecord, VaultStatus,
};
use crate::provider;
use crate::store::CredentialStore;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

enum VaultState {
    NoVault,
    Locked,
    Unlocked(UnlockedVault),
}

/// Secret-bearing state.  Dropping it wipes the key and every entry.
struct UnlockedVault {
    key: DerivedKey,
    salt: [u8; SALT_LEN],
    entries: Vec<CredentialEntry>,
}

impl VaultState {
    fn status(&self) -> VaultStatus {
        match self {
            Self::NoVault => VaultStatus::NoVault,
            Self::Locked => VaultStatus::Locked,
            Self::Unlocked(_) => VaultStatus::Unlocked,
        }
    }
}

// ---------------------------------------------------------------------------
// VaultManager
// ---------------------------------------------------------------------------

/// Owns the vault lifecycle and the in-memory credential set.
pub struct VaultManager {
    store: CredentialStore,
    bus: IpcBus,
    state: RwLock<VaultState>,
    gate: Mutex<()>,
}

impl VaultManager {
    /// Inspect storage and start in `NoVault` or `Locked`.
    pub async fn load(store: CredentialStore, bus: IpcBus) -> Result<Self> {
        let initial = if store.load_vault().await?.is_some() {
            VaultState::Locked
        } else {
            VaultState::NoVault
        };
        debug!(status = %initial.status(), "vault manager loaded");

        Ok(Self {
            store,
            bus,
            state: RwLock::new(initial),
            gate: Mutex::new(()),
        })
    }

    /// The store this manager persists through.
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// The bus lifecycle events are published on.
    pub fn bus(&self) -> &IpcBus {
        &self.bus
    }

    pub fn status(&self) -> VaultStatus {
        self.read_state().status()
    }

    pub fn is_unlocked(&self) -> bool {
        matches!(*self.read_state(), VaultState::Unlocked(_))
    }

    /// Whether a vault record exists.
    pub fn is_installed(&self) -> bool {
        !matches!(*self.read_state(), VaultState::NoVault)
    }

    // -- lifecycle ---------------------------------------------------------

    /// Create a new, empty vault protected by `password` and leave it
    /// unlocked.
    ///
    /// # Errors
    ///
    /// [`VaultError::AlreadyExists`] if a vault record is already persisted,
    /// [`VaultError::InvalidInput`] for an empty password.
    pub async fn create(&self, password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(VaultError::InvalidInput {
                reason: "master password must not be empty".into(),
            });
        }

        let _gate = self.gate.lock().await;

        if self.store.load_vault().await?.is_some() {
            return Err(VaultError::AlreadyExists);
        }

        let (key, salt) = derive_blocking(password, None).await?;
        let entries = Vec::new();
        let now = Utc::now();
        let record = seal(&entries, &key, &salt, now, now)?;
        self.store.save_vault(&record).await?;

        *self.write_state() = VaultState::Unlocked(UnlockedVault { key, salt, entries });

        info!("vault created");
        self.notify(Event::VaultCreated { timestamp: now });
        Ok(())
    }

    /// Unlock with `password`.
    ///
    /// Returns `Ok(false)` for a wrong password and equally for a damaged
    /// record; the state stays `Locked` in both cases.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotInitialized`] if no vault record exists.
    pub async fn unlock(&self, password: &str) -> Result<bool> {
        let _gate = self.gate.lock().await;

        let record = self
            .store
            .load_vault()
            .await?
            .ok_or(VaultError::NotInitialized)?;

        let Ok(salt) = crypto::decode(&record.salt) else {
            warn!("vault unlock failed");
            return Ok(false);
        };
        let (key, salt) = match derive_blocking(password, Some(salt)).await {
            Ok(derived) => derived,
            Err(VaultError::KeyDerivationFailed { .. }) => {
                warn!("vault unlock failed");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let Some(entries) = open(&record, &key) else {
            warn!("vault unlock failed");
            return Ok(false);
        };

        let count = entries.len();
        *self.write_state() = VaultState::Unlocked(UnlockedVault { key, salt, entries });

        info!(credentials = count, "vault unlocked");
        self.notify(Event::VaultUnlocked {
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    /// Lock the vault, wiping the key and the decrypted list.  Idempotent.
    pub async fn lock(&self) {
        self.lock_with_reason(LockReason::Manual).await;
    }

    /// Lock with an explicit reason.  Returns `true` if the vault was
    /// unlocked before the call.
    pub async fn lock_with_reason(&self, reason: LockReason) -> bool {
        let _gate = self.gate.lock().await;
        self.lock_now(reason)
    }

    /// Lock only if `still_due` holds once the gate is taken.
    ///
    /// `still_due` runs after any in-flight mutation has finished, so a
    /// caller that decided to lock before waiting can re-check its reason.
    pub async fn lock_if<F>(&self, reason: LockReason, still_due: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let _gate = self.gate.lock().await;
        if !still_due() {
            debug!(%reason, "lock no longer due");
            return false;
        }
        self.lock_now(reason)
    }

    fn lock_now(&self, reason: LockReason) -> bool {
        let mut state = self.write_state();
        if !matches!(*state, VaultState::Unlocked(_)) {
            return false;
        }
        // Dropping the unlocked state zeroizes the key and every entry.
        *state = VaultState::Locked;
        drop(state);

        info!(%reason, "vault locked");
        self.notify(Event::VaultLocked {
            reason,
            timestamp: Utc::now(),
        });
        true
    }

    /// Delete the vault record and custom endpoints, returning to `NoVault`.
    ///
    /// The allow-list, history and settings are kept.  Once the record is
    /// removed the manager is in `NoVault` even if clearing the endpoints
    /// then fails; that failure is still returned.
    pub async fn reset(&self) -> Result<()> {
        let _gate = self.gate.lock().await;

        self.store.remove_vault().await?;
        // The record is gone: memory follows storage before anything else
        // can fail.
        let was_unlocked = {
            let mut state = self.write_state();
            let was = matches!(*state, VaultState::Unlocked(_));
            *state = VaultState::NoVault;
            was
        };

        let cleanup = self.store.remove_custom_endpoints().await;

        let now = Utc::now();
        if was_unlocked {
            self.notify(Event::VaultLocked {
                reason: LockReason::Reset,
                timestamp: now,
            });
        }
        warn!("vault reset");
        self.notify(Event::VaultReset { timestamp: now });
        cleanup
    }

    /// Rotate the master password.
    ///
    /// The old password is verified independently against the persisted
    /// record; on mismatch `Ok(false)` is returned and nothing changes.  On
    /// success the list is re-encrypted under a fresh salt and key and the
    /// vault stays unlocked under the new key.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<bool> {
        if new_password.is_empty() {
            return Err(VaultError::InvalidInput {
                reason: "master password must not be empty".into(),
            });
        }

        let _gate = self.gate.lock().await;

        if !self.is_unlocked() {
            return Err(VaultError::Locked);
        }

        let record = self
            .store
            .load_vault()
            .await?
            .ok_or(VaultError::NotInitialized)?;

        let Ok(old_salt) = crypto::decode(&record.salt) else {
            return Ok(false);
        };
        let old_key = match derive_blocking(old_password, Some(old_salt)).await {
            Ok((key, _)) => key,
            Err(VaultError::KeyDerivationFailed { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if open(&record, &old_key).is_none() {
            warn!("password change rejected");
            return Ok(false);
        }
        drop(old_key);

        let (new_key, new_salt) = derive_blocking(new_password, None).await?;

        let entries = match &*self.read_state() {
            VaultState::Unlocked(v) => v.entries.clone(),
            _ => return Err(VaultError::Locked),
        };
        let new_record = seal(&entries, &new_key, &new_salt, record.created_at, Utc::now())?;
        self.store.save_vault(&new_record).await?;

        // The previous key is dropped (and wiped) with the replaced state.
        *self.write_state() = VaultState::Unlocked(UnlockedVault {
            key: new_key,
            salt: new_salt,
            entries,
        });

        info!("master password changed");
        self.notify(Event::PasswordChanged {
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    // -- reads -------------------------------------------------------------

    /// A copy of every credential.
    pub fn list_credentials(&self) -> Result<Vec<CredentialEntry>> {
        match &*self.read_state() {
            VaultState::Unlocked(v) => Ok(v.entries.clone()),
            _ => Err(VaultError::Locked),
        }
    }

    /// Secret-free view of every credential.
    pub fn list_summaries(&self) -> Result<Vec<CredentialSummary>> {
        match &*self.read_state() {
            VaultState::Unlocked(v) => Ok(v.entries.iter().map(CredentialEntry::summary).collect()),
            _ => Err(VaultError::Locked),
        }
    }

    /// A copy of the first credential stored for `provider_id`.
    pub fn find_by_provider(&self, provider_id: &str) -> Result<Option<CredentialEntry>> {
        match &*self.read_state() {
            VaultState::Unlocked(v) => Ok(v
                .entries
                .iter()
                .find(|e| e.provider_id == provider_id)
                .cloned()),
            _ => Err(VaultError::Locked),
        }
    }

    // -- mutations ---------------------------------------------------------

    /// Add a credential and persist.  Returns the new credential id.
    pub async fn add_credential(&self, new: &NewCredential) -> Result<String> {
        let provider = provider::find_provider(&new.provider_id).ok_or_else(|| {
            VaultError::UnknownProvider {
                provider: new.provider_id.clone(),
            }
        })?;
        if new.secret_value.trim().is_empty() {
            return Err(VaultError::InvalidInput {
                reason: "secret must not be empty".into(),
            });
        }

        let now = Utc::now();
        let entry = CredentialEntry {
            id: uuid::Uuid::new_v4().to_string(),
            provider_id: provider.id.to_owned(),
            display_name: if new.display_name.trim().is_empty() {
                provider.display_name.to_owned()
            } else {
                new.display_name.clone()
            },
            secret_value: new.secret_value.clone(),
            endpoint_url: new.endpoint_url.clone().filter(|u| !u.trim().is_empty()),
            created_at: now,
            updated_at: now,
        };
        let id = entry.id.clone();

        self.commit(move |entries| {
            entries.push(entry);
            Some(())
        })
        .await?;

        info!(provider = provider.id, id = %id, "credential added");
        Ok(id)
    }

    /// Apply `update` to the credential `id` and persist.
    ///
    /// Returns `Ok(false)` if no credential has that id.
    pub async fn update_credential(&self, id: &str, update: &CredentialUpdate) -> Result<bool> {
        if update
            .secret_value
            .as_deref()
            .is_some_and(|s| s.trim().is_empty())
        {
            return Err(VaultError::InvalidInput {
                reason: "secret must not be empty".into(),
            });
        }

        let update = update.clone();
        let target = id.to_owned();
        let changed = self
            .commit(move |entries| {
                let entry = entries.iter_mut().find(|e| e.id == target)?;
                if let Some(name) = &update.display_name {
                    entry.display_name.clone_from(name);
                }
                if let Some(secret) = &update.secret_value {
                    entry.secret_value.clone_from(secret);
                }
                if let Some(endpoint) = &update.endpoint_url {
                    entry.endpoint_url.clone_from(endpoint);
                }
                entry.updated_at = Utc::now();
                Some(())
            })
            .await?;

        if changed.is_some() {
            info!(id, "credential updated");
        } else {
            debug!(id, "update of unknown credential");
        }
        Ok(changed.is_some())
    }

    /// Delete the credential `id` and persist.
    ///
    /// Returns `Ok(false)` if no credential has that id.
    pub async fn delete_credential(&self, id: &str) -> Result<bool> {
        let _gate = self.gate.lock().await;
        let target = id.to_owned();
        let removed = self
            .commit_locked(move |entries| {
                let pos = entries.iter().position(|e| e.id == target)?;
                entries.remove(pos);
                Some(())
            })
            .await?;

        if removed.is_none() {
            debug!(id, "delete of unknown credential");
            return Ok(false);
        }
        info!(id, "credential deleted");

        // The delete is already committed.
        if let Err(e) = self.drop_custom_endpoint(id).await {
            warn!(id, error = %e, "failed to remove custom endpoint of deleted credential");
        }
        Ok(true)
    }

    /// Point credential `id` at a custom endpoint URL.
    ///
    /// Returns `Ok(false)` if no credential has that id.
    pub async fn set_custom_endpoint(&self, id: &str, url: &str) -> Result<bool> {
        let parsed = url.trim();
        if !(parsed.starts_with("http://") || parsed.starts_with("https://")) {
            return Err(VaultError::InvalidInput {
                reason: format!("endpoint must be an http(s) URL: {parsed}"),
            });
        }

        let _gate = self.gate.lock().await;
        if !self.has_credential(id)? {
            return Ok(false);
        }

        let mut endpoints = self.store.custom_endpoints().await?;
        endpoints.insert(id.to_owned(), parsed.to_owned());
        self.store.save_custom_endpoints(&endpoints).await?;
        info!(id, "custom endpoint set");
        Ok(true)
    }

    /// Remove the custom endpoint of credential `id`.  Returns `true` if one
    /// was set.
    pub async fn remove_custom_endpoint(&self, id: &str) -> Result<bool> {
        let _gate = self.gate.lock().await;
        let removed = self.drop_custom_endpoint(id).await?;
        if removed {
            info!(id, "custom endpoint removed");
        }
        Ok(removed)
    }

    /// Custom endpoint of credential `id`, if any.
    pub async fn custom_endpoint(&self, id: &str) -> Result<Option<String>> {
        Ok(self.store.custom_endpoints().await?.remove(id))
    }

    /// All custom endpoints keyed by credential id.
    pub async fn custom_endpoints(&self) -> Result<HashMap<String, String>> {
        self.store.custom_endpoints().await
    }

    // -- internals ---------------------------------------------------------

    fn has_credential(&self, id: &str) -> Result<bool> {
        match &*self.read_state() {
            VaultState::Unlocked(v) => Ok(v.entries.iter().any(|e| e.id == id)),
            _ => Err(VaultError::Locked),
        }
    }

    /// Remove `id` from the stored endpoint map.  Caller holds the gate.
    async fn drop_custom_endpoint(&self, id: &str) -> Result<bool> {
        let mut endpoints = self.store.custom_endpoints().await?;
        if endpoints.remove(id).is_none() {
            return Ok(false);
        }
        self.store.save_custom_endpoints(&endpoints).await?;
        Ok(true)
    }

    /// Run a transactional mutation.
    ///
    /// `mutate` edits a copy of the list and returns `None` to abort without
    /// writing (e.g. unknown id).  The copy is sealed against the latest
    /// persisted record and only committed after the write succeeds.
    async fn commit<F>(&self, mutate: F) -> Result<Option<()>>
    where
        F: FnOnce(&mut Vec<CredentialEntry>) -> Option<()>,
    {
        let _gate = self.gate.lock().await;
        self.commit_locked(mutate).await
    }

    /// [`Self::commit`] for callers that already hold the gate.
    async fn commit_locked<F>(&self, mutate: F) -> Result<Option<()>>
    where
        F: FnOnce(&mut Vec<CredentialEntry>) -> Option<()>,
    {
        let latest = self
            .store
            .load_vault()
            .await?
            .ok_or(VaultError::NotInitialized)?;

        let (record, next) = {
            let state = self.read_state();
            let VaultState::Unlocked(vault) = &*state else {
                return Err(VaultError::Locked);
            };
            if crypto::decode(&latest.salt)?.as_slice() != vault.salt.as_slice() {
                warn!("persisted vault was re-keyed since unlock");
                return Err(VaultError::KeyMismatch);
            }

            let mut next = vault.entries.clone();
            if mutate(&mut next).is_none() {
                return Ok(None);
            }
            let record = seal(&next, &vault.key, &vault.salt, latest.created_at, Utc::now())?;
            (record, next)
        };

        if let Err(e) = self.store.save_vault(&record).await {
            warn!(error = %e, "failed to persist vault; change discarded");
            return Err(e);
        }

        let count = next.len();
        if let VaultState::Unlocked(vault) = &mut *self.write_state() {
            vault.entries = next;
        }

        self.notify(Event::CredentialsChanged {
            count,
            timestamp: Utc::now(),
        });
        Ok(Some(()))
    }

    fn notify(&self, event: Event) {
        if let Err(e) = self.bus.publish(event) {
            warn!(error = %e, "failed to publish vault event");
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, VaultState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, VaultState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run PBKDF2 on the blocking pool.
async fn derive_blocking(
    password: &str,
    salt: Option<Vec<u8>>,
) -> Result<(DerivedKey, [u8; SALT_LEN])> {
    let password = Zeroizing::new(password.to_owned());
    tokio::task::spawn_blocking(move || crypto::derive_key(password.as_bytes(), salt.as_deref()))
        .await?
}

/// Serialize and encrypt `entries` into a fresh record.
fn seal(
    entries: &[CredentialEntry],
    key: &DerivedKey,
    salt: &[u8; SALT_LEN],
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
) -> Result<VaultRecord> {
    let plaintext = Zeroizing::new(serde_json::to_vec(entries)?);
    let (ciphertext, nonce) = crypto::encrypt(&plaintext, key)?;
    Ok(VaultRecord {
        ciphertext: crypto::encode(&ciphertext),
        salt: crypto::encode(salt),
        nonce: crypto::encode(&nonce),
        created_at,
        updated_at,
    })
}

/// Decrypt and parse a record.  Any failure yields `None`.
fn open(record: &VaultRecord, key: &DerivedKey) -> Option<Vec<CredentialEntry>> {
    let ciphertext = crypto::decode(&record.ciphertext).ok()?;
    let nonce = crypto::decode(&record.nonce).ok()?;
    let plaintext = crypto::decrypt(&ciphertext, key, &nonce).ok()?;
    serde_json::from_slice(&plaintext).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
