//! Key-value persistence for everything Keyhaven stores.
//!
//! [`KvBackend`] is the narrow get/set/remove capability a host must supply.
//! Two backends ship with the crate:
//!
//! - [`SqliteBackend`] -- a single `kv` table in a WAL-mode SQLite file.
//!   Blocking calls run on `tokio::task::spawn_blocking`.
//! - [`MemoryBackend`] -- a `HashMap` behind a tokio `RwLock`, for tests and
//!   embedders that persist elsewhere.
//!
//! [`CredentialStore`] layers typed accessors for each storage key on top of
//! a backend.  It holds no business logic.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Result, VaultError};
use crate::model::{DomainAllowEntry, HistoryEntry, Settings, VaultRecord};

/// Storage key of the encrypted vault record.
pub const KEY_VAULT: &str = "vault";
/// Storage key of the origin allow-list.
pub const KEY_ALLOWED_DOMAINS: &str = "allowedDomains";
/// Storage key of the request history.
pub const KEY_REQUEST_HISTORY: &str = "requestHistory";
/// Storage key of the runtime settings.
pub const KEY_SETTINGS: &str = "settings";
/// Storage key of the credential-id to endpoint URL map.
pub const KEY_CUSTOM_ENDPOINTS: &str = "customEndpoints";

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// A minimal asynchronous JSON key-value store.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read a value, `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Insert or replace a value.
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Delete a key.  Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

/// SQLite-backed [`KvBackend`].
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) the store at `path` and ensure the schema exists.
    ///
    /// Blocks briefly on file I/O; call during startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening key-value store");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;
        Self::create_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        debug!("opening in-memory key-value store");

        let conn = Connection::open_in_memory()?;
        Self::create_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| VaultError::Internal(format!("store mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    fn apply_pragmas(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
        debug!("store pragmas applied (WAL, synchronous=NORMAL)");
        Ok(())
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY NOT NULL,
                value      TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }
}

#[async_trait]
impl KvBackend for SqliteBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_owned();
        let raw: Option<String> = self
            .execute(move |conn| {
                let v = conn
                    .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                        row.get(0)
                    })
                    .optional()?;
                Ok(v)
            })
            .await?;

        raw.map(|s| serde_json::from_str(&s).map_err(VaultError::from))
            .transpose()
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let key = key.to_owned();
        let text = serde_json::to_string(&value)?;
        let now = chrono::Utc::now().timestamp();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                params![key, text, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_owned();
        self.execute(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Memory backend
// ---------------------------------------------------------------------------

/// In-process [`KvBackend`].
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Typed facade
// ---------------------------------------------------------------------------

/// Typed access to the Keyhaven storage namespace.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn KvBackend>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// A store over a fresh [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// The raw backend, for hosts that need direct access.
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.backend.set(key, serde_json::to_value(value)?).await
    }

    // -- vault -------------------------------------------------------------

    pub async fn load_vault(&self) -> Result<Option<VaultRecord>> {
        self.read(KEY_VAULT).await
    }

    pub async fn save_vault(&self, record: &VaultRecord) -> Result<()> {
        self.write(KEY_VAULT, record).await
    }

    pub async fn remove_vault(&self) -> Result<()> {
        self.backend.remove(KEY_VAULT).await
    }

    // -- allow-list --------------------------------------------------------

    pub async fn allowed_domains(&self) -> Result<Vec<DomainAllowEntry>> {
        Ok(self.read(KEY_ALLOWED_DOMAINS).await?.unwrap_or_default())
    }

    pub async fn save_allowed_domains(&self, domains: &[DomainAllowEntry]) -> Result<()> {
        self.write(KEY_ALLOWED_DOMAINS, domains).await
    }

    // -- history -----------------------------------------------------------

    pub async fn history(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.read(KEY_REQUEST_HISTORY).await?.unwrap_or_default())
    }

    pub async fn save_history(&self, entries: &[HistoryEntry]) -> Result<()> {
        self.write(KEY_REQUEST_HISTORY, entries).await
    }

    // -- settings ----------------------------------------------------------

    /// Stored settings, or the defaults when none were saved.
    pub async fn settings(&self) -> Result<Settings> {
        Ok(self.read(KEY_SETTINGS).await?.unwrap_or_default())
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.write(KEY_SETTINGS, settings).await
    }

    // -- custom endpoints --------------------------------------------------

    pub async fn custom_endpoints(&self) -> Result<HashMap<String, String>> {
        Ok(self.read(KEY_CUSTOM_ENDPOINTS).await?.unwrap_or_default())
    }

    pub async fn save_custom_endpoints(&self, endpoints: &HashMap<String, String>) -> Result<()> {
        self.write(KEY_CUSTOM_ENDPOINTS, endpoints).await
    }

    pub async fn remove_custom_endpoints(&self) -> Result<()> {
        self.backend.remove(KEY_CUSTOM_ENDPOINTS).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
