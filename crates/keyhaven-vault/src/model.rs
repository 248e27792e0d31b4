//! Data model shared by the vault, the store and the broker.
//!
//! Persisted shapes serialize with camelCase field names so a record written
//! by one host can be read by any other.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Vault record
// ---------------------------------------------------------------------------

/// The only persisted form of the credential list.
///
/// `ciphertext`, `salt` and `nonce` are base64 and are always written
/// together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultRecord {
    pub ciphertext: String,
    pub salt: String,
    pub nonce: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Coarse lock state of the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultStatus {
    NoVault,
    Locked,
    Unlocked,
}

impl fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoVault => "not initialized",
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// One stored API credential.  Wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct CredentialEntry {
    pub id: String,
    pub provider_id: String,
    pub display_name: String,
    pub secret_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
    #[zeroize(skip)]
    pub updated_at: DateTime<Utc>,
}

impl CredentialEntry {
    /// Display-safe view without the secret.
    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            id: self.id.clone(),
            provider_id: self.provider_id.clone(),
            display_name: self.display_name.clone(),
            endpoint_url: self.endpoint_url.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl fmt::Debug for CredentialEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialEntry")
            .field("id", &self.id)
            .field("provider_id", &self.provider_id)
            .field("display_name", &self.display_name)
            .field("secret_value", &"<redacted>")
            .field("endpoint_url", &self.endpoint_url)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Credential metadata without the secret, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub id: String,
    pub provider_id: String,
    pub display_name: String,
    pub endpoint_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for adding a credential.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct NewCredential {
    pub provider_id: String,
    /// Defaults to the provider's display name when empty.
    pub display_name: String,
    pub secret_value: String,
    pub endpoint_url: Option<String>,
}

impl NewCredential {
    pub fn new(provider_id: impl Into<String>, secret_value: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            display_name: String::new(),
            secret_value: secret_value.into(),
            endpoint_url: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }
}

/// Partial update of a credential.  `None` leaves a field unchanged;
/// `endpoint_url: Some(None)` clears the stored endpoint.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct CredentialUpdate {
    pub display_name: Option<String>,
    pub secret_value: Option<String>,
    pub endpoint_url: Option<Option<String>>,
}

impl CredentialUpdate {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.secret_value.is_none() && self.endpoint_url.is_none()
    }
}

// ---------------------------------------------------------------------------
// Allow-list, history, settings
// ---------------------------------------------------------------------------

/// An origin hostname permitted to use the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainAllowEntry {
    pub domain: String,
    pub added_at: DateTime<Utc>,
}

/// Metadata about one brokered call.  Never carries bodies or secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub provider_id: String,
    pub endpoint_path: String,
    pub caller_domain: String,
    /// Upstream status, or 0 when the transport failed.
    pub http_status: u16,
    pub duration_ms: u64,
}

/// Runtime settings persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Minutes of inactivity before auto-lock; 0 disables it.
    pub auto_lock_minutes: u32,
    pub history_enabled: bool,
    pub max_history_entries: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_lock_minutes: 15,
            history_enabled: true,
            max_history_entries: 500,
        }
    }
}
