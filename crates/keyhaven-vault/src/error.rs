//! Vault error types.
//!
//! All vault subsystems surface errors through [`VaultError`], the single
//! error type returned by every public API in this crate.
//!
//! [`VaultError::AuthenticationFailed`] is produced by the crypto layer but
//! never escapes [`crate::manager::VaultManager::unlock`] or
//! [`crate::manager::VaultManager::change_password`]: those flatten it to
//! `Ok(false)` so a wrong password and a damaged vault look identical.

/// Unified error type for the Keyhaven credential vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Crypto errors ------------------------------------------------------
    /// AEAD tag verification failed: wrong key or tampered data.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Encryption failed (random source failure, ring internal error).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Key derivation failed (bad salt length, random source failure).
    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    /// A persisted field was not valid base64.
    #[error("encoding error: {reason}")]
    Encoding { reason: String },

    // -- Lifecycle errors ---------------------------------------------------
    /// No vault record has been created yet.
    #[error("vault is not initialized")]
    NotInitialized,

    /// A vault record already exists.
    #[error("vault already exists")]
    AlreadyExists,

    /// The operation requires an unlocked vault.
    #[error("vault is locked")]
    Locked,

    /// The persisted vault was re-keyed by someone else since this process
    /// unlocked it.
    #[error("vault key changed since unlock; unlock again")]
    KeyMismatch,

    // -- Input errors -------------------------------------------------------
    /// The provider id does not name an entry of the provider table.
    #[error("unknown provider: {provider}")]
    UnknownProvider { provider: String },

    /// A caller-supplied value was rejected.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    // -- Underlying errors --------------------------------------------------
    /// SQLite error from `rusqlite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    /// Catch-all for unexpected internal errors.
    #[error("internal vault error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;
