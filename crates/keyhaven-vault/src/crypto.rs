//! Password-based key derivation and AES-256-GCM using the `ring` crate.
//!
//! - **Key derivation**: PBKDF2-HMAC-SHA256, 310,000 iterations, 16-byte
//!   random salt, 32-byte output.
//! - **Encryption/decryption**: AES-256-GCM with a fresh random 96-bit nonce
//!   for every call.  Any tampering is reported as
//!   [`VaultError::AuthenticationFailed`].
//! - **Secret holders**: [`DerivedKey`] zeroes itself on drop; decrypted
//!   plaintext is returned as [`Zeroizing`] bytes.
//! - **Encoding**: base64 helpers for the persisted record fields.

use std::num::NonZeroU32;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Result, VaultError};

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// Length of the PBKDF2 salt in bytes.
pub const SALT_LEN: usize = 16;

/// PBKDF2 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 310_000;

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;
static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

// ---------------------------------------------------------------------------
// Secret holder
// ---------------------------------------------------------------------------

/// A 256-bit symmetric key that is wiped when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Overwrite a buffer with zeros.
pub fn zeroize(buffer: &mut [u8]) {
    buffer.zeroize();
}

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A nonce sequence that yields exactly one nonce.
///
/// Every sealing/opening key is built for a single operation, so a fresh
/// random nonce is bound to exactly one encryption.
struct SingleNonce(Option<[u8; NONCE_LEN_BYTES]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Derive a 256-bit key from `password`.
///
/// With `salt = None` a fresh random 16-byte salt is generated.  The salt is
/// returned alongside the key and must be persisted to re-derive it later.
/// Deterministic for a given password and salt.
///
/// This is deliberately slow (hundreds of milliseconds); async callers
/// should run it under `spawn_blocking`.
///
/// # Errors
///
/// Returns [`VaultError::KeyDerivationFailed`] if the supplied salt has the
/// wrong length or the system random source fails.
pub fn derive_key(password: &[u8], salt: Option<&[u8]>) -> Result<(DerivedKey, [u8; SALT_LEN])> {
    let salt: [u8; SALT_LEN] = match salt {
        Some(s) => s.try_into().map_err(|_| VaultError::KeyDerivationFailed {
            reason: format!("salt must be {SALT_LEN} bytes, got {}", s.len()),
        })?,
        None => {
            let mut fresh = [0u8; SALT_LEN];
            SystemRandom::new()
                .fill(&mut fresh)
                .map_err(|_| VaultError::KeyDerivationFailed {
                    reason: "failed to generate random salt".into(),
                })?;
            fresh
        }
    };

    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).ok_or_else(|| {
        VaultError::KeyDerivationFailed {
            reason: "iteration count must be non-zero".into(),
        }
    })?;

    let mut out = [0u8; KEY_LEN];
    pbkdf2::derive(PBKDF2_ALG, iterations, &salt, password, &mut out);
    let key = DerivedKey::from_bytes(out);
    out.zeroize();

    tracing::trace!("derived vault key via PBKDF2");
    Ok((key, salt))
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` under `key`.
///
/// Returns `(ciphertext, nonce)`.  The ciphertext carries the 128-bit GCM tag
/// appended by `ring`; the nonce is freshly random for this call.
///
/// # Errors
///
/// Returns [`VaultError::EncryptionFailed`] if the random source or `ring`
/// fails.
pub fn encrypt(plaintext: &[u8], key: &DerivedKey) -> Result<(Vec<u8>, [u8; NONCE_LEN_BYTES])> {
    let mut nonce_bytes = [0u8; NONCE_LEN_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to generate random nonce".into(),
        })?;

    let unbound = UnboundKey::new(AEAD_ALG, key.as_bytes()).map_err(|_| {
        VaultError::EncryptionFailed {
            reason: "failed to create AES-256-GCM key".into(),
        }
    })?;
    let mut sealing_key = SealingKey::new(unbound, SingleNonce(Some(nonce_bytes)));

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "seal_in_place failed".into(),
        })?;

    tracing::trace!(
        plaintext_len = plaintext.len(),
        ciphertext_len = in_out.len(),
        "encrypted data"
    );

    Ok((in_out, nonce_bytes))
}

/// Decrypt `ciphertext` (including its GCM tag) under `key` and `nonce`.
///
/// # Errors
///
/// Returns [`VaultError::AuthenticationFailed`] for a wrong key, tampered
/// ciphertext, or a malformed nonce.  The cases are not distinguished.
pub fn decrypt(ciphertext: &[u8], key: &DerivedKey, nonce: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let nonce: [u8; NONCE_LEN_BYTES] = nonce
        .try_into()
        .map_err(|_| VaultError::AuthenticationFailed)?;

    let unbound =
        UnboundKey::new(AEAD_ALG, key.as_bytes()).map_err(|_| VaultError::AuthenticationFailed)?;
    let mut opening_key = aead::OpeningKey::new(unbound, SingleNonce(Some(nonce)));

    let mut in_out = Zeroizing::new(ciphertext.to_vec());
    let plaintext_len = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::AuthenticationFailed)?
        .len();
    in_out.truncate(plaintext_len);

    tracing::trace!(
        ciphertext_len = ciphertext.len(),
        plaintext_len,
        "decrypted data"
    );

    Ok(in_out)
}

// ---------------------------------------------------------------------------
// Encoding and randomness
// ---------------------------------------------------------------------------

/// Encode bytes as standard base64.
pub fn encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode standard base64.
///
/// # Errors
///
/// Returns [`VaultError::Encoding`] if `text` is not valid base64.
pub fn decode(text: &str) -> Result<Vec<u8>> {
    BASE64.decode(text).map_err(|e| VaultError::Encoding {
        reason: e.to_string(),
    })
}

/// Generate `len` cryptographically secure random bytes.
///
/// # Errors
///
/// Returns [`VaultError::Internal`] if the system CSPRNG fails.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| VaultError::Internal("failed to generate random bytes".into()))?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
