//! Authenticated encryption of records and key slots.
//!
//! Everything at rest is sealed with XChaCha20-Poly1305 under a random 192-bit
//! nonce. The associated data binds each ciphertext to where it belongs (record
//! id and key version, canary version, key slot version and purpose) so that
//! swapping rows between positions or versions fails authentication.

use crate::constants::{KEY_LEN, REDACTED_PLACEHOLDER};
use crate::crypto::kdf::MasterKey;
use crate::crypto::memory::KeyBuffer;
use crate::errors::{AppResult, CryptoError};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use std::fmt;
use zeroize::Zeroizing;

/// XChaCha20-Poly1305 nonce length in bytes.
pub const NONCE_LEN: usize = 24;

/// Random key that encrypts a store's records for one key version.
///
/// Only ever persisted wrapped under the store's [`MasterKey`].
#[derive(Default)]
pub struct DataKey(KeyBuffer);

impl DataKey {
    /// An empty (all-zero) key slot to unwrap into.
    pub fn empty() -> Self {
        Self(KeyBuffer::new())
    }

    /// A fresh random key.
    pub fn generate() -> AppResult<Self> {
        let mut key = Self::empty();
        key.0
            .randomize()
            .map_err(|e| CryptoError::Random(e.to_string()))?;
        Ok(key)
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &KeyBuffer {
        &self.0
    }

    /// Replaces this key with `other`, scrubbing the previous contents first.
    pub fn replace_with(&mut self, other: &DataKey) {
        self.0.copy_from(&other.0);
    }

    /// Zeroes the key in place.
    pub fn scrub(&mut self) {
        self.0.scrub();
    }

    /// Returns `true` when the key buffer holds only zeros.
    pub fn is_zeroed(&self) -> bool {
        self.0.is_zeroed()
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DataKey").field(&REDACTED_PLACEHOLDER).finish()
    }
}

/// Raw ciphertext of one record as persisted. Not secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedRecord {
    /// Record identifier
    pub id: String,
    /// Key version the record was sealed under
    pub key_version: u64,
    /// Nonce used for sealing
    pub nonce: Vec<u8>,
    /// Ciphertext including the Poly1305 tag
    pub ciphertext: Vec<u8>,
}

/// Associated data for a content record.
pub fn record_aad(id: &str, key_version: u64) -> Vec<u8> {
    let mut aad = b"record\0".to_vec();
    aad.extend_from_slice(&key_version.to_le_bytes());
    aad.extend_from_slice(id.as_bytes());
    aad
}

/// Associated data for the canary record.
pub fn canary_aad(key_version: u64) -> Vec<u8> {
    let mut aad = b"canary\0".to_vec();
    aad.extend_from_slice(&key_version.to_le_bytes());
    aad
}

/// Associated data for a wrapped data key.
pub fn slot_aad(purpose: &str, key_version: u64) -> Vec<u8> {
    let mut aad = b"keyslot\0".to_vec();
    aad.extend_from_slice(purpose.as_bytes());
    aad.push(0);
    aad.extend_from_slice(&key_version.to_le_bytes());
    aad
}

fn cipher(key: &KeyBuffer) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}

/// Seals `plaintext`, returning `(nonce, ciphertext)`.
pub fn seal(key: &KeyBuffer, aad: &[u8], plaintext: &[u8]) -> AppResult<(Vec<u8>, Vec<u8>)> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|e| CryptoError::Random(e.to_string()))?;

    let ciphertext = cipher(key)
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed("AEAD seal failed".to_string()))?;

    Ok((nonce.to_vec(), ciphertext))
}

/// Opens a ciphertext sealed by [`seal`]. `what` names the object in errors.
pub fn open(
    key: &KeyBuffer,
    aad: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    what: &str,
) -> AppResult<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::DecryptionFailed {
            what: format!("{} (bad nonce length {})", what, nonce.len()),
        }
        .into());
    }

    cipher(key)
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| {
            CryptoError::DecryptionFailed {
                what: what.to_string(),
            }
            .into()
        })
}

/// Decrypts a raw record snapshot with `key`.
pub fn open_sealed(key: &DataKey, record: &SealedRecord) -> AppResult<Vec<u8>> {
    let plaintext = open(
        key.buffer(),
        &record_aad(&record.id, record.key_version),
        &record.nonce,
        &record.ciphertext,
        "record",
    )?;
    Ok(plaintext.to_vec())
}

/// Wraps `data` under `master`, returning `(nonce, wrapped)`.
pub fn wrap_key(
    master: &MasterKey,
    purpose: &str,
    key_version: u64,
    data: &DataKey,
) -> AppResult<(Vec<u8>, Vec<u8>)> {
    seal(
        master.buffer(),
        &slot_aad(purpose, key_version),
        data.buffer().as_bytes(),
    )
}

/// Unwraps a key slot into `out`.
///
/// # Errors
///
/// Authentication failure means the master key is wrong and is reported as
/// `CryptoError::WrongPassphrase`.
pub fn unwrap_key_into(
    master: &MasterKey,
    purpose: &str,
    key_version: u64,
    nonce: &[u8],
    wrapped: &[u8],
    out: &mut DataKey,
) -> AppResult<()> {
    let plaintext = open(
        master.buffer(),
        &slot_aad(purpose, key_version),
        nonce,
        wrapped,
        "key slot",
    )
    .map_err(|_| CryptoError::WrongPassphrase)?;

    if plaintext.len() != KEY_LEN {
        return Err(CryptoError::DecryptionFailed {
            what: "key slot (unexpected length)".to_string(),
        }
        .into());
    }
    out.scrub();
    out.0.as_mut_bytes().copy_from_slice(&plaintext);
    Ok(())
}
