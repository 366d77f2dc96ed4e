//! Passphrase-based key derivation using Argon2id.
//!
//! Keys are derived from `(passphrase, salt, purpose)`. The purpose label is
//! folded into the Argon2 password input, length-prefixed so that no two
//! `(purpose, passphrase)` pairs share an encoding. Two stores opened with the
//! same passphrase therefore get unrelated keys even if their salts collided.
//!
//! Derivation is deliberately expensive (hundreds of milliseconds at the
//! default cost) and blocking.

use crate::constants::{
    DEFAULT_KDF_ITERATIONS, DEFAULT_KDF_MEMORY_KIB, DEFAULT_KDF_PARALLELISM, KEY_LEN, MIN_SALT_LEN,
    REDACTED_PLACEHOLDER, SALT_LEN,
};
use crate::crypto::memory::KeyBuffer;
use crate::errors::{AppResult, CryptoError};
use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use tracing::debug;
use zeroize::Zeroizing;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Number of lanes
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: DEFAULT_KDF_MEMORY_KIB,
            iterations: DEFAULT_KDF_ITERATIONS,
            parallelism: DEFAULT_KDF_PARALLELISM,
        }
    }
}

impl KdfParams {
    /// Creates a parameter set, validating it against Argon2's limits.
    ///
    /// # Example
    ///
    /// ```
    /// use cloister::crypto::KdfParams;
    ///
    /// assert!(KdfParams::new(64 * 1024, 3, 4).is_ok());
    /// assert!(KdfParams::new(0, 3, 4).is_err());
    /// ```
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> AppResult<Self> {
        let params = Self {
            memory_kib,
            iterations,
            parallelism,
        };
        params.argon2_params()?;
        Ok(params)
    }

    fn argon2_params(&self) -> AppResult<Params> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| CryptoError::KeyDerivation(format!("invalid Argon2 parameters: {}", e)).into())
    }
}

/// Non-secret per-store random salt.
#[derive(Clone, PartialEq, Eq)]
pub struct Salt(Vec<u8>);

impl Salt {
    /// Generates a fresh random salt of [`SALT_LEN`] bytes.
    pub fn generate() -> AppResult<Self> {
        let mut bytes = vec![0u8; SALT_LEN];
        getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Random(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Wraps persisted salt bytes, rejecting anything shorter than [`MIN_SALT_LEN`].
    pub fn from_bytes(bytes: Vec<u8>) -> AppResult<Self> {
        if bytes.len() < MIN_SALT_LEN {
            return Err(CryptoError::InvalidSalt {
                min: MIN_SALT_LEN,
                actual: bytes.len(),
            }
            .into());
        }
        Ok(Self(bytes))
    }

    /// The raw salt bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({} bytes)", self.0.len())
    }
}

/// A 256-bit key derived from a passphrase. Wraps the store's data key.
#[derive(Default)]
pub struct MasterKey(KeyBuffer);

impl MasterKey {
    /// An empty (all-zero) key slot to derive into.
    pub fn empty() -> Self {
        Self(KeyBuffer::new())
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &KeyBuffer {
        &self.0
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut KeyBuffer {
        &mut self.0
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

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MasterKey").field(&REDACTED_PLACEHOLDER).finish()
    }
}

/// Turns passphrases into store master keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyDerivationService {
    params: KdfParams,
}

impl KeyDerivationService {
    /// Creates a service using the given cost parameters.
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    /// The configured cost parameters.
    pub fn params(&self) -> KdfParams {
        self.params
    }

    /// Derives the master key for `purpose` into a freshly pinned buffer.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EmptyPassphrase` or `CryptoError::InvalidSalt` for
    /// malformed input. A *wrong* passphrase is not detected here.
    ///
    /// # Example
    ///
    /// ```
    /// use cloister::crypto::{KdfParams, KeyDerivationService, Salt};
    /// use secrecy::SecretString;
    ///
    /// let kdf = KeyDerivationService::new(KdfParams::new(64, 1, 1)?);
    /// let salt = Salt::generate()?;
    /// let passphrase = SecretString::from("correct horse".to_string());
    ///
    /// let library = kdf.derive(&passphrase, &salt, "library")?;
    /// let vault = kdf.derive(&passphrase, &salt, "vault")?;
    /// assert_ne!(library, vault);
    /// # Ok::<(), cloister::AppError>(())
    /// ```
    pub fn derive(
        &self,
        passphrase: &SecretString,
        salt: &Salt,
        purpose: &str,
    ) -> AppResult<MasterKey> {
        let mut key = MasterKey::empty();
        self.derive_into(passphrase, salt, purpose, &mut key)?;
        Ok(key)
    }

    /// Derives directly into `out`, so no unpinned copy of the key exists.
    ///
    /// On error `out` is left zeroed.
    pub fn derive_into(
        &self,
        passphrase: &SecretString,
        salt: &Salt,
        purpose: &str,
        out: &mut MasterKey,
    ) -> AppResult<()> {
        let secret = passphrase.expose_secret();
        if secret.is_empty() {
            return Err(CryptoError::EmptyPassphrase.into());
        }
        if salt.as_bytes().len() < MIN_SALT_LEN {
            return Err(CryptoError::InvalidSalt {
                min: MIN_SALT_LEN,
                actual: salt.as_bytes().len(),
            }
            .into());
        }

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.argon2_params()?);
        let input = domain_separated_input(purpose, secret.as_bytes());

        debug!(
            purpose,
            memory_kib = self.params.memory_kib,
            iterations = self.params.iterations,
            "Deriving master key"
        );

        let buffer = out.buffer_mut();
        if let Err(e) = argon2.hash_password_into(&input, salt.as_bytes(), buffer.as_mut_bytes()) {
            buffer.scrub();
            return Err(CryptoError::KeyDerivation(e.to_string()).into());
        }
        Ok(())
    }
}

/// `len(purpose) as u32 LE || purpose || passphrase`, zeroized on drop.
fn domain_separated_input(purpose: &str, passphrase: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut input = Zeroizing::new(Vec::with_capacity(4 + purpose.len() + passphrase.len()));
    input.extend_from_slice(&(purpose.len() as u32).to_le_bytes());
    input.extend_from_slice(purpose.as_bytes());
    input.extend_from_slice(passphrase);
    input
}
