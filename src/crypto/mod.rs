//! Cryptographic primitives for the vault subsystem.
//!
//! # Module Structure
//!
//! - `kdf`: Argon2id key derivation with purpose separation
//! - `memory`: zeroing and pinning of key-bearing buffers
//! - `aead`: XChaCha20-Poly1305 sealing of records and wrapped data keys
//!
//! Callers outside the crate go through [`crate::session::SessionManager`] or
//! [`crate::service::VaultService`]; nothing in the presentation layer should
//! derive or scrub keys itself.

pub mod aead;
pub mod kdf;
pub mod memory;

pub use self::aead::{open_sealed, DataKey, SealedRecord};
pub use self::kdf::{KdfParams, KeyDerivationService, MasterKey, Salt};
pub use self::memory::{scrub, KeyBuffer};
