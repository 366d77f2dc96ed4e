//! Error handling utilities for the cloister vault subsystem.
//!
//! This module provides the central error type `AppError` which represents all
//! possible error conditions surfaced at the vault boundary, as well as the
//! convenience type alias `AppResult` for functions that can return these errors.
//!
//! Every security-relevant failure has its own typed variant so callers can
//! react to it (re-prompt, wait out a lockout, resume a re-key) without
//! inspecting message strings.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::deletion::DeletionStep;
use crate::store::StoreKind;

/// Represents specific error cases that can occur during cryptographic operations.
///
/// # Examples
///
/// ```
/// use cloister::errors::CryptoError;
///
/// let error = CryptoError::WrongPassphrase;
/// let message = format!("{}", error);
/// assert!(message.contains("passphrase"));
/// ```
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Authentication-tag mismatch while unwrapping the store key.
    #[error("Incorrect passphrase. The store key could not be authenticated.")]
    WrongPassphrase,

    /// An empty passphrase was supplied.
    #[error("Passphrase cannot be empty")]
    EmptyPassphrase,

    /// The passphrase confirmation did not match.
    #[error("Passphrases do not match")]
    PassphraseMismatch,

    /// Reading a passphrase from the terminal failed.
    #[error("Failed to read passphrase: {0}")]
    PassphrasePrompt(String),

    /// The salt is shorter than the minimum accepted length.
    #[error("Salt must be at least {min} bytes, got {actual}")]
    InvalidSalt {
        /// Minimum accepted salt length
        min: usize,
        /// Length that was supplied
        actual: usize,
    },

    /// The key derivation function rejected its parameters.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Sealing a record failed.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// A record failed authentication under the current key.
    #[error("Decryption failed for {what}: ciphertext could not be authenticated")]
    DecryptionFailed {
        /// What was being decrypted (record reference, canary, key slot)
        what: String,
    },

    /// The operating system random source failed.
    #[error("Random number generation failed: {0}")]
    Random(String),
}

/// Session lifecycle errors.
///
/// # Examples
///
/// ```
/// use cloister::errors::SessionError;
/// use std::time::Duration;
///
/// let error = SessionError::LockedOut { remaining: Duration::from_secs(90) };
/// assert!(format!("{}", error).contains("90"));
/// ```
#[derive(Debug, Error)]
pub enum SessionError {
    /// The store is locked and must be unlocked first.
    #[error("Store is locked. Unlock it with your passphrase to continue.")]
    Locked,

    /// Too many failed unlock attempts; all operations are refused until the
    /// lockout elapses.
    #[error("Too many failed unlock attempts. Try again in {} seconds.", remaining.as_secs())]
    LockedOut {
        /// Time left until the lockout elapses
        remaining: Duration,
    },

    /// The idle timer lapsed between the check and the use.
    #[error("Session expired. Unlock the store again to continue.")]
    SessionExpired,

    /// The session is already unlocked.
    #[error("Store is already unlocked")]
    AlreadyUnlocked,
}

/// Errors raised by the encrypted store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A re-key was interrupted; only the resume path is available.
    #[error("A re-key of this store was interrupted (version {from} -> {to}). Resume it before normal access.")]
    InterruptedRekey {
        /// Key version the migration started from
        from: u64,
        /// Key version the migration is moving to
        to: u64,
    },

    /// `resume_rekey` was called but no re-key is pending.
    #[error("No interrupted re-key to resume")]
    NoRekeyPending,

    /// The store has no salt or key slot yet.
    #[error("Store '{0}' has not been initialized")]
    NotInitialized(StoreKind),

    /// `initialize` was called on an initialized store.
    #[error("Store '{0}' is already initialized")]
    AlreadyInitialized(StoreKind),

    /// The store file was created for a different purpose label.
    #[error("Store purpose mismatch: expected '{expected}', found '{found}'")]
    PurposeMismatch {
        /// Purpose expected by the caller
        expected: String,
        /// Purpose recorded in the store
        found: String,
    },

    /// Another process holds the store directory lock.
    #[error("Store at {path} is in use by another process")]
    Busy {
        /// Directory that is locked
        path: PathBuf,
    },

    /// A record id was empty or otherwise unusable.
    #[error("Invalid record id: {0}")]
    InvalidRecordId(String),

    /// The store moved to a newer key version than the caller holds.
    #[error("Key version {held} is stale, store is at version {current}")]
    StaleKey {
        /// Version the caller's data key belongs to
        held: u64,
        /// Version recorded in the store
        current: u64,
    },

    /// The persisted layout is inconsistent.
    #[error("Store is corrupt: {0}")]
    Corrupt(String),
}

/// Errors raised by the secure deletion service.
#[derive(Debug, Error)]
pub enum DeletionError {
    /// A cascade step failed; the whole transaction was rolled back.
    #[error("Deletion failed at the {step} step; all layers were rolled back: {reason}")]
    PartialDeletionFailure {
        /// Step that failed
        step: DeletionStep,
        /// Description of the underlying failure
        reason: String,
    },

    /// None of the requested targets exist.
    #[error("Nothing to delete: target not found")]
    TargetNotFound,

    /// The request named no targets.
    #[error("Deletion request has no targets")]
    EmptyRequest,
}

/// Errors raised by the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The hash chain does not verify; further vault writes are refused.
    #[error("Audit chain tamper detected at sequence {sequence}. Writes are refused pending investigation.")]
    ChainTamperDetected {
        /// First sequence number at which the chain diverges
        sequence: u64,
    },

    /// Audit is disabled for this store.
    #[error("Audit logging is disabled for this store")]
    Disabled,

    /// Building the export archive failed.
    #[error("Audit export failed: {0}")]
    Export(String),
}

/// Represents specific error cases that can occur during database operations.
///
/// # Examples
///
/// ```
/// use cloister::errors::DatabaseError;
///
/// let error = DatabaseError::NotFound("record 123".to_string());
/// assert!(format!("{}", error).contains("not found"));
/// ```
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLite database error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("Failed to get connection from pool: {0}")]
    Pool(#[from] r2d2::Error),

    /// Requested record not found in the database.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Serializing or parsing a persisted value failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Represents all possible errors surfaced at the vault boundary.
///
/// # Examples
///
/// Creating a configuration error:
/// ```
/// use cloister::errors::AppError;
///
/// let error = AppError::Config("vault audit cannot be disabled".to_string());
/// assert_eq!(format!("{}", error), "Configuration error: vault audit cannot be disabled");
/// ```
///
/// Converting from an IO error:
/// ```
/// use cloister::errors::AppError;
/// use std::io::{self, ErrorKind};
///
/// let io_error = io::Error::new(ErrorKind::NotFound, "file not found");
/// let app_error: AppError = io_error.into();
///
/// match app_error {
///     AppError::Io(inner) => assert_eq!(inner.kind(), ErrorKind::NotFound),
///     _ => panic!("Expected Io variant"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum AppError {
    /// Errors related to configuration loading or validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input/output errors from filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to cryptographic operations.
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Errors related to the session lifecycle.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Errors related to the encrypted store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Errors related to secure deletion.
    #[error("Deletion error: {0}")]
    Deletion(#[from] DeletionError),

    /// Errors related to the audit log.
    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    /// Errors related to database operations.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(DatabaseError::Sqlite(err))
    }
}

impl From<r2d2::Error> for AppError {
    fn from(err: r2d2::Error) -> Self {
        AppError::Database(DatabaseError::Pool(err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Database(DatabaseError::Serialization(err))
    }
}

impl AppError {
    /// Returns `true` if this error is a wrong-passphrase authentication failure.
    pub fn is_wrong_passphrase(&self) -> bool {
        matches!(self, AppError::Crypto(CryptoError::WrongPassphrase))
    }

    /// Returns `true` if this error reports an interrupted re-key.
    pub fn is_interrupted_rekey(&self) -> bool {
        matches!(self, AppError::Store(StoreError::InterruptedRekey { .. }))
    }

    /// Short stable label used in audit details and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Crypto(CryptoError::WrongPassphrase) => "wrong_passphrase",
            AppError::Crypto(_) => "crypto",
            AppError::Session(SessionError::LockedOut { .. }) => "locked_out",
            AppError::Session(SessionError::SessionExpired) => "session_expired",
            AppError::Session(SessionError::Locked) => "locked",
            AppError::Session(_) => "session",
            AppError::Store(StoreError::InterruptedRekey { .. }) => "interrupted_rekey",
            AppError::Store(StoreError::StaleKey { .. }) => "stale_key",
            AppError::Store(_) => "store",
            AppError::Deletion(DeletionError::PartialDeletionFailure { .. }) => {
                "partial_deletion_failure"
            }
            AppError::Deletion(DeletionError::TargetNotFound) => "not_found",
            AppError::Deletion(_) => "deletion",
            AppError::Audit(AuditError::ChainTamperDetected { .. }) => "audit_tamper",
            AppError::Audit(_) => "audit",
            AppError::Database(_) => "database",
        }
    }
}

/// A type alias for `Result<T, AppError>` to simplify function signatures.
///
/// # Examples
///
/// ```
/// use cloister::errors::{AppError, AppResult};
///
/// fn might_fail(flag: bool) -> AppResult<&'static str> {
///     if flag {
///         return Err(AppError::Config("bad setting".to_string()));
///     }
///     Ok("ok")
/// }
/// assert!(might_fail(true).is_err());
/// ```
pub type AppResult<T> = Result<T, AppError>;
