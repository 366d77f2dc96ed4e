//! Constants used throughout the application.
//!
//! This module contains the defaults and fixed labels of the cloister vault
//! subsystem, organized into logical groups. Having constants centralized makes
//! them easier to find, modify, and reference consistently.

// Application Metadata
/// The name of the application.
pub const APP_NAME: &str = "cloister";
/// The description of the application used in CLI help text.
pub const APP_DESCRIPTION: &str = "Local encrypted data vault with sessions, secure deletion and audit";

// CLI Arguments & Defaults
/// Log format identifier for plain text.
pub const LOG_FORMAT_TEXT: &str = "text";
/// Log format identifier for JSON.
pub const LOG_FORMAT_JSON: &str = "json";
/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

// Configuration Keys & Environment Variables
/// Environment variable for the data directory holding both stores.
pub const ENV_VAR_CLOISTER_DIR: &str = "CLOISTER_DIR";
/// Environment variable for the library store idle timeout in seconds.
pub const ENV_VAR_LIBRARY_TIMEOUT: &str = "CLOISTER_LIBRARY_TIMEOUT_SECS";
/// Environment variable for the vault store idle timeout in seconds.
pub const ENV_VAR_VAULT_TIMEOUT: &str = "CLOISTER_VAULT_TIMEOUT_SECS";
/// Environment variable toggling the library store audit log ("true"/"false").
pub const ENV_VAR_LIBRARY_AUDIT: &str = "CLOISTER_LIBRARY_AUDIT";
/// Environment variable for the Argon2 memory cost in KiB.
pub const ENV_VAR_KDF_MEMORY_KIB: &str = "CLOISTER_KDF_MEMORY_KIB";
/// Environment variable for the Argon2 pass count.
pub const ENV_VAR_KDF_ITERATIONS: &str = "CLOISTER_KDF_ITERATIONS";
/// Environment variable for the Argon2 lane count.
pub const ENV_VAR_KDF_PARALLELISM: &str = "CLOISTER_KDF_PARALLELISM";
/// Environment variable for the failed-attempt lockout threshold.
pub const ENV_VAR_MAX_FAILED_ATTEMPTS: &str = "CLOISTER_MAX_FAILED_ATTEMPTS";
/// Environment variable for the lockout duration in seconds.
pub const ENV_VAR_LOCKOUT_SECS: &str = "CLOISTER_LOCKOUT_SECS";
/// Environment variable for the re-key batch size.
pub const ENV_VAR_REKEY_BATCH_SIZE: &str = "CLOISTER_REKEY_BATCH_SIZE";
/// Environment variable supplying a passphrase for non-interactive use.
pub const ENV_VAR_PASSPHRASE: &str = "CLOISTER_PASSPHRASE";
/// Environment variable supplying the replacement passphrase for `passwd`.
pub const ENV_VAR_NEW_PASSPHRASE: &str = "CLOISTER_NEW_PASSPHRASE";
/// Standard environment variable for the user's home directory.
pub const ENV_VAR_HOME: &str = "HOME";
/// Default sub-directory for store data within the user's home directory.
pub const DEFAULT_DATA_SUBDIR: &str = ".local/share/cloister";

// Session Policy
/// Default idle timeout of the library store.
pub const DEFAULT_LIBRARY_TIMEOUT_SECS: u64 = 300;
/// Default idle timeout of the vault store.
pub const DEFAULT_VAULT_TIMEOUT_SECS: u64 = 120;
/// Consecutive failed unlocks before a store is locked out.
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;
/// Lockout duration once the failed-attempt threshold is reached.
pub const DEFAULT_LOCKOUT_SECS: u64 = 15 * 60;
/// How often the idle watchdog re-checks an unlocked session.
pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 1_000;

// Key Derivation
/// Argon2id memory cost in KiB (64 MiB).
pub const DEFAULT_KDF_MEMORY_KIB: u32 = 64 * 1024;
/// Argon2id pass count.
pub const DEFAULT_KDF_ITERATIONS: u32 = 3;
/// Argon2id lane count.
pub const DEFAULT_KDF_PARALLELISM: u32 = 4;
/// Length of every symmetric key in bytes.
pub const KEY_LEN: usize = 32;
/// Length of a freshly generated store salt.
pub const SALT_LEN: usize = 32;
/// Minimum accepted salt length.
pub const MIN_SALT_LEN: usize = 16;
/// Purpose label of the general-purpose store.
pub const PURPOSE_LIBRARY: &str = "library";
/// Purpose label of the high-sensitivity store.
pub const PURPOSE_VAULT: &str = "vault";

// Store Layout
/// File name of the encrypted content database inside a store directory.
pub const STORE_DB_FILE: &str = "store.db";
/// File name of the audit database inside a store directory.
pub const AUDIT_DB_FILE: &str = "audit.db";
/// Advisory lock file guarding a store directory.
pub const STORE_LOCK_FILE: &str = ".lock";
/// Plaintext sealed into the canary record.
pub const CANARY_PLAINTEXT: &[u8] = b"cloister-canary-v1";
/// Default number of records re-encrypted per checkpointed batch.
pub const DEFAULT_REKEY_BATCH_SIZE: usize = 64;

// File System Parameters
/// Default POSIX permissions for newly created directories (owner read/write/execute).
#[cfg(unix)]
pub const DEFAULT_DIR_PERMISSIONS: u32 = 0o700;
/// Default POSIX permissions for newly created files (owner read/write).
#[cfg(unix)]
pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o600;

// Audit
/// Hash recorded as the predecessor of the first entry.
pub const AUDIT_GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";
/// Domain-separation context for hashed subject references.
pub const AUDIT_SUBJECT_CONTEXT: &str = "cloister 2024 audit subject reference";

/// Placeholder string for redacted information in debug output.
pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

// Logging Configuration
/// Service name used in tracing spans and structured logs.
pub const TRACING_SERVICE_NAME: &str = "cloister";
