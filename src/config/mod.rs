//! Configuration management for cloister.
//!
//! Settings are loaded from environment variables with defaults. Parsing of
//! configuration *files* is left to the embedding application; it can build a
//! [`Settings`] value directly.
//!
//! # Environment Variables
//!
//! - `CLOISTER_DIR`: Data directory (defaults to ~/.local/share/cloister)
//! - `CLOISTER_LIBRARY_TIMEOUT_SECS`: Library idle timeout (default 300)
//! - `CLOISTER_VAULT_TIMEOUT_SECS`: Vault idle timeout (default 120)
//! - `CLOISTER_LIBRARY_AUDIT`: `true`/`false`, audit for the library store (default true)
//! - `CLOISTER_KDF_MEMORY_KIB`, `CLOISTER_KDF_ITERATIONS`, `CLOISTER_KDF_PARALLELISM`:
//!   Argon2id cost (defaults 65536 / 3 / 4)
//! - `CLOISTER_MAX_FAILED_ATTEMPTS`: Failures before lockout (default 5)
//! - `CLOISTER_LOCKOUT_SECS`: Lockout duration (default 900)
//! - `CLOISTER_REKEY_BATCH_SIZE`: Records per re-key batch (default 64)
//! - `HOME`: Used for expanding the default data directory path

use crate::constants::{
    DEFAULT_DATA_SUBDIR, DEFAULT_LIBRARY_TIMEOUT_SECS, DEFAULT_LOCKOUT_SECS,
    DEFAULT_MAX_FAILED_ATTEMPTS, DEFAULT_REKEY_BATCH_SIZE, DEFAULT_VAULT_TIMEOUT_SECS,
    DEFAULT_WATCHDOG_INTERVAL_MS, ENV_VAR_CLOISTER_DIR, ENV_VAR_HOME, ENV_VAR_KDF_ITERATIONS,
    ENV_VAR_KDF_MEMORY_KIB, ENV_VAR_KDF_PARALLELISM, ENV_VAR_LIBRARY_AUDIT,
    ENV_VAR_LIBRARY_TIMEOUT, ENV_VAR_LOCKOUT_SECS, ENV_VAR_MAX_FAILED_ATTEMPTS,
    ENV_VAR_REKEY_BATCH_SIZE, ENV_VAR_VAULT_TIMEOUT, REDACTED_PLACEHOLDER,
};
use crate::crypto::KdfParams;
use crate::errors::{AppError, AppResult};
use crate::session::SessionPolicy;
use crate::store::StoreKind;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Per-store policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePolicy {
    /// Idle time after which an unlocked session locks itself.
    pub idle_timeout: Duration,
    /// Whether operations on this store are audited.
    pub audit_enabled: bool,
}

/// Settings for both stores and the shared key-derivation and lockout rules.
///
/// # Examples
///
/// ```
/// use cloister::config::Settings;
/// use std::path::PathBuf;
///
/// let mut settings = Settings::with_data_dir(PathBuf::from("/var/lib/cloister"));
/// assert_eq!(settings.vault.idle_timeout.as_secs(), 120);
///
/// settings.vault.audit_enabled = false;
/// assert!(settings.validate().is_err());
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    /// Root directory; each store lives in a subdirectory named after it.
    pub data_dir: PathBuf,
    pub kdf: KdfParams,
    pub library: StorePolicy,
    pub vault: StorePolicy,
    pub max_failed_attempts: u32,
    pub lockout: Duration,
    pub rekey_batch_size: usize,
    pub watchdog_interval: Duration,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("data_dir", &REDACTED_PLACEHOLDER)
            .field("kdf", &self.kdf)
            .field("library", &self.library)
            .field("vault", &self.vault)
            .field("max_failed_attempts", &self.max_failed_attempts)
            .field("lockout", &self.lockout)
            .field("rekey_batch_size", &self.rekey_batch_size)
            .finish()
    }
}

impl Settings {
    /// Default settings rooted at `data_dir`.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            kdf: KdfParams::default(),
            library: StorePolicy {
                idle_timeout: Duration::from_secs(DEFAULT_LIBRARY_TIMEOUT_SECS),
                audit_enabled: true,
            },
            vault: StorePolicy {
                idle_timeout: Duration::from_secs(DEFAULT_VAULT_TIMEOUT_SECS),
                audit_enabled: true,
            },
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            lockout: Duration::from_secs(DEFAULT_LOCKOUT_SECS),
            rekey_batch_size: DEFAULT_REKEY_BATCH_SIZE,
            watchdog_interval: Duration::from_millis(DEFAULT_WATCHDOG_INTERVAL_MS),
        }
    }

    /// Loads settings from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a variable does not parse, path expansion
    /// fails, or the result does not pass [`Settings::validate`].
    pub fn load() -> AppResult<Self> {
        let dir_raw = env::var(ENV_VAR_CLOISTER_DIR).unwrap_or_else(|_| {
            let home = env::var(ENV_VAR_HOME).unwrap_or_default();
            format!("{}/{}", home, DEFAULT_DATA_SUBDIR)
        });

        // Expand the path (handles ~ and environment variables)
        let expanded = shellexpand::full(&dir_raw)
            .map_err(|e| AppError::Config(format!("Failed to expand path: {}", e)))?;
        let mut settings = Settings::with_data_dir(PathBuf::from(expanded.into_owned()));

        if let Some(secs) = parse_var::<u64>(ENV_VAR_LIBRARY_TIMEOUT)? {
            settings.library.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(ENV_VAR_VAULT_TIMEOUT)? {
            settings.vault.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(enabled) = parse_var::<bool>(ENV_VAR_LIBRARY_AUDIT)? {
            settings.library.audit_enabled = enabled;
        }

        let memory_kib = parse_var(ENV_VAR_KDF_MEMORY_KIB)?.unwrap_or(settings.kdf.memory_kib);
        let iterations = parse_var(ENV_VAR_KDF_ITERATIONS)?.unwrap_or(settings.kdf.iterations);
        let parallelism = parse_var(ENV_VAR_KDF_PARALLELISM)?.unwrap_or(settings.kdf.parallelism);
        settings.kdf = KdfParams::new(memory_kib, iterations, parallelism)
            .map_err(|e| AppError::Config(e.to_string()))?;

        if let Some(max) = parse_var(ENV_VAR_MAX_FAILED_ATTEMPTS)? {
            settings.max_failed_attempts = max;
        }
        if let Some(secs) = parse_var::<u64>(ENV_VAR_LOCKOUT_SECS)? {
            settings.lockout = Duration::from_secs(secs);
        }
        if let Some(batch) = parse_var(ENV_VAR_REKEY_BATCH_SIZE)? {
            settings.rekey_batch_size = batch;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Checks that the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when:
    /// - the data directory is empty or relative
    /// - vault audit is disabled
    /// - a timeout, the attempt threshold or the batch size is zero
    pub fn validate(&self) -> AppResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(AppError::Config("Data directory path is empty".to_string()));
        }
        if !self.data_dir.is_absolute() {
            return Err(AppError::Config(
                "Data directory must be an absolute path".to_string(),
            ));
        }
        if !self.vault.audit_enabled {
            return Err(AppError::Config(
                "Audit logging cannot be disabled for the vault store".to_string(),
            ));
        }
        if self.library.idle_timeout.is_zero() || self.vault.idle_timeout.is_zero() {
            return Err(AppError::Config("Idle timeouts must be non-zero".to_string()));
        }
        if self.max_failed_attempts == 0 {
            return Err(AppError::Config(
                "Failed attempt threshold must be at least 1".to_string(),
            ));
        }
        if self.rekey_batch_size == 0 {
            return Err(AppError::Config("Re-key batch size must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Policy of one store.
    pub fn store_policy(&self, kind: StoreKind) -> StorePolicy {
        match kind {
            StoreKind::Library => self.library,
            StoreKind::Vault => self.vault,
        }
    }

    /// Directory holding one store.
    pub fn store_dir(&self, kind: StoreKind) -> PathBuf {
        self.data_dir.join(kind.purpose())
    }

    /// Session rules for one store.
    pub fn session_policy(&self, kind: StoreKind) -> AppResult<SessionPolicy> {
        let to_chrono = |d: Duration| {
            chrono::Duration::from_std(d)
                .map_err(|e| AppError::Config(format!("Duration out of range: {}", e)))
        };
        Ok(SessionPolicy {
            idle_timeout: to_chrono(self.store_policy(kind).idle_timeout)?,
            max_failed_attempts: self.max_failed_attempts,
            lockout: to_chrono(self.lockout)?,
            watchdog_interval: self.watchdog_interval,
        })
    }
}

fn parse_var<T: FromStr>(name: &str) -> AppResult<Option<T>>
where
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| AppError::Config(format!("Invalid value for {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    const ALL_VARS: [&str; 10] = [
        ENV_VAR_CLOISTER_DIR,
        ENV_VAR_LIBRARY_TIMEOUT,
        ENV_VAR_VAULT_TIMEOUT,
        ENV_VAR_LIBRARY_AUDIT,
        ENV_VAR_KDF_MEMORY_KIB,
        ENV_VAR_KDF_ITERATIONS,
        ENV_VAR_KDF_PARALLELISM,
        ENV_VAR_MAX_FAILED_ATTEMPTS,
        ENV_VAR_LOCKOUT_SECS,
        ENV_VAR_REKEY_BATCH_SIZE,
    ];

    fn setup() {
        // Clear relevant environment variables before each test
        for var in ALL_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_debug_impl_redacts_data_dir() {
        let settings = Settings::with_data_dir(PathBuf::from("/home/username/secret/place"));
        let debug_output = format!("{:?}", settings);

        assert!(debug_output.contains(REDACTED_PLACEHOLDER));
        assert!(!debug_output.contains("/home/username/secret/place"));
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::with_data_dir(PathBuf::from("/data"));
        assert_eq!(settings.library.idle_timeout, Duration::from_secs(300));
        assert_eq!(settings.vault.idle_timeout, Duration::from_secs(120));
        assert_eq!(settings.max_failed_attempts, 5);
        assert_eq!(settings.lockout, Duration::from_secs(900));
        assert!(settings.library.audit_enabled);
        assert!(settings.validate().is_ok());
        assert_eq!(settings.store_dir(StoreKind::Vault), PathBuf::from("/data/vault"));
    }

    #[test]
    fn test_validate_rejects_disabled_vault_audit() {
        let mut settings = Settings::with_data_dir(PathBuf::from("/data"));
        settings.library.audit_enabled = false;
        assert!(settings.validate().is_ok());

        settings.vault.audit_enabled = false;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("vault"));
    }

    #[test]
    fn test_validate_rejects_relative_dir() {
        let settings = Settings::with_data_dir(PathBuf::from("relative/dir"));
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        setup();
        let temp_dir = tempdir().unwrap();
        env::set_var(ENV_VAR_CLOISTER_DIR, temp_dir.path());
        env::set_var(ENV_VAR_VAULT_TIMEOUT, "30");
        env::set_var(ENV_VAR_LIBRARY_AUDIT, "false");
        env::set_var(ENV_VAR_KDF_MEMORY_KIB, "1024");
        env::set_var(ENV_VAR_KDF_ITERATIONS, "1");
        env::set_var(ENV_VAR_KDF_PARALLELISM, "1");

        let settings = Settings::load();
        setup();

        let settings = settings.unwrap();
        assert_eq!(settings.data_dir, temp_dir.path());
        assert_eq!(settings.vault.idle_timeout, Duration::from_secs(30));
        assert!(!settings.library.audit_enabled);
        assert_eq!(settings.kdf, KdfParams::new(1024, 1, 1).unwrap());
    }

    #[test]
    #[serial]
    fn test_load_rejects_garbage() {
        setup();
        let temp_dir = tempdir().unwrap();
        env::set_var(ENV_VAR_CLOISTER_DIR, temp_dir.path());
        env::set_var(ENV_VAR_LOCKOUT_SECS, "fifteen minutes");

        let result = Settings::load();
        setup();

        let err = result.unwrap_err();
        assert!(err.to_string().contains(ENV_VAR_LOCKOUT_SECS));
    }

    #[test]
    fn test_session_policy_conversion() {
        let settings = Settings::with_data_dir(PathBuf::from("/data"));
        let policy = settings.session_policy(StoreKind::Library).unwrap();
        assert_eq!(policy.idle_timeout, chrono::Duration::seconds(300));
        assert_eq!(policy.lockout, chrono::Duration::minutes(15));
    }
}
