//! Encrypted store: transparent authenticated encryption over SQLite.
//!
//! Each store lives in its own directory with its own SQLite file, its own
//! salt and its own key slots. Records are sealed with a random data key; the
//! data key is persisted only wrapped under the passphrase-derived master key.
//! A canary record sealed under the data key proves on `open` that the
//! unwrapped key really is the one protecting the content.
//!
//! Reads and writes hold the store gate shared; re-keying and deletion hold it
//! exclusively for their full duration.
//!
//! # Module Structure
//!
//! - `schema`: table definitions
//! - `records`: row-level operations on the index, metadata and content layers
//! - `rekey`: resumable checkpointed re-encryption

pub mod records;
pub mod rekey;
pub mod schema;

pub use self::records::{LayerPresence, RecordMeta};
pub use self::rekey::{RekeyCheckpoint, RekeyReport};

use crate::constants::{
    CANARY_PLAINTEXT, PURPOSE_LIBRARY, PURPOSE_VAULT, STORE_DB_FILE, STORE_LOCK_FILE,
};
use crate::crypto::aead::{self, canary_aad, record_aad};
use crate::crypto::{DataKey, MasterKey, Salt, SealedRecord};
use crate::errors::{AppResult, CryptoError, DatabaseError, StoreError};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Type alias for a pooled SQLite connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Which of the two side-by-side stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// General-purpose store.
    Library,
    /// Higher-sensitivity store with mandatory audit.
    Vault,
}

impl StoreKind {
    /// Both stores, library first.
    pub const ALL: [StoreKind; 2] = [StoreKind::Library, StoreKind::Vault];

    /// Domain-separation label folded into key derivation.
    pub fn purpose(&self) -> &'static str {
        match self {
            StoreKind::Library => PURPOSE_LIBRARY,
            StoreKind::Vault => PURPOSE_VAULT,
        }
    }

    /// Whether audit logging may be disabled for this store.
    pub fn audit_mandatory(&self) -> bool {
        matches!(self, StoreKind::Vault)
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.purpose())
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            PURPOSE_LIBRARY => Ok(StoreKind::Library),
            PURPOSE_VAULT => Ok(StoreKind::Vault),
            other => Err(format!(
                "unknown store '{}', expected 'library' or 'vault'",
                other
            )),
        }
    }
}

/// Persisted failed-attempt state, so a restart cannot reset a lockout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockoutRecord {
    pub failed_attempts: u32,
    pub lockout_until: Option<DateTime<Utc>>,
}

/// One store: its database, its directory lock and its access gate.
pub struct EncryptedStore {
    kind: StoreKind,
    dir: PathBuf,
    pool: Pool<SqliteConnectionManager>,
    gate: RwLock<()>,
    batch_size: usize,
    _dir_lock: File,
}

impl fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("kind", &self.kind)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl EncryptedStore {
    /// Opens (creating if needed) the store directory `dir`.
    ///
    /// This does not need a key: it takes the directory lock, opens the
    /// connection pool and creates the schema. Use [`EncryptedStore::open`]
    /// to authenticate.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Busy` if another process holds the directory, or
    /// `StoreError::PurposeMismatch` if the directory belongs to the other store.
    pub fn load(dir: &Path, kind: StoreKind, batch_size: usize) -> AppResult<Self> {
        debug!("Loading {} store at {:?}", kind, dir);
        create_private_dir(dir)?;

        let lock_path = dir.join(STORE_LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock_file.try_lock_exclusive().map_err(|_| StoreError::Busy {
            path: dir.to_path_buf(),
        })?;

        let db_path = dir.join(STORE_DB_FILE);
        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conn.pragma_update(None, "secure_delete", false)
        });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(DatabaseError::Pool)?;

        {
            let conn = pool.get().map_err(DatabaseError::Pool)?;
            schema::create_tables(&conn)?;
        }
        restrict_file(&db_path)?;

        let store = Self {
            kind,
            dir: dir.to_path_buf(),
            pool,
            gate: RwLock::new(()),
            batch_size: batch_size.max(1),
            _dir_lock: lock_file,
        };

        if let Some(found) = store.recorded_purpose()? {
            if found != kind.purpose() {
                return Err(StoreError::PurposeMismatch {
                    expected: kind.purpose().to_string(),
                    found,
                }
                .into());
            }
        }

        info!("{} store loaded", kind);
        Ok(store)
    }

    /// Which store this is.
    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// The store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Gets a connection from the pool.
    pub(crate) fn conn(&self) -> AppResult<PooledConnection> {
        self.pool.get().map_err(|e| DatabaseError::Pool(e).into())
    }

    pub(crate) fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn recorded_purpose(&self) -> AppResult<Option<String>> {
        let conn = self.conn()?;
        let purpose = conn
            .query_row("SELECT purpose FROM store_meta WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(DatabaseError::Sqlite)?;
        Ok(purpose)
    }

    /// Whether a salt and key slot exist.
    pub fn is_initialized(&self) -> AppResult<bool> {
        Ok(self.recorded_purpose()?.is_some())
    }

    /// The plaintext salt record.
    pub fn salt(&self) -> AppResult<Salt> {
        let conn = self.conn()?;
        let bytes: Option<Vec<u8>> = conn
            .query_row("SELECT salt FROM store_meta WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(DatabaseError::Sqlite)?;
        let bytes = bytes.ok_or(StoreError::NotInitialized(self.kind))?;
        Salt::from_bytes(bytes)
    }

    /// The current key version.
    pub fn key_version(&self) -> AppResult<u64> {
        let conn = self.conn()?;
        current_version(&conn)?.ok_or_else(|| StoreError::NotInitialized(self.kind).into())
    }

    /// Versions for which a wrapped key slot exists. Exactly one in steady state.
    pub fn key_slot_versions(&self) -> AppResult<Vec<u64>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT key_version FROM key_slots ORDER BY key_version")
            .map_err(DatabaseError::Sqlite)?;
        let versions = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(DatabaseError::Sqlite)?
            .map(|v| v.map(|v| v as u64))
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        Ok(versions)
    }

    /// Creates the salt record, data key v1, its slot and the canary.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyInitialized` if the store already has a salt.
    pub fn initialize(&self, salt: &Salt, master: &MasterKey) -> AppResult<u64> {
        let _gate = self.exclusive();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;

        let exists: bool = tx
            .query_row("SELECT EXISTS(SELECT 1 FROM store_meta)", [], |row| {
                row.get(0)
            })
            .map_err(DatabaseError::Sqlite)?;
        if exists {
            return Err(StoreError::AlreadyInitialized(self.kind).into());
        }

        let version = 1u64;
        let now = Utc::now().to_rfc3339();
        let data_key = DataKey::generate()?;

        tx.execute(
            "INSERT INTO store_meta (id, purpose, salt, key_version, schema_version, created_at) VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                self.kind.purpose(),
                salt.as_bytes(),
                version as i64,
                schema::SCHEMA_VERSION,
                now
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        insert_slot(&tx, master, self.kind.purpose(), version, &data_key)?;
        write_canary(&tx, &data_key, version)?;
        tx.execute(
            "INSERT OR REPLACE INTO session_guard (id, failed_attempts, lockout_until) VALUES (1, 0, NULL)",
            [],
        )
        .map_err(DatabaseError::Sqlite)?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        info!("{} store initialized at key version {}", self.kind, version);
        Ok(version)
    }

    /// Authenticates `master` and unwraps the current data key into `out`.
    ///
    /// Returns the current key version.
    ///
    /// # Errors
    ///
    /// - `CryptoError::WrongPassphrase` if the key slot or canary does not
    ///   authenticate. `out` is left zeroed.
    /// - `StoreError::InterruptedRekey` if a re-key marker is present. The
    ///   passphrase is verified first, so a wrong passphrase is still reported
    ///   as such; `out` is left zeroed either way.
    pub fn open(&self, master: &MasterKey, out: &mut DataKey) -> AppResult<u64> {
        let _gate = self.shared();
        let conn = self.conn()?;
        let version = current_version(&conn)?.ok_or(StoreError::NotInitialized(self.kind))?;

        unwrap_slot(&conn, master, self.kind.purpose(), version, out)?;

        if let Some(checkpoint) = rekey::load_checkpoint(&conn)? {
            out.scrub();
            return Err(StoreError::InterruptedRekey {
                from: checkpoint.from_version,
                to: checkpoint.to_version,
            }
            .into());
        }

        if let Err(e) = verify_canary(&conn, out, version) {
            out.scrub();
            return Err(e);
        }

        debug!("{} store opened at key version {}", self.kind, version);
        Ok(version)
    }

    /// A handle performing transparent encryption with `key` at `key_version`.
    pub fn handle<'a>(&'a self, key: &'a DataKey, key_version: u64) -> Handle<'a> {
        Handle {
            store: self,
            key,
            key_version,
        }
    }

    /// Raw ciphertext snapshot of one record. Needs no key.
    pub fn sealed_record(&self, id: &str) -> AppResult<Option<SealedRecord>> {
        let _gate = self.shared();
        let conn = self.conn()?;
        records::get_record(&conn, id)
    }

    /// Scans index, metadata and content layers for `id`.
    pub fn layer_presence(&self, id: &str) -> AppResult<LayerPresence> {
        let _gate = self.shared();
        let conn = self.conn()?;
        records::layer_presence(&conn, id)
    }

    /// Re-wraps the current data key under `new_master`.
    ///
    /// The old slot is replaced in one statement, so the store is protected by
    /// exactly one master key before and after.
    pub fn rewrap(&self, old_master: &MasterKey, new_master: &MasterKey) -> AppResult<()> {
        let _gate = self.exclusive();
        let mut conn = self.conn()?;
        let version = current_version(&conn)?.ok_or(StoreError::NotInitialized(self.kind))?;

        let mut data_key = DataKey::empty();
        unwrap_slot(&conn, old_master, self.kind.purpose(), version, &mut data_key)?;

        with_secure_delete(&mut *conn, |conn| {
            let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;
            tx.execute(
                "DELETE FROM key_slots WHERE key_version = ?1",
                params![version as i64],
            )
            .map_err(DatabaseError::Sqlite)?;
            insert_slot(&tx, new_master, self.kind.purpose(), version, &data_key)?;
            tx.commit().map_err(DatabaseError::Sqlite)?;
            Ok(())
        })?;

        info!("{} store key slot re-wrapped at version {}", self.kind, version);
        Ok(())
    }

    /// Loads the persisted failed-attempt state.
    pub fn load_lockout(&self) -> AppResult<LockoutRecord> {
        let conn = self.conn()?;
        let row: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT failed_attempts, lockout_until FROM session_guard WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        let Some((failed_attempts, lockout_until)) = row else {
            return Ok(LockoutRecord::default());
        };
        let lockout_until = lockout_until
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| StoreError::Corrupt(format!("bad lockout timestamp: {}", e)))
            })
            .transpose()?;

        Ok(LockoutRecord {
            failed_attempts: failed_attempts.max(0) as u32,
            lockout_until,
        })
    }

    /// Persists the failed-attempt state.
    pub fn save_lockout(&self, record: &LockoutRecord) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO session_guard (id, failed_attempts, lockout_until) VALUES (1, ?1, ?2)",
            params![
                record.failed_attempts as i64,
                record.lockout_until.map(|t| t.to_rfc3339())
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }
}

/// Transparent encrypt-on-write, decrypt-on-read access to one store.
///
/// Borrowed from the session that owns the data key; never outlives it.
/// Every operation is refused while a re-key is pending or once the store
/// has moved past the handle's key version.
pub struct Handle<'a> {
    store: &'a EncryptedStore,
    key: &'a DataKey,
    key_version: u64,
}

impl Handle<'_> {
    /// The key version this handle seals under.
    pub fn key_version(&self) -> u64 {
        self.key_version
    }

    /// Seals `payload` and writes it with its metadata and index entries.
    pub fn write(&self, id: &str, payload: &[u8], tags: &[&str], now: DateTime<Utc>) -> AppResult<()> {
        if id.is_empty() {
            return Err(StoreError::InvalidRecordId("record id cannot be empty".to_string()).into());
        }

        let (nonce, ciphertext) = aead::seal(
            self.key.buffer(),
            &record_aad(id, self.key_version),
            payload,
        )?;
        let sealed = SealedRecord {
            id: id.to_string(),
            key_version: self.key_version,
            nonce,
            ciphertext,
        };

        let _gate = self.store.shared();
        let mut conn = self.store.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;
        self.ensure_current(&tx)?;
        records::upsert_record(&tx, &sealed)?;
        records::upsert_meta(&tx, id, payload.len() as u64, now)?;
        records::replace_tags(&tx, id, tags)?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        debug!("Wrote record ({} bytes) to {} store", payload.len(), self.store.kind);
        Ok(())
    }

    /// Reads and decrypts a record. `Ok(None)` if it does not exist.
    pub fn read(&self, id: &str) -> AppResult<Option<Vec<u8>>> {
        let _gate = self.store.shared();
        let conn = self.store.conn()?;
        self.ensure_current(&conn)?;
        let Some(sealed) = records::get_record(&conn, id)? else {
            return Ok(None);
        };
        if sealed.key_version != self.key_version {
            return Err(StoreError::Corrupt(format!(
                "record sealed under key version {} while store is at {}",
                sealed.key_version, self.key_version
            ))
            .into());
        }
        Ok(Some(aead::open_sealed(self.key, &sealed)?))
    }

    /// Metadata of a record.
    pub fn meta(&self, id: &str) -> AppResult<Option<RecordMeta>> {
        let _gate = self.store.shared();
        let conn = self.store.conn()?;
        self.ensure_current(&conn)?;
        records::get_meta(&conn, id)
    }

    /// All record ids, sorted.
    pub fn list(&self) -> AppResult<Vec<String>> {
        let _gate = self.store.shared();
        let conn = self.store.conn()?;
        self.ensure_current(&conn)?;
        records::list_ids(&conn)
    }

    /// Record ids indexed under `tag`.
    pub fn find_by_tag(&self, tag: &str) -> AppResult<Vec<String>> {
        let _gate = self.store.shared();
        let conn = self.store.conn()?;
        self.ensure_current(&conn)?;
        records::ids_for_tag(&conn, tag)
    }

    /// Must be called with the store gate held.
    fn ensure_current(&self, conn: &Connection) -> AppResult<()> {
        ensure_no_pending_rekey(conn)?;
        let current = current_version(conn)?.ok_or(StoreError::NotInitialized(self.store.kind))?;
        if current != self.key_version {
            return Err(StoreError::StaleKey {
                held: self.key_version,
                current,
            }
            .into());
        }
        Ok(())
    }
}

/// Refuses with `StoreError::InterruptedRekey` while a re-key marker exists.
pub(crate) fn ensure_no_pending_rekey(conn: &Connection) -> AppResult<()> {
    match rekey::load_checkpoint(conn)? {
        Some(checkpoint) => Err(StoreError::InterruptedRekey {
            from: checkpoint.from_version,
            to: checkpoint.to_version,
        }
        .into()),
        None => Ok(()),
    }
}

pub(crate) fn current_version(conn: &Connection) -> AppResult<Option<u64>> {
    let version: Option<i64> = conn
        .query_row("SELECT key_version FROM store_meta WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    Ok(version.map(|v| v as u64))
}

pub(crate) fn insert_slot(
    conn: &Connection,
    master: &MasterKey,
    purpose: &str,
    version: u64,
    data_key: &DataKey,
) -> AppResult<()> {
    let (nonce, wrapped) = aead::wrap_key(master, purpose, version, data_key)?;
    conn.execute(
        "INSERT INTO key_slots (key_version, nonce, wrapped_key, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![version as i64, nonce, wrapped, Utc::now().to_rfc3339()],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

pub(crate) fn unwrap_slot(
    conn: &Connection,
    master: &MasterKey,
    purpose: &str,
    version: u64,
    out: &mut DataKey,
) -> AppResult<()> {
    let slot: Option<(Vec<u8>, Vec<u8>)> = conn
        .query_row(
            "SELECT nonce, wrapped_key FROM key_slots WHERE key_version = ?1",
            params![version as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    let (nonce, wrapped) = slot
        .ok_or_else(|| StoreError::Corrupt(format!("no key slot for version {}", version)))?;
    aead::unwrap_key_into(master, purpose, version, &nonce, &wrapped, out)
}

pub(crate) fn write_canary(conn: &Connection, data_key: &DataKey, version: u64) -> AppResult<()> {
    let (nonce, ciphertext) = aead::seal(data_key.buffer(), &canary_aad(version), CANARY_PLAINTEXT)?;
    conn.execute(
        "INSERT OR REPLACE INTO canary (id, key_version, nonce, ciphertext) VALUES (1, ?1, ?2, ?3)",
        params![version as i64, nonce, ciphertext],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

fn verify_canary(conn: &Connection, data_key: &DataKey, version: u64) -> AppResult<()> {
    let (canary_version, nonce, ciphertext): (i64, Vec<u8>, Vec<u8>) = conn
        .query_row(
            "SELECT key_version, nonce, ciphertext FROM canary WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?
        .ok_or_else(|| StoreError::Corrupt("canary record missing".to_string()))?;

    if canary_version as u64 != version {
        return Err(StoreError::Corrupt(format!(
            "canary at key version {} but store at {}",
            canary_version, version
        ))
        .into());
    }

    let plaintext = aead::open(data_key.buffer(), &canary_aad(version), &nonce, &ciphertext, "canary")
        .map_err(|_| CryptoError::WrongPassphrase)?;
    if plaintext.as_slice() != CANARY_PLAINTEXT {
        return Err(CryptoError::WrongPassphrase.into());
    }
    Ok(())
}

/// Runs `f` with SQLite `secure_delete` on, restoring it afterwards.
pub(crate) fn with_secure_delete<T>(
    conn: &mut Connection,
    f: impl FnOnce(&mut Connection) -> AppResult<T>,
) -> AppResult<T> {
    conn.pragma_update(None, "secure_delete", true)
        .map_err(DatabaseError::Sqlite)?;
    let result = f(conn);
    conn.pragma_update(None, "secure_delete", false)
        .map_err(DatabaseError::Sqlite)?;
    result
}

fn create_private_dir(dir: &Path) -> AppResult<()> {
    if dir.exists() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(crate::constants::DEFAULT_DIR_PERMISSIONS)
            .create(dir)?;
    }
    #[cfg(not(unix))]
    fs::create_dir_all(dir)?;
    Ok(())
}

fn restrict_file(path: &Path) -> AppResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(
            path,
            fs::Permissions::from_mode(crate::constants::DEFAULT_FILE_PERMISSIONS),
        )?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
