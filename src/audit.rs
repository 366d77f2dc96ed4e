//! Append-only, hash-chained audit trail.
//!
//! Each store keeps its own `audit.db`. Every entry carries the hash of the
//! entry before it, and its own hash covers a canonical JSON serialization of
//! all its fields including that link. Rewriting, dropping, inserting or
//! reordering any historical entry therefore breaks the chain at that point.
//!
//! The chain detects accidental corruption and naive tampering. Someone with
//! raw write access to the file can recompute every hash after an edit; the
//! log is not a non-repudiation mechanism.
//!
//! Subject identifiers (record ids) are never stored in the clear. They are
//! hashed with a keyed blake3 derivation over a random per-log salt.

use crate::constants::{AUDIT_GENESIS_HASH, AUDIT_SUBJECT_CONTEXT, SALT_LEN};
use crate::errors::{AppResult, AuditError, DatabaseError};
use crate::store::StoreKind;
use blake3::Hasher;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Kind of audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    StoreInitialized,
    Unlock,
    Lock,
    SessionExpired,
    LockoutStarted,
    Write,
    Delete,
    Rekey,
    PassphraseRotated,
    AuditVerified,
    AuditExported,
}

impl AuditAction {
    const ALL: [AuditAction; 11] = [
        AuditAction::StoreInitialized,
        AuditAction::Unlock,
        AuditAction::Lock,
        AuditAction::SessionExpired,
        AuditAction::LockoutStarted,
        AuditAction::Write,
        AuditAction::Delete,
        AuditAction::Rekey,
        AuditAction::PassphraseRotated,
        AuditAction::AuditVerified,
        AuditAction::AuditExported,
    ];

    /// Stable label as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::StoreInitialized => "store_initialized",
            AuditAction::Unlock => "unlock",
            AuditAction::Lock => "lock",
            AuditAction::SessionExpired => "session_expired",
            AuditAction::LockoutStarted => "lockout_started",
            AuditAction::Write => "write",
            AuditAction::Delete => "delete",
            AuditAction::Rekey => "rekey",
            AuditAction::PassphraseRotated => "passphrase_rotated",
            AuditAction::AuditVerified => "audit_verified",
            AuditAction::AuditExported => "audit_exported",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == wanted)
            .ok_or_else(|| format!("unknown audit action '{}'", s))
    }
}

/// Result of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// Refused before any state changed (wrong passphrase, lockout, tamper).
    Denied,
    /// Attempted and rolled back.
    Failed,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AuditOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AuditOutcome::Success),
            "denied" => Ok(AuditOutcome::Denied),
            "failed" => Ok(AuditOutcome::Failed),
            other => Err(format!("unknown audit outcome '{}'", other)),
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    /// RFC 3339 UTC with nanoseconds; sorts lexicographically.
    pub timestamp: String,
    pub store: StoreKind,
    pub action: AuditAction,
    /// Keyed hash of the subject id, if the operation had one.
    pub subject: Option<String>,
    pub outcome: AuditOutcome,
    pub detail: String,
    pub prev_hash: String,
    pub hash: String,
}

/// Field order here is the canonical serialization order.
#[derive(Serialize)]
struct CanonicalEntry<'a> {
    sequence: u64,
    timestamp: &'a str,
    store: StoreKind,
    action: AuditAction,
    subject: Option<&'a str>,
    outcome: AuditOutcome,
    detail: &'a str,
    prev_hash: &'a str,
}

impl AuditEntry {
    /// Recomputes the hash this entry should carry.
    pub fn compute_hash(&self) -> AppResult<String> {
        let canonical = CanonicalEntry {
            sequence: self.sequence,
            timestamp: &self.timestamp,
            store: self.store,
            action: self.action,
            subject: self.subject.as_deref(),
            outcome: self.outcome,
            detail: &self.detail,
            prev_hash: &self.prev_hash,
        };
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// Read-only query over the log. All bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub action: Option<AuditAction>,
    pub store: Option<StoreKind>,
    pub limit: Option<usize>,
}

/// Outcome of a successful chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub entries: u64,
    pub head_hash: String,
}

/// Report of a completed audit export.
#[derive(Debug, Clone)]
pub struct ExportReport {
    /// Number of entries written to the archive
    pub entries: u64,
    /// Size of the archive in bytes
    pub archive_size: u64,
    /// BLAKE3 checksum of the archive
    pub checksum: String,
    /// Sequence of the first chain divergence, if verification failed
    pub tamper_detected_at: Option<u64>,
    /// Duration taken to build and write the archive
    pub duration: Duration,
}

#[derive(Serialize)]
struct ExportManifest<'a> {
    store: StoreKind,
    entries: u64,
    head_hash: &'a str,
    exported_at: String,
    chain_verified: bool,
    tamper_detected_at: Option<u64>,
}

/// Hash-chained audit log of one store.
pub struct AuditLog {
    store: StoreKind,
    path: PathBuf,
    conn: Mutex<Connection>,
    subject_key: [u8; 32],
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("store", &self.store)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Opens (creating if needed) the audit log at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema created.
    pub fn open(path: &Path, store: StoreKind) -> AppResult<Self> {
        debug!("Opening {} audit log at {:?}", store, path);
        let conn = Connection::open(path).map_err(DatabaseError::Sqlite)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(DatabaseError::Sqlite)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                subject_salt BLOB NOT NULL,
                compromised_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                sequence INTEGER PRIMARY KEY,
                timestamp TEXT NOT NULL,
                store TEXT NOT NULL,
                action TEXT NOT NULL,
                subject TEXT,
                outcome TEXT NOT NULL,
                detail TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                hash TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON audit_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log(action);
            "#,
        )
        .map_err(DatabaseError::Sqlite)?;

        let existing: Option<Vec<u8>> = conn
            .query_row("SELECT subject_salt FROM audit_meta WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(DatabaseError::Sqlite)?;
        let salt = match existing {
            Some(salt) => salt,
            None => {
                let mut salt = vec![0u8; SALT_LEN];
                getrandom::getrandom(&mut salt)
                    .map_err(|e| crate::errors::CryptoError::Random(e.to_string()))?;
                conn.execute(
                    "INSERT INTO audit_meta (id, subject_salt, compromised_at) VALUES (1, ?1, NULL)",
                    params![salt],
                )
                .map_err(DatabaseError::Sqlite)?;
                salt
            }
        };

        let mut hasher = Hasher::new_derive_key(AUDIT_SUBJECT_CONTEXT);
        hasher.update(&salt);
        let subject_key = *hasher.finalize().as_bytes();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                path,
                std::fs::Permissions::from_mode(crate::constants::DEFAULT_FILE_PERMISSIONS),
            )?;
        }

        Ok(Self {
            store,
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            subject_key,
        })
    }

    /// Which store this log belongs to.
    pub fn store(&self) -> StoreKind {
        self.store
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keyed hash of a subject id as it appears in entries.
    pub fn subject_ref(&self, id: &str) -> String {
        blake3::keyed_hash(&self.subject_key, id.as_bytes())
            .to_hex()
            .to_string()
    }

    /// Appends an entry and returns its sequence number.
    ///
    /// # Arguments
    ///
    /// * `action` - What was done
    /// * `subject` - Record id the action applied to, hashed before storage
    /// * `outcome` - Whether it succeeded
    /// * `detail` - Free text; must not contain secrets or raw ids
    /// * `now` - Timestamp of the event
    pub fn append(
        &self,
        action: AuditAction,
        subject: Option<&str>,
        outcome: AuditOutcome,
        detail: &str,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        let subject = subject.map(|id| self.subject_ref(id));
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Sqlite)?;

        let head: Option<(i64, String)> = tx
            .query_row(
                "SELECT sequence, hash FROM audit_log ORDER BY sequence DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;
        let (sequence, prev_hash) = match head {
            Some((seq, hash)) => (seq as u64 + 1, hash),
            None => (1, AUDIT_GENESIS_HASH.to_string()),
        };

        let mut entry = AuditEntry {
            sequence,
            timestamp: format_timestamp(now),
            store: self.store,
            action,
            subject,
            outcome,
            detail: detail.to_string(),
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash()?;

        tx.execute(
            r#"
            INSERT INTO audit_log
                (sequence, timestamp, store, action, subject, outcome, detail, prev_hash, hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                entry.sequence as i64,
                entry.timestamp,
                entry.store.purpose(),
                entry.action.as_str(),
                entry.subject,
                entry.outcome.as_str(),
                entry.detail,
                entry.prev_hash,
                entry.hash
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        debug!(
            "Audit #{} {} {} ({})",
            entry.sequence,
            entry.action,
            entry.outcome.as_str(),
            self.store
        );
        Ok(entry.sequence)
    }

    /// Entries matching `filter`, oldest first.
    pub fn query(&self, filter: &AuditFilter) -> AppResult<Vec<AuditEntry>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT sequence, timestamp, store, action, subject, outcome, detail, prev_hash, hash
                FROM audit_log
                WHERE (?1 IS NULL OR timestamp >= ?1)
                  AND (?2 IS NULL OR timestamp <= ?2)
                  AND (?3 IS NULL OR action = ?3)
                  AND (?4 IS NULL OR store = ?4)
                ORDER BY sequence ASC
                LIMIT ?5
                "#,
            )
            .map_err(DatabaseError::Sqlite)?;

        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt
            .query_map(
                params![
                    filter.since.map(format_timestamp),
                    filter.until.map(format_timestamp),
                    filter.action.map(|a| a.as_str()),
                    filter.store.map(|s| s.purpose()),
                    limit
                ],
                read_row,
            )
            .map_err(DatabaseError::Sqlite)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(DatabaseError::Sqlite)??);
        }
        Ok(entries)
    }

    /// Number of entries.
    pub fn len(&self) -> AppResult<u64> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .map_err(DatabaseError::Sqlite)?;
        Ok(count as u64)
    }

    /// `true` when the log holds no entries.
    pub fn is_empty(&self) -> AppResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Sequence at which tampering was detected, if the log was ever found broken.
    pub fn compromised_at(&self) -> AppResult<Option<u64>> {
        let conn = self.lock();
        let at: Option<i64> = conn
            .query_row("SELECT compromised_at FROM audit_meta WHERE id = 1", [], |row| {
                row.get(0)
            })
            .map_err(DatabaseError::Sqlite)?;
        Ok(at.map(|s| s as u64))
    }

    /// Fails with `ChainTamperDetected` if the log has been marked compromised.
    pub fn ensure_intact(&self) -> AppResult<()> {
        match self.compromised_at()? {
            Some(sequence) => Err(AuditError::ChainTamperDetected { sequence }.into()),
            None => Ok(()),
        }
    }

    /// Recomputes the chain from genesis.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::ChainTamperDetected` with the first diverging
    /// sequence and marks the log compromised.
    pub fn verify(&self) -> AppResult<VerifyReport> {
        match self.walk_chain()? {
            Ok(report) => {
                info!(
                    "{} audit chain verified: {} entries",
                    self.store, report.entries
                );
                Ok(report)
            }
            Err(sequence) => {
                warn!(
                    "{} audit chain diverges at sequence {}",
                    self.store, sequence
                );
                self.mark_compromised(sequence)?;
                Err(AuditError::ChainTamperDetected { sequence }.into())
            }
        }
    }

    /// Walks every entry. The inner `Err` carries the first bad sequence.
    fn walk_chain(&self) -> AppResult<Result<VerifyReport, u64>> {
        let entries = self.query(&AuditFilter::default())?;
        let mut expected_prev = AUDIT_GENESIS_HASH.to_string();

        for (position, entry) in entries.iter().enumerate() {
            let expected_sequence = position as u64 + 1;
            if entry.sequence != expected_sequence {
                return Ok(Err(expected_sequence));
            }
            if entry.prev_hash != expected_prev || entry.compute_hash()? != entry.hash {
                return Ok(Err(entry.sequence));
            }
            expected_prev = entry.hash.clone();
        }

        Ok(Ok(VerifyReport {
            entries: entries.len() as u64,
            head_hash: expected_prev,
        }))
    }

    fn mark_compromised(&self, sequence: u64) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE audit_meta SET compromised_at = COALESCE(MIN(compromised_at, ?1), ?1) WHERE id = 1",
            params![sequence as i64],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Writes the whole log to a gzip-compressed tar archive at `output`.
    ///
    /// The archive holds `audit.jsonl` (one entry per line, oldest first) and
    /// `manifest.json`. The chain is verified first; a broken chain is
    /// recorded in the manifest rather than aborting the export.
    pub fn export_archive(&self, output: &Path) -> AppResult<ExportReport> {
        let start_time = Instant::now();
        info!("Exporting {} audit log to {:?}", self.store, output);

        let walked = self.walk_chain()?;
        let tamper_detected_at = walked.as_ref().err().copied();
        if let Some(sequence) = tamper_detected_at {
            self.mark_compromised(sequence)?;
        }
        let entries = self.query(&AuditFilter::default())?;

        // Step 1: serialize entries and manifest
        let mut jsonl = Vec::new();
        for entry in &entries {
            serde_json::to_writer(&mut jsonl, entry)?;
            jsonl.push(b'\n');
        }
        let head_hash = entries
            .last()
            .map(|e| e.hash.as_str())
            .unwrap_or(AUDIT_GENESIS_HASH);
        let manifest = serde_json::to_vec_pretty(&ExportManifest {
            store: self.store,
            entries: entries.len() as u64,
            head_hash,
            exported_at: format_timestamp(Utc::now()),
            chain_verified: tamper_detected_at.is_none(),
            tamper_detected_at,
        })?;

        // Step 2: build the tar.gz in memory
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut tar = tar::Builder::new(encoder);
        append_bytes(&mut tar, "audit.jsonl", &jsonl)?;
        append_bytes(&mut tar, "manifest.json", &manifest)?;
        let encoder = tar
            .into_inner()
            .map_err(|e| AuditError::Export(format!("failed to finalize tar archive: {}", e)))?;
        let archive = encoder
            .finish()
            .map_err(|e| AuditError::Export(format!("failed to finish gzip compression: {}", e)))?;

        // Step 3: write atomically next to the destination
        let parent = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;
        let mut staged = tempfile::NamedTempFile::new_in(&parent)?;
        staged.write_all(&archive)?;
        staged.as_file().sync_all()?;
        staged
            .persist(output)
            .map_err(|e| AuditError::Export(format!("failed to move archive into place: {}", e)))?;

        let mut hasher = Hasher::new();
        hasher.update(&archive);
        let checksum = hasher.finalize().to_hex().to_string();

        let duration = start_time.elapsed();
        info!(
            "Audit export completed: {} entries, {} bytes",
            entries.len(),
            archive.len()
        );

        Ok(ExportReport {
            entries: entries.len() as u64,
            archive_size: archive.len() as u64,
            checksum,
            tamper_detected_at,
            duration,
        })
    }
}

fn append_bytes<W: Write>(tar: &mut tar::Builder<W>, name: &str, bytes: &[u8]) -> AppResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o600);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    tar.append_data(&mut header, name, bytes)
        .map_err(|e| AuditError::Export(format!("failed to add {} to archive: {}", name, e)))?;
    Ok(())
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

type RowResult = Result<AppResult<AuditEntry>, rusqlite::Error>;

fn read_row(row: &rusqlite::Row<'_>) -> RowResult {
    let store: String = row.get(2)?;
    let action: String = row.get(3)?;
    let outcome: String = row.get(5)?;
    let sequence: i64 = row.get(0)?;
    let timestamp: String = row.get(1)?;
    let subject: Option<String> = row.get(4)?;
    let detail: String = row.get(6)?;
    let prev_hash: String = row.get(7)?;
    let hash: String = row.get(8)?;

    let parsed = (|| -> AppResult<AuditEntry> {
        let corrupt = |what: String| crate::errors::StoreError::Corrupt(what);
        Ok(AuditEntry {
            sequence: sequence as u64,
            timestamp,
            store: store.parse().map_err(corrupt)?,
            action: action.parse().map_err(corrupt)?,
            subject,
            outcome: outcome.parse().map_err(corrupt)?,
            detail,
            prev_hash,
            hash,
        })
    })();
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn log_with_entries(dir: &Path, n: usize) -> AuditLog {
        let log = AuditLog::open(&dir.join("audit.db"), StoreKind::Vault).unwrap();
        for i in 0..n {
            log.append(
                AuditAction::Write,
                Some(&format!("doc-{}", i)),
                AuditOutcome::Success,
                "sealed",
                Utc::now(),
            )
            .unwrap();
        }
        log
    }

    #[test]
    fn test_chain_links_from_genesis() {
        let temp_dir = TempDir::new().unwrap();
        let log = log_with_entries(temp_dir.path(), 3);

        let entries = log.query(&AuditFilter::default()).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].prev_hash, AUDIT_GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert_eq!(entries[2].prev_hash, entries[1].hash);

        let report = log.verify().unwrap();
        assert_eq!(report.entries, 3);
        assert_eq!(report.head_hash, entries[2].hash);
    }

    #[test]
    fn test_subject_is_hashed() {
        let temp_dir = TempDir::new().unwrap();
        let log = log_with_entries(temp_dir.path(), 1);
        let entry = &log.query(&AuditFilter::default()).unwrap()[0];

        let subject = entry.subject.as_deref().unwrap();
        assert_ne!(subject, "doc-0");
        assert_eq!(subject, log.subject_ref("doc-0"));
    }

    #[test]
    fn test_mutation_detected_at_that_entry() {
        let temp_dir = TempDir::new().unwrap();
        let log = log_with_entries(temp_dir.path(), 4);

        let raw = Connection::open(temp_dir.path().join("audit.db")).unwrap();
        raw.execute(
            "UPDATE audit_log SET detail = 'nothing happened' WHERE sequence = 2",
            [],
        )
        .unwrap();

        let err = log.verify().unwrap_err();
        assert!(matches!(
            err,
            AppError::Audit(AuditError::ChainTamperDetected { sequence: 2 })
        ));
        assert_eq!(log.compromised_at().unwrap(), Some(2));
        assert!(log.ensure_intact().is_err());
    }

    #[test]
    fn test_deletion_detected() {
        let temp_dir = TempDir::new().unwrap();
        let log = log_with_entries(temp_dir.path(), 4);

        let raw = Connection::open(temp_dir.path().join("audit.db")).unwrap();
        raw.execute("DELETE FROM audit_log WHERE sequence = 3", [])
            .unwrap();

        assert!(matches!(
            log.verify(),
            Err(AppError::Audit(AuditError::ChainTamperDetected { sequence: 3 }))
        ));
    }

    #[test]
    fn test_reorder_detected() {
        let temp_dir = TempDir::new().unwrap();
        let log = log_with_entries(temp_dir.path(), 3);

        let raw = Connection::open(temp_dir.path().join("audit.db")).unwrap();
        raw.execute_batch(
            r#"
            UPDATE audit_log SET sequence = 100 WHERE sequence = 1;
            UPDATE audit_log SET sequence = 1 WHERE sequence = 2;
            UPDATE audit_log SET sequence = 2 WHERE sequence = 100;
            "#,
        )
        .unwrap();

        assert!(matches!(
            log.verify(),
            Err(AppError::Audit(AuditError::ChainTamperDetected { sequence: 1 }))
        ));
    }

    #[test]
    fn test_query_filters() {
        let temp_dir = TempDir::new().unwrap();
        let log = AuditLog::open(&temp_dir.path().join("audit.db"), StoreKind::Library).unwrap();
        let t0 = Utc::now();
        log.append(AuditAction::Unlock, None, AuditOutcome::Success, "", t0)
            .unwrap();
        log.append(
            AuditAction::Delete,
            Some("a"),
            AuditOutcome::Success,
            "level=standard",
            t0 + chrono::Duration::seconds(10),
        )
        .unwrap();
        log.append(
            AuditAction::Lock,
            None,
            AuditOutcome::Success,
            "",
            t0 + chrono::Duration::seconds(20),
        )
        .unwrap();

        let deletes = log
            .query(&AuditFilter {
                action: Some(AuditAction::Delete),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].detail, "level=standard");

        let window = log
            .query(&AuditFilter {
                since: Some(t0 + chrono::Duration::seconds(5)),
                until: Some(t0 + chrono::Duration::seconds(25)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            window.iter().map(|e| e.action).collect::<Vec<_>>(),
            [AuditAction::Delete, AuditAction::Lock]
        );

        let other_store = log
            .query(&AuditFilter {
                store: Some(StoreKind::Vault),
                ..Default::default()
            })
            .unwrap();
        assert!(other_store.is_empty());
    }

    #[test]
    fn test_export_archive_contents() {
        let temp_dir = TempDir::new().unwrap();
        let log = log_with_entries(temp_dir.path(), 2);
        let output = temp_dir.path().join("exports").join("audit.tar.gz");

        let report = log.export_archive(&output).unwrap();
        assert_eq!(report.entries, 2);
        assert!(report.tamper_detected_at.is_none());
        assert!(output.exists());

        let file = std::fs::File::open(&output).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut names = Vec::new();
        let mut jsonl = String::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            if name == "audit.jsonl" {
                entry.read_to_string(&mut jsonl).unwrap();
            }
            names.push(name);
        }
        assert_eq!(names, ["audit.jsonl", "manifest.json"]);

        let parsed: Vec<AuditEntry> = jsonl
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed, log.query(&AuditFilter::default()).unwrap());
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("delete".parse::<AuditAction>().unwrap(), AuditAction::Delete);
        assert_eq!(
            "session-expired".parse::<AuditAction>().unwrap(),
            AuditAction::SessionExpired
        );
        assert!("explode".parse::<AuditAction>().is_err());
    }
}
