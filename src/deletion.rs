//! Multi-level deletion across the index, metadata and content layers.
//!
//! Levels nest: `Standard` removes every reference in one transaction,
//! `Secure` additionally zero-overwrites the ciphertext in place with SQLite
//! `secure_delete` on, and `Cryptographic` additionally starts a re-key in the
//! same transaction and finishes it before returning, so that no surviving
//! copy of the deleted ciphertext (journal, backup, freed page) can ever be
//! decrypted again.
//!
//! Overwriting is best effort. On wear-levelled flash or copy-on-write
//! filesystems the old blocks may survive; only `Cryptographic` gives a
//! guarantee, and that guarantee is about decryptability, not bytes.

use crate::audit::{AuditAction, AuditLog, AuditOutcome};
use crate::crypto::DataKey;
use crate::errors::{AppError, AppResult, DatabaseError, DeletionError, StoreError};
use crate::session::ActiveKeys;
use crate::store::{ensure_no_pending_rekey, records, with_secure_delete, EncryptedStore, RekeyCheckpoint};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// One step of the deletion cascade, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionStep {
    Index,
    Metadata,
    Content,
}

impl DeletionStep {
    /// Cascade order.
    pub const CASCADE: [DeletionStep; 3] = [
        DeletionStep::Index,
        DeletionStep::Metadata,
        DeletionStep::Content,
    ];
}

impl fmt::Display for DeletionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeletionStep::Index => "index",
            DeletionStep::Metadata => "metadata",
            DeletionStep::Content => "content",
        };
        f.write_str(label)
    }
}

/// Requested deletion strength. Each level includes the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionLevel {
    Standard,
    Secure,
    Cryptographic,
}

impl fmt::Display for DeletionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeletionLevel::Standard => "standard",
            DeletionLevel::Secure => "secure",
            DeletionLevel::Cryptographic => "cryptographic",
        };
        f.write_str(label)
    }
}

impl FromStr for DeletionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(DeletionLevel::Standard),
            "secure" => Ok(DeletionLevel::Secure),
            "cryptographic" | "crypto" => Ok(DeletionLevel::Cryptographic),
            other => Err(format!(
                "unknown deletion level '{}', expected standard, secure or cryptographic",
                other
            )),
        }
    }
}

/// What to delete and how thoroughly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionRequest {
    pub targets: Vec<String>,
    pub level: DeletionLevel,
}

impl DeletionRequest {
    /// A request for a single record.
    pub fn single(id: impl Into<String>, level: DeletionLevel) -> Self {
        Self {
            targets: vec![id.into()],
            level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStatus {
    /// Every target existed and is gone from every layer.
    Completed,
    /// Some targets did not exist; the rest are gone from every layer.
    CompletedWithMissing,
}

/// Outcome of a successful deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionReport {
    pub targets: Vec<String>,
    pub missing: Vec<String>,
    pub level: DeletionLevel,
    /// Layers in which at least one row was removed.
    pub layers_affected: Vec<DeletionStep>,
    /// Key version after a cryptographic deletion.
    pub new_key_version: Option<u64>,
    pub status: DeletionStatus,
    /// Sequence of the audit entry, when the store is audited.
    pub audit_sequence: Option<u64>,
}

/// Executes deletion requests against an unlocked store.
#[derive(Debug, Default)]
pub struct SecureDeletionService {
    #[cfg(test)]
    fault_at: Option<DeletionStep>,
    #[cfg(test)]
    fail_rekey: bool,
}

impl SecureDeletionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service that fails as soon as `step` starts.
    #[cfg(test)]
    pub(crate) fn with_fault_at(step: DeletionStep) -> Self {
        Self {
            fault_at: Some(step),
            ..Self::default()
        }
    }

    /// A service whose cryptographic deletions stop right after the cascade
    /// commits, leaving the re-key marker behind.
    #[cfg(test)]
    pub(crate) fn with_rekey_fault() -> Self {
        Self {
            fail_rekey: true,
            ..Self::default()
        }
    }

    #[cfg(test)]
    fn inject_fault(&self, step: DeletionStep) -> AppResult<()> {
        if self.fault_at == Some(step) {
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected fault",
            )));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn inject_fault(&self, _step: DeletionStep) -> AppResult<()> {
        Ok(())
    }

    #[cfg(test)]
    fn inject_rekey_fault(&self) -> AppResult<()> {
        if self.fail_rekey {
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected re-key fault",
            )));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn inject_rekey_fault(&self) -> AppResult<()> {
        Ok(())
    }

    /// Deletes the requested records and writes exactly one audit entry.
    ///
    /// The audit entry is written after the deletion commits and before this
    /// returns, whether the deletion succeeded or not.
    ///
    /// # Errors
    ///
    /// - `DeletionError::EmptyRequest` / `DeletionError::TargetNotFound`
    /// - `DeletionError::PartialDeletionFailure` naming the failed step; the
    ///   transaction was rolled back and every layer is unchanged
    /// - `StoreError::InterruptedRekey` if a cryptographic deletion removed
    ///   the targets but could not finish re-keying; the store must be resumed
    pub(crate) fn delete(
        &self,
        store: &EncryptedStore,
        keys: &mut ActiveKeys<'_>,
        audit: Option<&AuditLog>,
        request: &DeletionRequest,
        now: DateTime<Utc>,
    ) -> AppResult<DeletionReport> {
        let result = self.execute(store, keys, request);

        let subject = request.targets.join("\n");
        let subject = (!subject.is_empty()).then_some(subject.as_str());
        let (outcome, detail) = match &result {
            Ok(report) => (AuditOutcome::Success, describe(report)),
            Err(e) => (
                match e {
                    AppError::Deletion(DeletionError::EmptyRequest)
                    | AppError::Deletion(DeletionError::TargetNotFound) => AuditOutcome::Denied,
                    _ => AuditOutcome::Failed,
                },
                format!("level={} error={}", request.level, e.kind()),
            ),
        };

        let audit_sequence = match audit {
            Some(log) => Some(log.append(AuditAction::Delete, subject, outcome, &detail, now)?),
            None => None,
        };

        let mut report = result?;
        report.audit_sequence = audit_sequence;
        info!(
            "{} deletion of {} record(s) from {} store completed",
            report.level,
            report.targets.len(),
            store.kind()
        );
        Ok(report)
    }

    fn execute(
        &self,
        store: &EncryptedStore,
        keys: &mut ActiveKeys<'_>,
        request: &DeletionRequest,
    ) -> AppResult<DeletionReport> {
        if request.targets.is_empty() {
            return Err(DeletionError::EmptyRequest.into());
        }

        let _gate = store.exclusive();
        let mut conn = store.conn()?;
        ensure_no_pending_rekey(&conn)?;

        let mut targets = Vec::new();
        let mut missing = Vec::new();
        for id in &request.targets {
            if records::layer_presence(&conn, id)?.is_absent() {
                missing.push(id.clone());
            } else {
                targets.push(id.clone());
            }
        }
        if targets.is_empty() {
            return Err(DeletionError::TargetNotFound.into());
        }

        let new_key = match request.level {
            DeletionLevel::Cryptographic => Some(DataKey::generate()?),
            _ => None,
        };

        let cascade = |conn: &mut Connection| {
            self.cascade(store, conn, &*keys, &targets, request.level, new_key.as_ref())
        };
        let (layers_affected, checkpoint) = if request.level >= DeletionLevel::Secure {
            with_secure_delete(&mut *conn, cascade)?
        } else {
            cascade(&mut *conn)?
        };
        drop(conn);

        let new_key_version = match (checkpoint, new_key) {
            (Some(mut checkpoint), Some(new_key)) => {
                Some(self.finish_rekey(store, keys, &mut checkpoint, &new_key)?)
            }
            _ => None,
        };

        Ok(DeletionReport {
            targets,
            status: if missing.is_empty() {
                DeletionStatus::Completed
            } else {
                DeletionStatus::CompletedWithMissing
            },
            missing,
            level: request.level,
            layers_affected,
            new_key_version,
            audit_sequence: None,
        })
    }

    /// Runs the three layer steps (and the re-key start) in one transaction.
    fn cascade(
        &self,
        store: &EncryptedStore,
        conn: &mut Connection,
        keys: &ActiveKeys<'_>,
        targets: &[String],
        level: DeletionLevel,
        new_key: Option<&DataKey>,
    ) -> AppResult<(Vec<DeletionStep>, Option<RekeyCheckpoint>)> {
        let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;
        let mut layers_affected = Vec::new();

        for step in DeletionStep::CASCADE {
            let removed = self
                .run_step(&tx, step, targets, level)
                .map_err(|e| failure(step, e))?;
            debug!("Deletion step {} removed {} rows", step, removed);
            if removed > 0 {
                layers_affected.push(step);
            }
        }

        let checkpoint = match new_key {
            Some(new_key) => Some(
                store
                    .begin_rekey_tx(&tx, &*keys.master, new_key)
                    .map_err(|e| failure(DeletionStep::Content, e))?,
            ),
            None => None,
        };

        tx.commit()
            .map_err(|e| failure(DeletionStep::Content, DatabaseError::Sqlite(e).into()))?;
        Ok((layers_affected, checkpoint))
    }

    fn run_step(
        &self,
        conn: &Connection,
        step: DeletionStep,
        targets: &[String],
        level: DeletionLevel,
    ) -> AppResult<usize> {
        self.inject_fault(step)?;
        let mut removed = 0;
        for id in targets {
            removed += match step {
                DeletionStep::Index => records::delete_index(conn, id)?,
                DeletionStep::Metadata => records::delete_meta(conn, id)?,
                DeletionStep::Content => {
                    if level >= DeletionLevel::Secure {
                        records::overwrite_record(conn, id)?;
                    }
                    records::delete_record(conn, id)?
                }
            };
        }
        Ok(removed)
    }

    /// Migrates the surviving records to the new key and swaps it in.
    fn finish_rekey(
        &self,
        store: &EncryptedStore,
        keys: &mut ActiveKeys<'_>,
        checkpoint: &mut RekeyCheckpoint,
        new_key: &DataKey,
    ) -> AppResult<u64> {
        let finished = self
            .inject_rekey_fault()
            .and_then(|_| store.migrate(&*keys.data, new_key, checkpoint, None))
            .and_then(|_| store.commit_rekey(checkpoint, new_key));

        if let Err(e) = finished {
            warn!(
                "Cryptographic deletion could not finish re-key {} -> {}: {}",
                checkpoint.from_version, checkpoint.to_version, e
            );
            return Err(StoreError::InterruptedRekey {
                from: checkpoint.from_version,
                to: checkpoint.to_version,
            }
            .into());
        }

        keys.data.replace_with(new_key);
        *keys.key_version = checkpoint.to_version;
        Ok(checkpoint.to_version)
    }
}

fn failure(step: DeletionStep, error: AppError) -> AppError {
    warn!("Deletion failed at {} step, rolling back: {}", step, error);
    DeletionError::PartialDeletionFailure {
        step,
        reason: error.to_string(),
    }
    .into()
}

fn describe(report: &DeletionReport) -> String {
    let layers = report
        .layers_affected
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let mut detail = format!(
        "level={} targets={} missing={} layers={}",
        report.level,
        report.targets.len(),
        report.missing.len(),
        layers
    );
    if let Some(version) = report.new_key_version {
        detail.push_str(&format!(" key_version={}", version));
    }
    detail
}
