//! Resumable re-encryption of a store under a new data key.
//!
//! A re-key runs in three phases:
//!
//! 1. **Begin**: a `rekey_state` marker is inserted holding the source and
//!    target versions plus the new data key wrapped under the master key. This
//!    may share a transaction with other work (cryptographic deletion does).
//! 2. **Migrate**: records still sealed under the source version are
//!    re-sealed in batches ordered by id. Each batch and its cursor update
//!    commit together, so a crash loses at most one uncommitted batch.
//! 3. **Commit**: one transaction installs the new key slot, removes every
//!    older slot, bumps the key version, re-seals the canary and removes the
//!    marker. Until this commits the old key remains the active key.
//!
//! While the marker exists `open` and every [`super::Handle`] operation refuse
//! normal access and only [`EncryptedStore::resume_rekey`] can proceed.

use super::{current_version, records, unwrap_slot, with_secure_delete, write_canary, EncryptedStore};
use crate::crypto::aead::{self, record_aad};
use crate::crypto::{DataKey, MasterKey, SealedRecord};
use crate::errors::{AppResult, DatabaseError, StoreError};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

/// Persisted progress of an incomplete re-key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RekeyCheckpoint {
    pub from_version: u64,
    pub to_version: u64,
    pub pending_nonce: Vec<u8>,
    pub pending_wrapped_key: Vec<u8>,
    /// Id of the last migrated record, `None` before the first batch.
    pub cursor: Option<String>,
    pub migrated: u64,
    pub started_at: String,
}

/// Outcome of a completed re-key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyReport {
    pub from_version: u64,
    pub to_version: u64,
    pub migrated: u64,
    /// `true` when the re-key was finished by a resume.
    pub resumed: bool,
}

/// Loads the re-key marker, if any.
pub fn load_checkpoint(conn: &Connection) -> AppResult<Option<RekeyCheckpoint>> {
    let checkpoint = conn
        .query_row(
            r#"
            SELECT from_version, to_version, pending_nonce, pending_wrapped_key,
                   cursor, migrated, started_at
            FROM rekey_state WHERE id = 1
            "#,
            [],
            |row| {
                Ok(RekeyCheckpoint {
                    from_version: row.get::<_, i64>(0)? as u64,
                    to_version: row.get::<_, i64>(1)? as u64,
                    pending_nonce: row.get(2)?,
                    pending_wrapped_key: row.get(3)?,
                    cursor: row.get(4)?,
                    migrated: row.get::<_, i64>(5)? as u64,
                    started_at: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    Ok(checkpoint)
}

impl EncryptedStore {
    /// The pending re-key, if one was interrupted.
    pub fn pending_rekey(&self) -> AppResult<Option<RekeyCheckpoint>> {
        let conn = self.conn()?;
        load_checkpoint(&conn)
    }

    /// Re-encrypts every record from `current` to `new_key` and makes
    /// `new_key` the active key at the next version.
    ///
    /// Holds the store exclusively for the whole migration. The caller keeps
    /// ownership of both keys; on success `current` is no longer wrapped
    /// anywhere on disk and should be scrubbed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InterruptedRekey` if a previous re-key is still
    /// pending, and also for any failure after the marker is written. The
    /// marker then stays in place for [`EncryptedStore::resume_rekey`].
    pub fn rekey(
        &self,
        master: &MasterKey,
        current: &DataKey,
        new_key: &DataKey,
    ) -> AppResult<RekeyReport> {
        let _gate = self.exclusive();

        let mut checkpoint = {
            let mut conn = self.conn()?;
            let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;
            let checkpoint = self.begin_rekey_tx(&tx, master, new_key)?;
            tx.commit().map_err(DatabaseError::Sqlite)?;
            checkpoint
        };

        let finished = self
            .migrate(current, new_key, &mut checkpoint, None)
            .and_then(|_| self.commit_rekey(&checkpoint, new_key));
        if let Err(e) = finished {
            warn!(
                "{} store re-key {} -> {} interrupted: {}",
                self.kind(),
                checkpoint.from_version,
                checkpoint.to_version,
                e
            );
            return Err(StoreError::InterruptedRekey {
                from: checkpoint.from_version,
                to: checkpoint.to_version,
            }
            .into());
        }

        Ok(RekeyReport {
            from_version: checkpoint.from_version,
            to_version: checkpoint.to_version,
            migrated: checkpoint.migrated,
            resumed: false,
        })
    }

    /// Finishes an interrupted re-key, leaving the new data key in `out`.
    ///
    /// The passphrase is verified against the still-active old key slot
    /// before any record is touched.
    ///
    /// # Errors
    ///
    /// - `CryptoError::WrongPassphrase` if `master` does not unwrap the slots
    /// - `StoreError::NoRekeyPending` if there is nothing to resume
    pub fn resume_rekey(&self, master: &MasterKey, out: &mut DataKey) -> AppResult<RekeyReport> {
        let _gate = self.exclusive();
        let conn = self.conn()?;

        let Some(mut checkpoint) = load_checkpoint(&conn)? else {
            return Err(StoreError::NoRekeyPending.into());
        };
        info!(
            "Resuming {} store re-key {} -> {} after {} records",
            self.kind(),
            checkpoint.from_version,
            checkpoint.to_version,
            checkpoint.migrated
        );

        let mut old_key = DataKey::empty();
        unwrap_slot(
            &conn,
            master,
            self.kind().purpose(),
            checkpoint.from_version,
            &mut old_key,
        )?;
        aead::unwrap_key_into(
            master,
            self.kind().purpose(),
            checkpoint.to_version,
            &checkpoint.pending_nonce,
            &checkpoint.pending_wrapped_key,
            out,
        )?;
        drop(conn);

        let result = self
            .migrate(&old_key, &*out, &mut checkpoint, None)
            .and_then(|_| self.commit_rekey(&checkpoint, &*out));
        old_key.scrub();
        if let Err(e) = result {
            out.scrub();
            return Err(e);
        }

        Ok(RekeyReport {
            from_version: checkpoint.from_version,
            to_version: checkpoint.to_version,
            migrated: checkpoint.migrated,
            resumed: true,
        })
    }

    /// Writes the re-key marker inside the caller's transaction.
    ///
    /// The caller must hold the store gate exclusively.
    pub(crate) fn begin_rekey_tx(
        &self,
        conn: &Connection,
        master: &MasterKey,
        new_key: &DataKey,
    ) -> AppResult<RekeyCheckpoint> {
        if let Some(existing) = load_checkpoint(conn)? {
            return Err(StoreError::InterruptedRekey {
                from: existing.from_version,
                to: existing.to_version,
            }
            .into());
        }

        let from_version =
            current_version(conn)?.ok_or(StoreError::NotInitialized(self.kind()))?;
        let to_version = from_version + 1;
        let (pending_nonce, pending_wrapped_key) =
            aead::wrap_key(master, self.kind().purpose(), to_version, new_key)?;
        let started_at = Utc::now().to_rfc3339();

        conn.execute(
            r#"
            INSERT INTO rekey_state
                (id, from_version, to_version, pending_nonce, pending_wrapped_key, cursor, migrated, started_at)
            VALUES (1, ?1, ?2, ?3, ?4, NULL, 0, ?5)
            "#,
            params![
                from_version as i64,
                to_version as i64,
                pending_nonce,
                pending_wrapped_key,
                started_at
            ],
        )
        .map_err(DatabaseError::Sqlite)?;

        debug!(
            "Re-key marker written for {} store: {} -> {}",
            self.kind(),
            from_version,
            to_version
        );
        Ok(RekeyCheckpoint {
            from_version,
            to_version,
            pending_nonce,
            pending_wrapped_key,
            cursor: None,
            migrated: 0,
            started_at,
        })
    }

    /// Re-seals records batch by batch, persisting the cursor with each batch.
    ///
    /// Stops after `max_batches` batches when given. Returns `true` once no
    /// record under the source version remains.
    pub(crate) fn migrate(
        &self,
        old_key: &DataKey,
        new_key: &DataKey,
        checkpoint: &mut RekeyCheckpoint,
        max_batches: Option<u64>,
    ) -> AppResult<bool> {
        let mut batches = 0u64;
        loop {
            if max_batches.is_some_and(|max| batches >= max) {
                return Ok(false);
            }

            let mut conn = self.conn()?;
            let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;
            let batch = records::records_after(
                &tx,
                checkpoint.from_version,
                checkpoint.cursor.as_deref(),
                self.batch_size(),
            )?;
            if batch.is_empty() {
                return Ok(true);
            }

            let mut last_id = None;
            for sealed in &batch {
                let plaintext = aead::open_sealed(old_key, sealed)?;
                let (nonce, ciphertext) = aead::seal(
                    new_key.buffer(),
                    &record_aad(&sealed.id, checkpoint.to_version),
                    &plaintext,
                )?;
                records::upsert_record(
                    &tx,
                    &SealedRecord {
                        id: sealed.id.clone(),
                        key_version: checkpoint.to_version,
                        nonce,
                        ciphertext,
                    },
                )?;
                last_id = Some(sealed.id.clone());
            }

            let migrated = checkpoint.migrated + batch.len() as u64;
            tx.execute(
                "UPDATE rekey_state SET cursor = ?1, migrated = ?2 WHERE id = 1",
                params![last_id, migrated as i64],
            )
            .map_err(DatabaseError::Sqlite)?;
            tx.commit().map_err(DatabaseError::Sqlite)?;

            checkpoint.cursor = last_id;
            checkpoint.migrated = migrated;
            batches += 1;
            debug!("Re-key batch committed, {} records migrated", migrated);
        }
    }

    /// Atomically swaps the active key to the checkpoint's target version.
    pub(crate) fn commit_rekey(&self, checkpoint: &RekeyCheckpoint, new_key: &DataKey) -> AppResult<()> {
        let mut conn = self.conn()?;
        with_secure_delete(&mut *conn, |conn| {
            let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;

            let leftover = records::count_with_version(&tx, checkpoint.from_version)?;
            if leftover > 0 {
                warn!(
                    "{} records still under key version {} at commit",
                    leftover, checkpoint.from_version
                );
                return Err(StoreError::Corrupt(format!(
                    "{} records not migrated from key version {}",
                    leftover, checkpoint.from_version
                ))
                .into());
            }

            tx.execute(
                "INSERT OR REPLACE INTO key_slots (key_version, nonce, wrapped_key, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    checkpoint.to_version as i64,
                    checkpoint.pending_nonce,
                    checkpoint.pending_wrapped_key,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(DatabaseError::Sqlite)?;
            tx.execute(
                "DELETE FROM key_slots WHERE key_version <> ?1",
                params![checkpoint.to_version as i64],
            )
            .map_err(DatabaseError::Sqlite)?;
            tx.execute(
                "UPDATE store_meta SET key_version = ?1 WHERE id = 1",
                params![checkpoint.to_version as i64],
            )
            .map_err(DatabaseError::Sqlite)?;
            write_canary(&tx, new_key, checkpoint.to_version)?;
            tx.execute("DELETE FROM rekey_state WHERE id = 1", [])
                .map_err(DatabaseError::Sqlite)?;

            tx.commit().map_err(DatabaseError::Sqlite)?;
            Ok(())
        })?;

        info!(
            "{} store re-keyed {} -> {} ({} records)",
            self.kind(),
            checkpoint.from_version,
            checkpoint.to_version,
            checkpoint.migrated
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::init_store;
    use crate::store::StoreKind;
    use crate::AppError;
    use tempfile::TempDir;

    fn write_docs(store: &EncryptedStore, key: &DataKey, version: u64, count: usize) {
        let handle = store.handle(key, version);
        for i in 0..count {
            handle
                .write(&format!("doc-{:02}", i), format!("body {}", i).as_bytes(), &[], Utc::now())
                .unwrap();
        }
    }

    #[test]
    fn test_rekey_migrates_everything() {
        let temp_dir = TempDir::new().unwrap();
        let (store, master, data, version) = init_store(temp_dir.path(), StoreKind::Vault, 3);
        write_docs(&store, &data, version, 7);
        let before = store.sealed_record("doc-00").unwrap().unwrap();

        let new_key = DataKey::generate().unwrap();
        let report = store.rekey(&master, &data, &new_key).unwrap();

        assert_eq!(report.from_version, 1);
        assert_eq!(report.to_version, 2);
        assert_eq!(report.migrated, 7);
        assert!(!report.resumed);
        assert_eq!(store.key_version().unwrap(), 2);
        assert_eq!(store.key_slot_versions().unwrap(), [2]);
        assert!(store.pending_rekey().unwrap().is_none());

        let handle = store.handle(&new_key, 2);
        assert_eq!(handle.read("doc-06").unwrap().unwrap(), b"body 6");
        assert!(aead::open_sealed(&new_key, &before).is_err());

        let mut reopened = DataKey::empty();
        assert_eq!(store.open(&master, &mut reopened).unwrap(), 2);
        assert_eq!(reopened.buffer().as_bytes(), new_key.buffer().as_bytes());
    }

    #[test]
    fn test_interrupted_rekey_blocks_open_and_resumes() {
        let temp_dir = TempDir::new().unwrap();
        let (store, master, data, version) = init_store(temp_dir.path(), StoreKind::Library, 2);
        write_docs(&store, &data, version, 5);

        let new_key = DataKey::generate().unwrap();
        {
            let mut conn = store.conn().unwrap();
            let tx = conn.transaction().unwrap();
            let mut checkpoint = store.begin_rekey_tx(&tx, &master, &new_key).unwrap();
            tx.commit().unwrap();
            let done = store.migrate(&data, &new_key, &mut checkpoint, Some(1)).unwrap();
            assert!(!done);
        }

        let pending = store.pending_rekey().unwrap().unwrap();
        assert_eq!(pending.migrated, 2);
        assert_eq!(pending.cursor.as_deref(), Some("doc-01"));

        let mut out = DataKey::empty();
        let err = store.open(&master, &mut out).unwrap_err();
        assert!(err.is_interrupted_rekey());
        assert!(out.is_zeroed());

        let report = store.resume_rekey(&master, &mut out).unwrap();
        assert!(report.resumed);
        assert_eq!(report.migrated, 5);
        assert_eq!(out.buffer().as_bytes(), new_key.buffer().as_bytes());

        let handle = store.handle(&out, report.to_version);
        for i in 0..5 {
            let body = handle.read(&format!("doc-{:02}", i)).unwrap().unwrap();
            assert_eq!(body, format!("body {}", i).as_bytes());
        }
        assert_eq!(store.key_slot_versions().unwrap(), [2]);
    }

    #[test]
    fn test_handle_refused_while_rekey_pending() {
        let temp_dir = TempDir::new().unwrap();
        let (store, master, data, version) = init_store(temp_dir.path(), StoreKind::Vault, 2);
        write_docs(&store, &data, version, 4);

        let new_key = DataKey::generate().unwrap();
        {
            let mut conn = store.conn().unwrap();
            let tx = conn.transaction().unwrap();
            let mut checkpoint = store.begin_rekey_tx(&tx, &master, &new_key).unwrap();
            tx.commit().unwrap();
            store.migrate(&data, &new_key, &mut checkpoint, Some(1)).unwrap();
        }

        let handle = store.handle(&data, version);
        let err = handle.write("doc-00", b"late edit", &[], Utc::now()).unwrap_err();
        assert!(err.is_interrupted_rekey());
        assert!(handle.read("doc-03").unwrap_err().is_interrupted_rekey());
        assert!(handle.list().unwrap_err().is_interrupted_rekey());
        assert_eq!(
            store.sealed_record("doc-00").unwrap().unwrap().key_version,
            2
        );

        let mut out = DataKey::empty();
        let report = store.resume_rekey(&master, &mut out).unwrap();
        assert_eq!(report.migrated, 4);
        let handle = store.handle(&out, report.to_version);
        assert_eq!(handle.read("doc-00").unwrap().unwrap(), b"body 0");
    }

    #[test]
    fn test_handle_at_old_version_is_stale_after_rekey() {
        let temp_dir = TempDir::new().unwrap();
        let (store, master, data, version) = init_store(temp_dir.path(), StoreKind::Library, 2);
        write_docs(&store, &data, version, 2);

        let new_key = DataKey::generate().unwrap();
        store.rekey(&master, &data, &new_key).unwrap();

        let err = store
            .handle(&data, version)
            .write("doc-09", b"sealed under the old key", &[], Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Store(StoreError::StaleKey { held: 1, current: 2 })
        ));
        assert!(store.sealed_record("doc-09").unwrap().is_none());
    }

    #[test]
    fn test_rekey_excludes_concurrent_writes() {
        let temp_dir = TempDir::new().unwrap();
        let (store, master, data, version) = init_store(temp_dir.path(), StoreKind::Vault, 2);
        write_docs(&store, &data, version, 6);
        let new_key = DataKey::generate().unwrap();

        let written: Vec<String> = std::thread::scope(|scope| {
            let writer = scope.spawn(|| {
                let handle = store.handle(&data, version);
                (0..20)
                    .filter_map(|i| {
                        let id = format!("late-{:02}", i);
                        handle
                            .write(&id, id.as_bytes(), &[], Utc::now())
                            .ok()
                            .map(|_| id)
                    })
                    .collect::<Vec<_>>()
            });
            store.rekey(&master, &data, &new_key).unwrap();
            writer.join().unwrap()
        });

        // Writes either landed before the re-key and were migrated, or were
        // refused afterwards. Nothing is left sealed under the old key.
        let handle = store.handle(&new_key, 2);
        for id in &written {
            assert_eq!(handle.read(id).unwrap().unwrap(), id.as_bytes());
        }
        assert_eq!(handle.list().unwrap().len(), 6 + written.len());
        let conn = store.conn().unwrap();
        assert_eq!(records::count_with_version(&conn, 1).unwrap(), 0);
    }

    #[test]
    fn test_resume_with_wrong_master_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let (store, master, data, version) = init_store(temp_dir.path(), StoreKind::Vault, 2);
        write_docs(&store, &data, version, 3);

        let new_key = DataKey::generate().unwrap();
        {
            let mut conn = store.conn().unwrap();
            let tx = conn.transaction().unwrap();
            store.begin_rekey_tx(&tx, &master, &new_key).unwrap();
            tx.commit().unwrap();
        }

        let mut wrong = MasterKey::empty();
        wrong.buffer_mut().randomize().unwrap();
        let mut out = DataKey::empty();
        let err = store.resume_rekey(&wrong, &mut out).unwrap_err();
        assert!(err.is_wrong_passphrase());
        assert!(store.pending_rekey().unwrap().is_some());
    }

    #[test]
    fn test_resume_without_marker() {
        let temp_dir = TempDir::new().unwrap();
        let (store, master, _data, _) = init_store(temp_dir.path(), StoreKind::Vault, 2);
        let mut out = DataKey::empty();
        assert!(matches!(
            store.resume_rekey(&master, &mut out),
            Err(AppError::Store(StoreError::NoRekeyPending))
        ));
    }

    #[test]
    fn test_second_rekey_refused_while_pending() {
        let temp_dir = TempDir::new().unwrap();
        let (store, master, data, _) = init_store(temp_dir.path(), StoreKind::Vault, 2);
        let new_key = DataKey::generate().unwrap();
        {
            let mut conn = store.conn().unwrap();
            let tx = conn.transaction().unwrap();
            store.begin_rekey_tx(&tx, &master, &new_key).unwrap();
            tx.commit().unwrap();
        }

        let another = DataKey::generate().unwrap();
        let err = store.rekey(&master, &data, &another).unwrap_err();
        assert!(err.is_interrupted_rekey());
    }
}
