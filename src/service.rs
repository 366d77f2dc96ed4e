//! The vault call surface.
//!
//! [`VaultService`] holds the library and vault sessions side by side and is
//! the only type the presentation layer needs. Every read, write and deletion
//! is mediated by the store's [`SessionManager`], so nothing here ever sees a
//! key unless the session is unlocked.

use crate::audit::{
    AuditAction, AuditEntry, AuditFilter, AuditLog, AuditOutcome, ExportReport, VerifyReport,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::constants::AUDIT_DB_FILE;
use crate::crypto::KeyDerivationService;
use crate::deletion::{DeletionLevel, DeletionReport, DeletionRequest, SecureDeletionService};
use crate::errors::{AppError, AppResult, AuditError};
use crate::session::{SessionManager, SessionStatus};
use crate::store::{EncryptedStore, RecordMeta, RekeyCheckpoint, RekeyReport, StoreKind};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Both stores of one data directory behind their sessions.
///
/// # Example
///
/// ```no_run
/// use cloister::config::Settings;
/// use cloister::service::VaultService;
/// use cloister::store::StoreKind;
/// use secrecy::SecretString;
///
/// # fn main() -> cloister::AppResult<()> {
/// let settings = Settings::load()?;
/// let service = VaultService::open(&settings)?;
/// let passphrase = SecretString::from("correct horse battery staple".to_string());
///
/// service.unlock(StoreKind::Vault, &passphrase)?;
/// service.write(StoreKind::Vault, "note-1", b"sealed at rest", &["draft"])?;
/// service.lock(StoreKind::Vault);
/// # Ok(())
/// # }
/// ```
pub struct VaultService {
    library: SessionManager,
    vault: SessionManager,
    deletion: SecureDeletionService,
}

impl VaultService {
    /// Opens both stores under `settings.data_dir` using the system clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid, a store directory is held
    /// by another process, or a database cannot be opened.
    pub fn open(settings: &Settings) -> AppResult<Self> {
        Self::open_with_clock(settings, Arc::new(SystemClock))
    }

    /// Opens both stores with an explicit time source.
    pub fn open_with_clock(settings: &Settings, clock: Arc<dyn Clock>) -> AppResult<Self> {
        settings.validate()?;
        let library = open_session(settings, StoreKind::Library, Arc::clone(&clock))?;
        let vault = open_session(settings, StoreKind::Vault, clock)?;
        info!("Vault service opened");
        Ok(Self {
            library,
            vault,
            deletion: SecureDeletionService::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_deletion(mut self, deletion: SecureDeletionService) -> Self {
        self.deletion = deletion;
        self
    }

    /// The session gating `store`.
    pub fn session(&self, store: StoreKind) -> &SessionManager {
        match store {
            StoreKind::Library => &self.library,
            StoreKind::Vault => &self.vault,
        }
    }

    /// Whether `store` has a salt and key slot yet.
    pub fn is_initialized(&self, store: StoreKind) -> AppResult<bool> {
        self.session(store).store().is_initialized()
    }

    /// Creates `store`'s salt, first key version and canary. The store stays locked.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyInitialized` if the store exists, or
    /// `CryptoError::EmptyPassphrase` for an empty passphrase.
    pub fn initialize(&self, store: StoreKind, passphrase: &SecretString) -> AppResult<u64> {
        self.session(store).initialize(passphrase)
    }

    /// The checkpoint of an interrupted re-key, if one is pending.
    pub fn pending_rekey(&self, store: StoreKind) -> AppResult<Option<RekeyCheckpoint>> {
        self.session(store).store().pending_rekey()
    }

    /// Unlocks `store`.
    ///
    /// # Errors
    ///
    /// - `CryptoError::WrongPassphrase` on a bad passphrase (counts as a failure)
    /// - `SessionError::LockedOut` with the time left while locked out
    /// - `StoreError::InterruptedRekey` if a re-key must be resumed first
    pub fn unlock(&self, store: StoreKind, passphrase: &SecretString) -> AppResult<SessionStatus> {
        self.session(store).unlock(passphrase)
    }

    /// Locks `store`, scrubbing its keys. Locking a locked store is a no-op.
    pub fn lock(&self, store: StoreKind) {
        self.session(store).lock();
    }

    /// Locks both stores.
    pub fn lock_all(&self) {
        for kind in StoreKind::ALL {
            self.lock(kind);
        }
    }

    /// Current session state of `store`.
    pub fn status(&self, store: StoreKind) -> SessionStatus {
        self.session(store).status()
    }

    /// Pushes `store`'s idle deadline out by a full timeout and returns it.
    pub fn extend(&self, store: StoreKind) -> AppResult<DateTime<Utc>> {
        self.session(store).extend()
    }

    /// Seals `payload` under the current key and records a `write` audit entry.
    ///
    /// # Arguments
    ///
    /// * `store` - Target store; must be unlocked
    /// * `id` - Record id, reused ids overwrite
    /// * `payload` - Plaintext bytes
    /// * `tags` - Index tags, stored hashed
    ///
    /// # Errors
    ///
    /// Returns `AuditError::ChainTamperDetected` for the vault while its audit
    /// chain is marked compromised, and a session error while locked.
    pub fn write(&self, store: StoreKind, id: &str, payload: &[u8], tags: &[&str]) -> AppResult<()> {
        self.ensure_writable(store)?;
        let session = self.session(store);
        let now = session.clock().now();
        let result = session.with_unlocked(|s, keys| keys.handle(s).write(id, payload, tags, now));

        if let Some(audit) = session.audit() {
            let (outcome, detail) = match &result {
                Ok(()) => (AuditOutcome::Success, format!("bytes={}", payload.len())),
                Err(e) => (AuditOutcome::Failed, format!("error={}", e.kind())),
            };
            audit.append(AuditAction::Write, Some(id), outcome, &detail, now)?;
        }
        result
    }

    /// Decrypts the record `id`, or `None` if it does not exist.
    pub fn read(&self, store: StoreKind, id: &str) -> AppResult<Option<Vec<u8>>> {
        self.session(store)
            .with_unlocked(|s, keys| keys.handle(s).read(id))
    }

    /// Non-secret metadata of the record `id`.
    pub fn meta(&self, store: StoreKind, id: &str) -> AppResult<Option<RecordMeta>> {
        self.session(store)
            .with_unlocked(|s, keys| keys.handle(s).meta(id))
    }

    /// All record ids in `store`, sorted.
    pub fn list(&self, store: StoreKind) -> AppResult<Vec<String>> {
        self.session(store).with_unlocked(|s, keys| keys.handle(s).list())
    }

    /// Record ids carrying `tag`.
    pub fn find_by_tag(&self, store: StoreKind, tag: &str) -> AppResult<Vec<String>> {
        self.session(store)
            .with_unlocked(|s, keys| keys.handle(s).find_by_tag(tag))
    }

    /// Deletes a single record at `level`.
    pub fn delete(&self, store: StoreKind, target: &str, level: DeletionLevel) -> AppResult<DeletionReport> {
        self.delete_many(store, &DeletionRequest::single(target, level))
    }

    /// Deletes every target of `request` as one transaction.
    ///
    /// Exactly one `delete` audit entry is written per call, including calls
    /// refused before the deletion starts.
    ///
    /// # Errors
    ///
    /// - a session error while locked, expired or locked out
    /// - `AuditError::ChainTamperDetected` for the vault while its chain is
    ///   marked compromised
    /// - `DeletionError::PartialDeletionFailure` if a cascade step failed; no
    ///   layer was changed
    /// - `StoreError::InterruptedRekey` if a cryptographic deletion removed the
    ///   targets but did not finish re-keying. The session is locked and the
    ///   store must be resumed with [`VaultService::resume_rekey`].
    pub fn delete_many(&self, store: StoreKind, request: &DeletionRequest) -> AppResult<DeletionReport> {
        let session = self.session(store);
        let now = session.clock().now();
        let audit = session.audit().map(Arc::as_ref);

        if let Err(e) = self.ensure_writable(store) {
            audit_refused_delete(audit, request, &e, now);
            return Err(e);
        }

        let mut started = false;
        let result = session.with_unlocked(|s, keys| {
            started = true;
            self.deletion.delete(s, keys, audit, request, now)
        });
        match &result {
            Err(e) if !started => audit_refused_delete(audit, request, e, now),
            Err(e) if e.is_interrupted_rekey() => {
                warn!("{} store left mid re-key by a deletion", store);
            }
            _ => {}
        }
        result
    }

    /// Finishes an interrupted re-key and leaves `store` unlocked.
    pub fn resume_rekey(&self, store: StoreKind, passphrase: &SecretString) -> AppResult<RekeyReport> {
        self.session(store).resume_rekey(passphrase)
    }

    /// Rotates `store`'s passphrase, re-keying every record.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::WrongPassphrase` if `current` is not the
    /// passphrase the session was unlocked with.
    pub fn change_passphrase(
        &self,
        store: StoreKind,
        current: &SecretString,
        new: &SecretString,
    ) -> AppResult<u64> {
        self.ensure_writable(store)?;
        self.session(store).change_passphrase(current, new)
    }

    /// Entries of `store`'s audit log matching `filter`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::Disabled` if the store is not audited.
    pub fn audit_query(&self, store: StoreKind, filter: &AuditFilter) -> AppResult<Vec<AuditEntry>> {
        self.audit_log(store)?.query(filter)
    }

    /// Verifies `store`'s hash chain and records the verification.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::ChainTamperDetected` at the first divergent entry.
    /// From then on vault writes and deletions are refused.
    pub fn verify_audit(&self, store: StoreKind) -> AppResult<VerifyReport> {
        let log = self.audit_log(store)?;
        let report = log.verify()?;
        let now = self.session(store).clock().now();
        log.append(
            AuditAction::AuditVerified,
            None,
            AuditOutcome::Success,
            &format!("entries={}", report.entries),
            now,
        )?;
        Ok(report)
    }

    /// Writes `store`'s audit log to a tar.gz archive at `output`.
    pub fn export_audit(&self, store: StoreKind, output: &Path) -> AppResult<ExportReport> {
        let log = self.audit_log(store)?;
        let report = log.export_archive(output)?;
        let now = self.session(store).clock().now();
        log.append(
            AuditAction::AuditExported,
            None,
            AuditOutcome::Success,
            &format!("entries={} checksum={}", report.entries, report.checksum),
            now,
        )?;
        Ok(report)
    }

    fn audit_log(&self, store: StoreKind) -> AppResult<&AuditLog> {
        self.session(store)
            .audit()
            .map(Arc::as_ref)
            .ok_or_else(|| AuditError::Disabled.into())
    }

    /// Refuses vault mutations once its audit chain is known to be broken.
    fn ensure_writable(&self, store: StoreKind) -> AppResult<()> {
        if store.audit_mandatory() {
            self.audit_log(store)?.ensure_intact()?;
        }
        Ok(())
    }
}

/// Records a deletion that was refused before it could run.
fn audit_refused_delete(
    audit: Option<&AuditLog>,
    request: &DeletionRequest,
    error: &AppError,
    now: DateTime<Utc>,
) {
    let Some(log) = audit else {
        return;
    };
    let subject = request.targets.join("\n");
    let subject = (!subject.is_empty()).then_some(subject.as_str());
    let detail = format!("level={} error={}", request.level, error.kind());
    if let Err(e) = log.append(AuditAction::Delete, subject, AuditOutcome::Denied, &detail, now) {
        warn!("Failed to audit refused deletion: {}", e);
    }
}

fn open_session(settings: &Settings, kind: StoreKind, clock: Arc<dyn Clock>) -> AppResult<SessionManager> {
    let dir = settings.store_dir(kind);
    let store = Arc::new(EncryptedStore::load(&dir, kind, settings.rekey_batch_size)?);
    let audit = if settings.store_policy(kind).audit_enabled || kind.audit_mandatory() {
        Some(Arc::new(AuditLog::open(&dir.join(AUDIT_DB_FILE), kind)?))
    } else {
        debug!("Audit disabled for {} store", kind);
        None
    };
    SessionManager::new(
        store,
        KeyDerivationService::new(settings.kdf),
        settings.session_policy(kind)?,
        clock,
        audit,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::KdfParams;
    use crate::deletion::DeletionStep;
    use crate::errors::{DeletionError, SessionError, StoreError};
    use crate::session::SessionState;
    use chrono::Duration;
    use rusqlite::Connection;
    use tempfile::{tempdir, TempDir};

    fn settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::with_data_dir(dir.path().to_path_buf());
        settings.kdf = KdfParams::new(64, 1, 1).unwrap();
        settings.rekey_batch_size = 2;
        settings
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    fn delete_filter() -> AuditFilter {
        AuditFilter {
            action: Some(AuditAction::Delete),
            ..AuditFilter::default()
        }
    }

    fn unlocked(dir: &TempDir, clock: Arc<ManualClock>) -> VaultService {
        let service = VaultService::open_with_clock(&settings(dir), clock).unwrap();
        for kind in StoreKind::ALL {
            service.initialize(kind, &secret("pass")).unwrap();
            service.unlock(kind, &secret("pass")).unwrap();
        }
        service
    }

    #[test]
    fn test_stores_are_independent() {
        let dir = tempdir().unwrap();
        let service = unlocked(&dir, ManualClock::shared());

        service.write(StoreKind::Library, "a", b"library", &[]).unwrap();
        service.lock(StoreKind::Library);

        assert_eq!(service.status(StoreKind::Library).state, SessionState::Locked);
        assert_eq!(service.status(StoreKind::Vault).state, SessionState::Unlocked);
        assert!(service.list(StoreKind::Vault).unwrap().is_empty());
        assert!(matches!(
            service.read(StoreKind::Library, "a"),
            Err(AppError::Session(SessionError::Locked))
        ));
    }

    #[test]
    fn test_write_is_audited_with_hashed_subject() {
        let dir = tempdir().unwrap();
        let service = unlocked(&dir, ManualClock::shared());
        service.write(StoreKind::Vault, "secret-id", b"x", &[]).unwrap();

        let filter = AuditFilter {
            action: Some(AuditAction::Write),
            ..AuditFilter::default()
        };
        let entries = service.audit_query(StoreKind::Vault, &filter).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Success);
        assert_ne!(entries[0].subject.as_deref(), Some("secret-id"));
    }

    #[test]
    fn test_library_audit_can_be_disabled() {
        let dir = tempdir().unwrap();
        let mut settings = settings(&dir);
        settings.library.audit_enabled = false;
        let service = VaultService::open(&settings).unwrap();

        assert!(matches!(
            service.audit_query(StoreKind::Library, &AuditFilter::default()),
            Err(AppError::Audit(AuditError::Disabled))
        ));
        assert!(service
            .audit_query(StoreKind::Vault, &AuditFilter::default())
            .is_ok());
    }

    #[test]
    fn test_tampered_vault_audit_refuses_writes() {
        let dir = tempdir().unwrap();
        let service = unlocked(&dir, ManualClock::shared());
        service.write(StoreKind::Vault, "a", b"1", &[]).unwrap();
        service.write(StoreKind::Vault, "b", b"2", &[]).unwrap();

        let audit_path = dir.path().join("vault").join(AUDIT_DB_FILE);
        Connection::open(&audit_path)
            .unwrap()
            .execute("UPDATE audit_log SET outcome = 'denied' WHERE sequence = 3", [])
            .unwrap();

        assert!(matches!(
            service.verify_audit(StoreKind::Vault),
            Err(AppError::Audit(AuditError::ChainTamperDetected { sequence: 3 }))
        ));
        assert!(matches!(
            service.write(StoreKind::Vault, "c", b"3", &[]),
            Err(AppError::Audit(AuditError::ChainTamperDetected { .. }))
        ));
        assert!(matches!(
            service.delete(StoreKind::Vault, "a", DeletionLevel::Standard),
            Err(AppError::Audit(AuditError::ChainTamperDetected { .. }))
        ));
        let deletes = service
            .audit_query(StoreKind::Vault, &delete_filter())
            .unwrap();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].outcome, AuditOutcome::Denied);
        assert!(deletes[0].detail.contains("error=audit_tamper"));
        // Reads stay available.
        assert_eq!(service.read(StoreKind::Vault, "a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_verify_audit_appends_entry() {
        let dir = tempdir().unwrap();
        let service = unlocked(&dir, ManualClock::shared());
        let before = service
            .audit_query(StoreKind::Vault, &AuditFilter::default())
            .unwrap()
            .len();

        let report = service.verify_audit(StoreKind::Vault).unwrap();
        assert_eq!(report.entries as usize, before);

        let entries = service
            .audit_query(StoreKind::Vault, &AuditFilter::default())
            .unwrap();
        assert_eq!(entries.len(), before + 1);
        assert_eq!(entries.last().unwrap().action, AuditAction::AuditVerified);
    }

    #[test]
    fn test_expired_session_refuses_delete() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::shared();
        let service = unlocked(&dir, Arc::clone(&clock));
        service.write(StoreKind::Vault, "a", b"1", &[]).unwrap();

        clock.advance(Duration::seconds(121));
        assert!(matches!(
            service.delete(StoreKind::Vault, "a", DeletionLevel::Secure),
            Err(AppError::Session(SessionError::SessionExpired))
        ));
        assert!(service.session(StoreKind::Vault).key_is_scrubbed());
    }

    #[test]
    fn test_failed_deletion_keeps_session_unlocked() {
        let dir = tempdir().unwrap();
        let service = unlocked(&dir, ManualClock::shared())
            .with_deletion(SecureDeletionService::with_fault_at(DeletionStep::Metadata));
        service.write(StoreKind::Vault, "a", b"1", &[]).unwrap();

        let err = service
            .delete(StoreKind::Vault, "a", DeletionLevel::Cryptographic)
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Deletion(DeletionError::PartialDeletionFailure {
                step: DeletionStep::Metadata,
                ..
            })
        ));
        assert_eq!(service.status(StoreKind::Vault).state, SessionState::Unlocked);
        assert_eq!(service.read(StoreKind::Vault, "a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_refused_deletions_are_audited_once() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::shared();
        let service = unlocked(&dir, Arc::clone(&clock));
        service.write(StoreKind::Vault, "d", b"1", &[]).unwrap();
        service.lock(StoreKind::Vault);

        assert!(matches!(
            service.delete(StoreKind::Vault, "d", DeletionLevel::Cryptographic),
            Err(AppError::Session(SessionError::Locked))
        ));
        let deletes = service
            .audit_query(StoreKind::Vault, &delete_filter())
            .unwrap();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].outcome, AuditOutcome::Denied);
        assert!(deletes[0].subject.is_some());
        assert_ne!(deletes[0].subject.as_deref(), Some("d"));
        assert!(deletes[0].detail.contains("level=cryptographic"));
        assert!(deletes[0].detail.contains("error=locked"));

        service.unlock(StoreKind::Vault, &secret("pass")).unwrap();
        clock.advance(Duration::seconds(121));
        assert!(matches!(
            service.delete(StoreKind::Vault, "d", DeletionLevel::Standard),
            Err(AppError::Session(SessionError::SessionExpired))
        ));
        let deletes = service
            .audit_query(StoreKind::Vault, &delete_filter())
            .unwrap();
        assert_eq!(deletes.len(), 2);
        assert!(deletes[1].detail.contains("error=session_expired"));
    }

    #[test]
    fn test_interrupted_cryptographic_deletion_resumes() {
        let dir = tempdir().unwrap();
        let service = unlocked(&dir, ManualClock::shared())
            .with_deletion(SecureDeletionService::with_rekey_fault());
        for id in ["a", "b", "c", "d", "e"] {
            service.write(StoreKind::Vault, id, id.as_bytes(), &[]).unwrap();
        }

        let err = service
            .delete(StoreKind::Vault, "b", DeletionLevel::Cryptographic)
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Store(StoreError::InterruptedRekey { from: 1, to: 2 })
        ));
        assert_eq!(service.status(StoreKind::Vault).state, SessionState::Locked);
        assert!(service.session(StoreKind::Vault).key_is_scrubbed());
        assert!(service.pending_rekey(StoreKind::Vault).unwrap().is_some());
        assert!(service
            .unlock(StoreKind::Vault, &secret("pass"))
            .unwrap_err()
            .is_interrupted_rekey());

        let report = service.resume_rekey(StoreKind::Vault, &secret("pass")).unwrap();
        assert!(report.resumed);
        assert_eq!(report.to_version, 2);
        assert_eq!(report.migrated, 4);

        let status = service.status(StoreKind::Vault);
        assert_eq!(status.state, SessionState::Unlocked);
        assert_eq!(status.key_version, Some(2));
        assert!(service.pending_rekey(StoreKind::Vault).unwrap().is_none());
        assert_eq!(service.read(StoreKind::Vault, "b").unwrap(), None);
        for id in ["a", "c", "d", "e"] {
            assert_eq!(
                service.read(StoreKind::Vault, id).unwrap(),
                Some(id.as_bytes().to_vec())
            );
        }
        assert_eq!(
            service.session(StoreKind::Vault).store().key_slot_versions().unwrap(),
            [2]
        );

        let deletes = service
            .audit_query(StoreKind::Vault, &delete_filter())
            .unwrap();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].outcome, AuditOutcome::Failed);
    }
}
