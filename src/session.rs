//! Session lifecycle with idle timeout and failed-attempt lockout.
//!
//! A [`SessionManager`] gates all access to one store. It owns that store's
//! key material in long-lived pinned buffers which are filled on unlock and
//! scrubbed in place on lock, so "locked" always means "keys are zero".
//!
//! ```text
//!   Locked --unlock ok--> Unlocked --lock / idle timeout--> Locked
//!   Locked --unlock bad--> Locked (failed_attempts + 1)
//!   Locked --unlock bad, threshold reached--> LockedOut
//!   LockedOut --lockout elapsed--> Locked (failed_attempts = 0)
//! ```
//!
//! Expiry is enforced twice: a watchdog thread per unlock scrubs the keys when
//! the deadline passes, and every call re-checks the deadline against the
//! injected [`Clock`] before doing anything.

use crate::audit::{AuditAction, AuditLog, AuditOutcome};
use crate::clock::Clock;
use crate::crypto::{DataKey, KeyDerivationService, MasterKey, Salt};
use crate::errors::{AppError, AppResult, CryptoError, SessionError, StoreError};
use crate::store::{EncryptedStore, Handle, LockoutRecord, StoreKind};
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

/// Observable state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Locked,
    Unlocked,
    LockedOut,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Locked => "locked",
            SessionState::Unlocked => "unlocked",
            SessionState::LockedOut => "locked_out",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of a session. Contains no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub store: StoreKind,
    pub state: SessionState,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub failed_attempts: u32,
    pub lockout_until: Option<DateTime<Utc>>,
    pub key_version: Option<u64>,
}

/// Timing and lockout rules for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub idle_timeout: Duration,
    pub max_failed_attempts: u32,
    pub lockout: Duration,
    /// How often the watchdog re-reads the clock.
    pub watchdog_interval: std::time::Duration,
}

/// Keys and version of an unlocked session, lent to an operation.
pub(crate) struct ActiveKeys<'a> {
    pub master: &'a mut MasterKey,
    pub data: &'a mut DataKey,
    pub key_version: &'a mut u64,
}

impl ActiveKeys<'_> {
    pub fn handle<'s>(&'s self, store: &'s EncryptedStore) -> Handle<'s> {
        store.handle(&*self.data, *self.key_version)
    }
}

struct SessionInner {
    state: SessionState,
    master: MasterKey,
    data: DataKey,
    key_version: Option<u64>,
    unlocked_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    failed_attempts: u32,
    lockout_until: Option<DateTime<Utc>>,
    /// Set when the idle timer locked the session; cleared by unlock or lock.
    expired: bool,
    /// Bumped on every unlock and lock so stale watchdogs exit.
    generation: u64,
}

impl SessionInner {
    fn scrub_keys(&mut self) {
        self.master.scrub();
        self.data.scrub();
        self.key_version = None;
        self.unlocked_at = None;
        self.expires_at = None;
        self.generation += 1;
    }

    fn lockout_record(&self) -> LockoutRecord {
        LockoutRecord {
            failed_attempts: self.failed_attempts,
            lockout_until: self.lockout_until,
        }
    }
}

struct SessionShared {
    inner: Mutex<SessionInner>,
    wake: Condvar,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State transitions that happened while refreshing, to be audited after the
/// session mutex is released.
#[derive(Debug, Default)]
struct Transitions {
    expired: bool,
    lockout_elapsed: bool,
}

/// Access gate and key owner for one store.
pub struct SessionManager {
    store: Arc<EncryptedStore>,
    kdf: KeyDerivationService,
    policy: SessionPolicy,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<AuditLog>>,
    shared: Arc<SessionShared>,
    unlock_gate: Mutex<()>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("store", &self.store.kind())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a locked session over `store`.
    ///
    /// Persisted failed-attempt state is restored, so a lockout survives a
    /// restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted lockout state cannot be read.
    pub fn new(
        store: Arc<EncryptedStore>,
        kdf: KeyDerivationService,
        policy: SessionPolicy,
        clock: Arc<dyn Clock>,
        audit: Option<Arc<AuditLog>>,
    ) -> AppResult<Self> {
        let record = store.load_lockout()?;
        let now = clock.now();
        let mut inner = SessionInner {
            state: SessionState::Locked,
            master: MasterKey::empty(),
            data: DataKey::empty(),
            key_version: None,
            unlocked_at: None,
            expires_at: None,
            failed_attempts: record.failed_attempts,
            lockout_until: record.lockout_until,
            expired: false,
            generation: 0,
        };
        match record.lockout_until {
            Some(until) if until > now => inner.state = SessionState::LockedOut,
            Some(_) => {
                inner.failed_attempts = 0;
                inner.lockout_until = None;
                store.save_lockout(&inner.lockout_record())?;
            }
            None => {}
        }

        debug!(
            "{} session created in state {} ({} prior failures)",
            store.kind(),
            inner.state,
            inner.failed_attempts
        );
        Ok(Self {
            store,
            kdf,
            policy,
            clock,
            audit,
            shared: Arc::new(SessionShared {
                inner: Mutex::new(inner),
                wake: Condvar::new(),
            }),
            unlock_gate: Mutex::new(()),
        })
    }

    /// Which store this session gates.
    pub fn kind(&self) -> StoreKind {
        self.store.kind()
    }

    /// The gated store. Everything it exposes without a key is ciphertext or metadata.
    pub fn store(&self) -> &EncryptedStore {
        &self.store
    }

    pub(crate) fn audit(&self) -> Option<&Arc<AuditLog>> {
        self.audit.as_ref()
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// The session's policy.
    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// Current state after applying any due timeout or lockout expiry.
    pub fn state(&self) -> SessionState {
        self.status().state
    }

    /// Snapshot of the session after applying any due timeout or lockout expiry.
    pub fn status(&self) -> SessionStatus {
        let now = self.clock.now();
        let mut inner = self.shared.lock();
        let transitions = self.refresh(&mut inner, now);
        let status = SessionStatus {
            store: self.kind(),
            state: inner.state,
            unlocked_at: inner.unlocked_at,
            expires_at: inner.expires_at,
            failed_attempts: inner.failed_attempts,
            lockout_until: inner.lockout_until,
            key_version: inner.key_version,
        };
        drop(inner);
        self.record_transitions(&transitions, now);
        status
    }

    /// `true` when both key buffers hold only zeros.
    pub fn key_is_scrubbed(&self) -> bool {
        let inner = self.shared.lock();
        inner.master.is_zeroed() && inner.data.is_zeroed()
    }

    /// Derives a salt and key for an uninitialized store and creates it.
    ///
    /// The session stays locked.
    ///
    /// # Errors
    ///
    /// - `CryptoError::EmptyPassphrase` for an empty passphrase
    /// - `StoreError::AlreadyInitialized` if the store already exists
    pub fn initialize(&self, passphrase: &SecretString) -> AppResult<u64> {
        let _serial = self.unlock_gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.store.is_initialized()? {
            return Err(StoreError::AlreadyInitialized(self.kind()).into());
        }

        let salt = Salt::generate()?;
        let master = self.kdf.derive(passphrase, &salt, self.kind().purpose())?;
        let version = self.store.initialize(&salt, &master)?;

        self.record(
            AuditAction::StoreInitialized,
            AuditOutcome::Success,
            &format!("key_version={}", version),
            self.clock.now(),
        );
        Ok(version)
    }

    /// Attempts to unlock with `passphrase`.
    ///
    /// # Errors
    ///
    /// - `SessionError::LockedOut` while a lockout is active; the failure
    ///   counter is not touched and no key is derived
    /// - `SessionError::AlreadyUnlocked` if the session is already unlocked
    /// - `CryptoError::WrongPassphrase` on a failed attempt, which counts
    ///   towards the lockout threshold
    /// - `StoreError::InterruptedRekey` if the store needs
    ///   [`SessionManager::resume_rekey`]; the passphrase was correct
    pub fn unlock(&self, passphrase: &SecretString) -> AppResult<SessionStatus> {
        let _serial = self.unlock_gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.admit_attempt(true)?;

        let mut master = MasterKey::empty();
        let mut data = DataKey::empty();
        let opened = self
            .derive_master(passphrase, &mut master)
            .and_then(|_| self.store.open(&master, &mut data));

        match opened {
            Ok(version) => {
                self.install_keys(&master, &data, version)?;
                info!("{} session unlocked", self.kind());
                Ok(self.status())
            }
            Err(e) => self.handle_failed_open(AuditAction::Unlock, e),
        }
    }

    /// Completes an interrupted re-key and unlocks.
    ///
    /// Counts as an unlock attempt for lockout purposes.
    pub fn resume_rekey(&self, passphrase: &SecretString) -> AppResult<crate::store::RekeyReport> {
        let _serial = self.unlock_gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.admit_attempt(false)?;

        let mut master = MasterKey::empty();
        let mut data = DataKey::empty();
        let resumed = self
            .derive_master(passphrase, &mut master)
            .and_then(|_| self.store.resume_rekey(&master, &mut data));

        match resumed {
            Ok(report) => {
                {
                    let mut inner = self.shared.lock();
                    if inner.state == SessionState::Unlocked {
                        inner.scrub_keys();
                        inner.state = SessionState::Locked;
                        self.shared.wake.notify_all();
                    }
                }
                self.install_keys(&master, &data, report.to_version)?;
                self.record(
                    AuditAction::Rekey,
                    AuditOutcome::Success,
                    &format!(
                        "resumed {} -> {}, migrated={}",
                        report.from_version, report.to_version, report.migrated
                    ),
                    self.clock.now(),
                );
                Ok(report)
            }
            Err(e) => self.handle_failed_open(AuditAction::Unlock, e),
        }
    }

    /// Scrubs the keys and locks. A no-op when not unlocked.
    pub fn lock(&self) {
        let now = self.clock.now();
        let mut inner = self.shared.lock();
        let transitions = self.refresh(&mut inner, now);
        let was_unlocked = inner.state == SessionState::Unlocked;
        if was_unlocked {
            inner.scrub_keys();
            inner.state = SessionState::Locked;
        }
        inner.expired = false;
        drop(inner);
        self.shared.wake.notify_all();

        self.record_transitions(&transitions, now);
        if was_unlocked {
            info!("{} session locked", self.kind());
            self.record(AuditAction::Lock, AuditOutcome::Success, "", now);
        }
    }

    /// Pushes the idle deadline out by a full timeout.
    ///
    /// # Errors
    ///
    /// Fails with the same errors as any gated operation when not unlocked.
    pub fn extend(&self) -> AppResult<DateTime<Utc>> {
        self.with_unlocked(|_, _| Ok(()))?;
        let inner = self.shared.lock();
        inner
            .expires_at
            .ok_or_else(|| SessionError::Locked.into())
    }

    /// Changes the passphrase.
    ///
    /// Records are first re-keyed to a fresh data key under the current master
    /// key, then the new key slot is re-wrapped under the new master key. The
    /// session must be unlocked and `current` must match it.
    ///
    /// # Errors
    ///
    /// - `CryptoError::WrongPassphrase` if `current` does not match; this
    ///   counts towards the lockout threshold like a failed unlock
    /// - `StoreError::InterruptedRekey` if the re-key could not finish; the
    ///   session is locked and the store must be resumed
    pub fn change_passphrase(&self, current: &SecretString, new: &SecretString) -> AppResult<u64> {
        if new.expose_secret().is_empty() {
            return Err(CryptoError::EmptyPassphrase.into());
        }
        let _serial = self.unlock_gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.admit_attempt(false)?;

        let salt = self.store.salt()?;
        let mut current_master = MasterKey::empty();
        self.kdf
            .derive_into(current, &salt, self.kind().purpose(), &mut current_master)?;
        let new_master = self.kdf.derive(new, &salt, self.kind().purpose())?;

        let version = self.with_unlocked(|store, keys| {
            if *keys.master != current_master {
                return Err(CryptoError::WrongPassphrase.into());
            }

            let new_key = DataKey::generate()?;
            let report = store.rekey(&*keys.master, &*keys.data, &new_key)?;
            keys.data.replace_with(&new_key);
            *keys.key_version = report.to_version;
            store.rewrap(&*keys.master, &new_master)?;
            keys.master.buffer_mut().copy_from(new_master.buffer());
            Ok(report.to_version)
        });

        let now = self.clock.now();
        match version {
            Ok(version) => {
                info!("{} passphrase rotated, key version {}", self.kind(), version);
                self.record(
                    AuditAction::PassphraseRotated,
                    AuditOutcome::Success,
                    &format!("key_version={}", version),
                    now,
                );
                Ok(version)
            }
            Err(e) if e.is_wrong_passphrase() => {
                self.handle_failed_open(AuditAction::PassphraseRotated, e)
            }
            Err(e) => {
                self.record(AuditAction::PassphraseRotated, AuditOutcome::Failed, e.kind(), now);
                Err(e)
            }
        }
    }

    /// Runs `f` with the unlocked keys, sliding the idle deadline.
    ///
    /// The session mutex is held for the duration, so the watchdog cannot
    /// scrub keys out from under a running operation. If `f` reports an
    /// interrupted re-key the session is locked before returning.
    pub(crate) fn with_unlocked<T>(
        &self,
        f: impl FnOnce(&EncryptedStore, &mut ActiveKeys<'_>) -> AppResult<T>,
    ) -> AppResult<T> {
        let now = self.clock.now();
        let mut inner = self.shared.lock();
        let transitions = self.refresh(&mut inner, now);

        let gate = match inner.state {
            SessionState::Unlocked => Ok(()),
            SessionState::LockedOut => Err(SessionError::LockedOut {
                remaining: remaining(inner.lockout_until, now),
            }),
            SessionState::Locked if inner.expired => Err(SessionError::SessionExpired),
            SessionState::Locked => Err(SessionError::Locked),
        };
        if let Err(e) = gate {
            drop(inner);
            self.record_transitions(&transitions, now);
            return Err(e.into());
        }

        inner.expires_at = Some(now + self.policy.idle_timeout);
        let result = {
            let SessionInner {
                master,
                data,
                key_version,
                ..
            } = &mut *inner;
            let Some(version) = key_version.as_mut() else {
                return Err(SessionError::Locked.into());
            };
            let mut keys = ActiveKeys {
                master,
                data,
                key_version: version,
            };
            f(&self.store, &mut keys)
        };

        if result.as_ref().is_err_and(AppError::is_interrupted_rekey) {
            inner.scrub_keys();
            inner.state = SessionState::Locked;
            inner.expired = false;
            drop(inner);
            self.shared.wake.notify_all();
            warn!("{} store has a pending re-key; session locked", self.kind());
            self.record(AuditAction::Lock, AuditOutcome::Success, "pending_rekey", now);
        }
        result
    }

    fn derive_master(&self, passphrase: &SecretString, out: &mut MasterKey) -> AppResult<()> {
        let salt = self.store.salt()?;
        self.kdf
            .derive_into(passphrase, &salt, self.kind().purpose(), out)
    }

    /// Rejects the attempt up front while locked out or already unlocked.
    fn admit_attempt(&self, refuse_if_unlocked: bool) -> AppResult<()> {
        let now = self.clock.now();
        let mut inner = self.shared.lock();
        let transitions = self.refresh(&mut inner, now);
        let verdict = match inner.state {
            SessionState::LockedOut => Err(SessionError::LockedOut {
                remaining: remaining(inner.lockout_until, now),
            }),
            SessionState::Unlocked if refuse_if_unlocked => Err(SessionError::AlreadyUnlocked),
            _ => Ok(()),
        };
        drop(inner);
        self.record_transitions(&transitions, now);

        if let Err(SessionError::LockedOut { .. }) = &verdict {
            self.record(AuditAction::Unlock, AuditOutcome::Denied, "locked_out", now);
        }
        verdict.map_err(AppError::from)
    }

    fn install_keys(&self, master: &MasterKey, data: &DataKey, version: u64) -> AppResult<()> {
        let now = self.clock.now();
        let generation = {
            let mut inner = self.shared.lock();
            self.store.save_lockout(&LockoutRecord::default())?;
            inner.master.buffer_mut().copy_from(master.buffer());
            inner.data.replace_with(data);
            inner.key_version = Some(version);
            inner.state = SessionState::Unlocked;
            inner.unlocked_at = Some(now);
            inner.expires_at = Some(now + self.policy.idle_timeout);
            inner.failed_attempts = 0;
            inner.lockout_until = None;
            inner.expired = false;
            inner.generation += 1;
            inner.generation
        };
        self.spawn_watchdog(generation);
        self.record(
            AuditAction::Unlock,
            AuditOutcome::Success,
            &format!("key_version={}", version),
            now,
        );
        Ok(())
    }

    /// Counts a wrong passphrase towards the lockout, recording it as `action`.
    ///
    /// Reaching the threshold scrubs the keys even if the session was unlocked.
    fn handle_failed_open<T>(&self, action: AuditAction, error: AppError) -> AppResult<T> {
        let now = self.clock.now();
        if error.is_interrupted_rekey() {
            let mut inner = self.shared.lock();
            inner.failed_attempts = 0;
            self.store.save_lockout(&inner.lockout_record())?;
            drop(inner);
            warn!("{} store has an interrupted re-key", self.kind());
            return Err(error);
        }
        if !error.is_wrong_passphrase() {
            return Err(error);
        }

        let mut inner = self.shared.lock();
        inner.failed_attempts += 1;
        let attempts = inner.failed_attempts;
        let locked_out = attempts >= self.policy.max_failed_attempts;
        if locked_out {
            if inner.state == SessionState::Unlocked {
                inner.scrub_keys();
            }
            inner.state = SessionState::LockedOut;
            inner.lockout_until = Some(now + self.policy.lockout);
        }
        let saved = self.store.save_lockout(&inner.lockout_record());
        drop(inner);
        if locked_out {
            self.shared.wake.notify_all();
        }
        saved?;

        warn!(
            "{} passphrase rejected for {} ({}/{})",
            self.kind(),
            action,
            attempts,
            self.policy.max_failed_attempts
        );
        self.record(
            action,
            AuditOutcome::Denied,
            &format!("wrong_passphrase attempt={}", attempts),
            now,
        );
        if locked_out {
            warn!("{} locked out after {} failures", self.kind(), attempts);
            self.record(
                AuditAction::LockoutStarted,
                AuditOutcome::Success,
                &format!("duration_secs={}", self.policy.lockout.num_seconds()),
                now,
            );
        }
        Err(error)
    }

    /// Applies timeout and lockout expiry. Must be called with the mutex held.
    fn refresh(&self, inner: &mut SessionInner, now: DateTime<Utc>) -> Transitions {
        let mut transitions = Transitions::default();
        match inner.state {
            SessionState::Unlocked => {
                if inner.expires_at.is_some_and(|deadline| now >= deadline) {
                    expire(inner);
                    self.shared.wake.notify_all();
                    transitions.expired = true;
                }
            }
            SessionState::LockedOut => {
                if inner.lockout_until.map_or(true, |until| now >= until) {
                    inner.state = SessionState::Locked;
                    inner.failed_attempts = 0;
                    inner.lockout_until = None;
                    if let Err(e) = self.store.save_lockout(&inner.lockout_record()) {
                        warn!("Failed to persist lockout reset: {}", e);
                    }
                    transitions.lockout_elapsed = true;
                }
            }
            SessionState::Locked => {}
        }
        transitions
    }

    fn record_transitions(&self, transitions: &Transitions, now: DateTime<Utc>) {
        if transitions.expired {
            info!("{} session expired", self.kind());
            self.record(AuditAction::SessionExpired, AuditOutcome::Success, "idle_timeout", now);
        }
        if transitions.lockout_elapsed {
            debug!("{} lockout elapsed", self.kind());
        }
    }

    /// Appends a lifecycle entry. Failures are logged, not propagated.
    fn record(&self, action: AuditAction, outcome: AuditOutcome, detail: &str, now: DateTime<Utc>) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(action, None, outcome, detail, now) {
                warn!("Failed to audit {} for {}: {}", action, self.kind(), e);
            }
        }
    }

    fn spawn_watchdog(&self, generation: u64) {
        let shared = Arc::clone(&self.shared);
        let clock = Arc::clone(&self.clock);
        let audit = self.audit.clone();
        let interval = self.policy.watchdog_interval;
        let kind = self.kind();

        let spawned = thread::Builder::new()
            .name(format!("{}-session-watchdog", kind))
            .spawn(move || {
                let mut inner = shared.lock();
                loop {
                    if inner.generation != generation || inner.state != SessionState::Unlocked {
                        return;
                    }
                    let now = clock.now();
                    if inner.expires_at.is_some_and(|deadline| now >= deadline) {
                        expire(&mut inner);
                        drop(inner);
                        shared.wake.notify_all();
                        info!("{} session expired (watchdog)", kind);
                        if let Some(audit) = audit {
                            if let Err(e) = audit.append(
                                AuditAction::SessionExpired,
                                None,
                                AuditOutcome::Success,
                                "idle_timeout",
                                now,
                            ) {
                                warn!("Failed to audit expiry for {}: {}", kind, e);
                            }
                        }
                        return;
                    }
                    inner = shared
                        .wake
                        .wait_timeout(inner, interval)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            });

        if let Err(e) = spawned {
            warn!(
                "Could not start {} session watchdog, relying on per-call expiry: {}",
                kind, e
            );
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.scrub_keys();
        inner.state = SessionState::Locked;
        drop(inner);
        self.shared.wake.notify_all();
    }
}

fn expire(inner: &mut SessionInner) {
    inner.scrub_keys();
    inner.state = SessionState::Locked;
    inner.expired = true;
}

fn remaining(until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> std::time::Duration {
    until
        .map(|until| (until - now).to_std().unwrap_or_default())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::KdfParams;
    use tempfile::TempDir;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    fn policy() -> SessionPolicy {
        SessionPolicy {
            idle_timeout: Duration::seconds(120),
            max_failed_attempts: 5,
            lockout: Duration::minutes(15),
            watchdog_interval: std::time::Duration::from_millis(10),
        }
    }

    fn setup(dir: &std::path::Path, clock: Arc<ManualClock>) -> SessionManager {
        let store = Arc::new(EncryptedStore::load(dir, StoreKind::Vault, 8).unwrap());
        let kdf = KeyDerivationService::new(KdfParams::new(64, 1, 1).unwrap());
        let session = SessionManager::new(store, kdf, policy(), clock, None).unwrap();
        session.initialize(&secret("open sesame")).unwrap();
        session
    }

    #[test]
    fn test_unlock_and_lock_scrubs_keys() {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::shared();
        let session = setup(temp_dir.path(), clock);

        let status = session.unlock(&secret("open sesame")).unwrap();
        assert_eq!(status.state, SessionState::Unlocked);
        assert_eq!(status.key_version, Some(1));
        assert!(!session.key_is_scrubbed());

        session.lock();
        assert_eq!(session.state(), SessionState::Locked);
        assert!(session.key_is_scrubbed());
    }

    #[test]
    fn test_timeout_on_simulated_clock() {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::shared();
        let session = setup(temp_dir.path(), clock.clone());
        session.unlock(&secret("open sesame")).unwrap();

        clock.advance(Duration::seconds(119));
        assert_eq!(session.state(), SessionState::Unlocked);

        clock.advance(Duration::seconds(1));
        assert_eq!(session.state(), SessionState::Locked);
        assert!(session.key_is_scrubbed());

        let err = session.with_unlocked(|_, _| Ok(())).unwrap_err();
        assert!(matches!(err, AppError::Session(SessionError::SessionExpired)));
    }

    #[test]
    fn test_watchdog_scrubs_without_any_call() {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::shared();
        let session = setup(temp_dir.path(), clock.clone());
        session.unlock(&secret("open sesame")).unwrap();

        clock.advance(Duration::seconds(121));
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !session.key_is_scrubbed() && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(session.key_is_scrubbed());
    }

    #[test]
    fn test_activity_slides_deadline() {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::shared();
        let session = setup(temp_dir.path(), clock.clone());
        session.unlock(&secret("open sesame")).unwrap();

        clock.advance(Duration::seconds(100));
        session.with_unlocked(|_, _| Ok(())).unwrap();
        clock.advance(Duration::seconds(100));
        assert_eq!(session.state(), SessionState::Unlocked);

        let before = session.status().expires_at.unwrap();
        clock.advance(Duration::seconds(10));
        let after = session.extend().unwrap();
        assert_eq!(after, clock.now() + Duration::seconds(120));
        assert!(after > before);
    }

    #[test]
    fn test_lockout_after_five_failures() {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::shared();
        let session = setup(temp_dir.path(), clock.clone());

        for attempt in 1..=5 {
            let err = session.unlock(&secret("nope")).unwrap_err();
            assert!(err.is_wrong_passphrase(), "attempt {}", attempt);
        }
        let status = session.status();
        assert_eq!(status.state, SessionState::LockedOut);
        assert_eq!(status.failed_attempts, 5);

        let err = session.unlock(&secret("open sesame")).unwrap_err();
        match err {
            AppError::Session(SessionError::LockedOut { remaining }) => {
                assert_eq!(remaining, std::time::Duration::from_secs(15 * 60));
            }
            other => panic!("expected LockedOut, got {:?}", other),
        }
        assert_eq!(session.status().failed_attempts, 5);

        clock.advance(Duration::minutes(15) - Duration::seconds(1));
        assert_eq!(session.state(), SessionState::LockedOut);

        clock.advance(Duration::seconds(1));
        let status = session.status();
        assert_eq!(status.state, SessionState::Locked);
        assert_eq!(status.failed_attempts, 0);
        session.unlock(&secret("open sesame")).unwrap();
    }

    #[test]
    fn test_lockout_persists_across_restart() {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::shared();
        {
            let session = setup(temp_dir.path(), clock.clone());
            for _ in 0..5 {
                let _ = session.unlock(&secret("nope"));
            }
        }

        let store = Arc::new(EncryptedStore::load(temp_dir.path(), StoreKind::Vault, 8).unwrap());
        let kdf = KeyDerivationService::new(KdfParams::new(64, 1, 1).unwrap());
        let session = SessionManager::new(store, kdf, policy(), clock, None).unwrap();
        assert_eq!(session.state(), SessionState::LockedOut);
    }

    #[test]
    fn test_success_resets_failed_attempts() {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::shared();
        let session = setup(temp_dir.path(), clock);

        let _ = session.unlock(&secret("nope"));
        let _ = session.unlock(&secret("nope"));
        assert_eq!(session.status().failed_attempts, 2);

        session.unlock(&secret("open sesame")).unwrap();
        assert_eq!(session.status().failed_attempts, 0);
    }

    #[test]
    fn test_change_passphrase() {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::shared();
        let session = setup(temp_dir.path(), clock);
        session.unlock(&secret("open sesame")).unwrap();
        session
            .with_unlocked(|store, keys| {
                keys.handle(store).write("a", b"kept", &[], Utc::now())
            })
            .unwrap();

        let wrong = session.change_passphrase(&secret("guess"), &secret("new words"));
        assert!(wrong.unwrap_err().is_wrong_passphrase());

        let version = session
            .change_passphrase(&secret("open sesame"), &secret("new words"))
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(session.status().key_version, Some(2));

        session.lock();
        assert!(session.key_is_scrubbed());
        assert!(session.unlock(&secret("open sesame")).is_err());
        session.unlock(&secret("new words")).unwrap();
        let body = session
            .with_unlocked(|store, keys| keys.handle(store).read("a"))
            .unwrap();
        assert_eq!(body.as_deref(), Some(&b"kept"[..]));
    }

    #[test]
    fn test_wrong_current_passphrase_counts_towards_lockout() {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::shared();
        let session = setup(temp_dir.path(), clock);
        session.unlock(&secret("open sesame")).unwrap();

        for attempt in 1..=4 {
            let err = session
                .change_passphrase(&secret("guess"), &secret("new words"))
                .unwrap_err();
            assert!(err.is_wrong_passphrase());
            assert_eq!(session.status().failed_attempts, attempt);
            assert_eq!(session.state(), SessionState::Unlocked);
        }

        let err = session
            .change_passphrase(&secret("guess"), &secret("new words"))
            .unwrap_err();
        assert!(err.is_wrong_passphrase());
        assert_eq!(session.state(), SessionState::LockedOut);
        assert!(session.key_is_scrubbed());
        assert!(matches!(
            session.change_passphrase(&secret("open sesame"), &secret("new words")),
            Err(AppError::Session(SessionError::LockedOut { .. }))
        ));
    }

    #[test]
    fn test_pending_rekey_locks_unlocked_session() {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::shared();
        let session = setup(temp_dir.path(), clock);
        session.unlock(&secret("open sesame")).unwrap();
        session
            .with_unlocked(|store, keys| keys.handle(store).write("a", b"kept", &[], Utc::now()))
            .unwrap();

        let store = session.store();
        let master = KeyDerivationService::new(KdfParams::new(64, 1, 1).unwrap())
            .derive(&secret("open sesame"), &store.salt().unwrap(), "vault")
            .unwrap();
        {
            let mut conn = store.conn().unwrap();
            let tx = conn.transaction().unwrap();
            store
                .begin_rekey_tx(&tx, &master, &DataKey::generate().unwrap())
                .unwrap();
            tx.commit().unwrap();
        }

        let err = session
            .change_passphrase(&secret("open sesame"), &secret("new words"))
            .unwrap_err();
        assert!(err.is_interrupted_rekey());
        assert_eq!(session.state(), SessionState::Locked);
        assert!(session.key_is_scrubbed());
        assert!(session.unlock(&secret("open sesame")).unwrap_err().is_interrupted_rekey());

        let report = session.resume_rekey(&secret("open sesame")).unwrap();
        assert_eq!(report.to_version, 2);
        let body = session
            .with_unlocked(|store, keys| keys.handle(store).read("a"))
            .unwrap();
        assert_eq!(body.as_deref(), Some(&b"kept"[..]));
    }

    #[test]
    fn test_unlock_stays_locked_when_lockout_reset_cannot_persist() {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::shared();
        let session = setup(temp_dir.path(), clock);
        let conn = session.store().conn().unwrap();
        conn.execute_batch(
            "CREATE TRIGGER refuse_guard BEFORE INSERT ON session_guard
             BEGIN SELECT RAISE(ABORT, 'session_guard is read-only'); END;",
        )
        .unwrap();

        let err = session.unlock(&secret("open sesame")).unwrap_err();
        assert!(!err.is_wrong_passphrase());
        assert_eq!(session.state(), SessionState::Locked);
        assert!(session.key_is_scrubbed());

        conn.execute_batch("DROP TRIGGER refuse_guard").unwrap();
        drop(conn);
        session.unlock(&secret("open sesame")).unwrap();
    }

    #[test]
    fn test_operations_refused_while_locked() {
        let temp_dir = TempDir::new().unwrap();
        let clock = ManualClock::shared();
        let session = setup(temp_dir.path(), clock);
        let err = session.with_unlocked(|_, _| Ok(())).unwrap_err();
        assert!(matches!(err, AppError::Session(SessionError::Locked)));
    }
}
