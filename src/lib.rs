/*!
# Cloister

Cloister is the security subsystem of a local data vault. It keeps two encrypted
stores, a general-purpose `library` and a high-sensitivity `vault`, and gates every
access to them through a session that must be unlocked with a passphrase.

## Core Features

- Argon2id key derivation with purpose separation between stores
- XChaCha20-Poly1305 encryption of every record at rest, under a versioned data key
- Sessions with idle timeout and failed-attempt lockout
- Standard, secure and cryptographic deletion across index, metadata and content
- Resumable, checkpointed re-keying
- Hash-chained audit log with verification and archive export

## Architecture

- `crypto`: key derivation, key-buffer hygiene and record sealing
- `store`: the encrypted store and its re-key migration
- `session`: the per-store lock state machine
- `deletion`: transactional secure deletion
- `audit`: the hash-chained audit log
- `service`: the call surface holding both stores
- `config`, `errors`, `clock`, `cli`: ambient plumbing

## Usage Example

```rust,no_run
use cloister::{Settings, StoreKind, VaultService};
use secrecy::SecretString;

fn main() -> cloister::AppResult<()> {
    let settings = Settings::load()?;
    let service = VaultService::open(&settings)?;
    let passphrase = SecretString::from("correct horse battery staple".to_string());

    if !service.is_initialized(StoreKind::Vault)? {
        service.initialize(StoreKind::Vault, &passphrase)?;
    }
    service.unlock(StoreKind::Vault, &passphrase)?;
    service.write(StoreKind::Vault, "passport", b"scan bytes", &["identity"])?;
    service.lock(StoreKind::Vault);
    Ok(())
}
```
*/

/// Hash-chained audit log
pub mod audit;
/// Command-line interface for parsing and handling user arguments
pub mod cli;
/// Time source abstraction
pub mod clock;
/// Configuration loading and management
pub mod config;
/// Application-wide constants
pub mod constants;
/// Key derivation, memory hygiene and record encryption
pub mod crypto;
/// Transactional secure deletion
pub mod deletion;
/// Error types and utilities for error handling
pub mod errors;
/// The vault call surface
pub mod service;
/// Session state machine
pub mod session;
/// Encrypted store and re-key migration
pub mod store;

// Re-export important types for convenience
pub use audit::{AuditAction, AuditEntry, AuditFilter, AuditOutcome};
pub use cli::CliArgs;
pub use config::Settings;
pub use deletion::{DeletionLevel, DeletionReport, DeletionRequest};
pub use errors::{AppError, AppResult};
pub use service::VaultService;
pub use session::{SessionState, SessionStatus};
pub use store::StoreKind;
