/*!
# Cloister - Local Encrypted Data Vault

Command-line front end of the cloister vault subsystem. Each invocation opens
both stores, unlocks the selected one if the command needs it, performs one
operation and locks everything again before exiting.

## Usage

```
cloister [OPTIONS] <COMMAND>

Commands:
  init          Create the store's salt and first key
  status        Show whether the store is initialized, locked out or mid re-key
  put           Encrypt and store a record
  get           Decrypt a record
  list          List record ids
  delete        Delete records from every layer in one transaction
  audit         Query the audit log
  verify-audit  Verify the audit hash chain
  export-audit  Export the audit log to a tar.gz archive
  resume-rekey  Finish an interrupted re-key
  passwd        Change the store passphrase

Options:
  -s, --store <STORE>            Store to operate on [default: vault]
      --log-format <LOG_FORMAT>  Log output format [default: text]
      --log-level <LOG_LEVEL>    Log level filter [default: info]
```

## Configuration

- `CLOISTER_DIR`: root directory of both stores (defaults to `~/.local/share/cloister`)
- `CLOISTER_PASSPHRASE`: passphrase for non-interactive use
- `CLOISTER_NEW_PASSPHRASE`: replacement passphrase for `passwd`
- See `cloister::config` for timeouts, KDF costs and lockout settings
*/

use clap::Parser;
use cloister::cli::passphrase::{read_new_passphrase, read_passphrase};
use cloister::cli::{CliArgs, Command};
use cloister::config::Settings;
use cloister::constants::{ENV_VAR_NEW_PASSPHRASE, ENV_VAR_PASSPHRASE, LOG_FORMAT_JSON};
use cloister::deletion::{DeletionReport, DeletionRequest};
use cloister::errors::{AppResult, DatabaseError};
use cloister::service::VaultService;
use cloister::store::StoreKind;
use std::fs;
use std::io::{self, Read, Write};
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_tracing(&args.log_format, &args.log_level);
    debug!("CLI arguments: {:?}", args);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind(), "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so `get` can stream a payload on stdout.
fn init_tracing(format: &str, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if format == LOG_FORMAT_JSON {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(args: CliArgs) -> AppResult<()> {
    let settings = Settings::load()?;
    debug!("Settings: {:?}", settings);
    let service = VaultService::open(&settings)?;

    let result = dispatch(&service, args.store, args.command);
    service.lock_all();
    result
}

fn dispatch(service: &VaultService, store: StoreKind, command: Command) -> AppResult<()> {
    let mut out = io::stdout().lock();
    match command {
        Command::Init => {
            let passphrase = read_new_passphrase(ENV_VAR_PASSPHRASE)?;
            let version = service.initialize(store, &passphrase)?;
            writeln!(out, "Initialized {} store (key version {})", store, version)?;
        }
        Command::Status => {
            let status = service.status(store);
            writeln!(out, "store: {}", store)?;
            writeln!(out, "initialized: {}", service.is_initialized(store)?)?;
            writeln!(out, "state: {}", status.state)?;
            writeln!(out, "failed_attempts: {}", status.failed_attempts)?;
            if let Some(until) = status.lockout_until {
                writeln!(out, "locked_out_until: {}", until.to_rfc3339())?;
            }
            if let Some(checkpoint) = service.pending_rekey(store)? {
                writeln!(
                    out,
                    "interrupted_rekey: {} -> {} ({} migrated)",
                    checkpoint.from_version, checkpoint.to_version, checkpoint.migrated
                )?;
            }
        }
        Command::Put { id, tags, file } => {
            let payload = match file {
                Some(path) => fs::read(path)?,
                None => {
                    let mut buf = Vec::new();
                    io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            unlock(service, store)?;
            let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
            service.write(store, &id, &payload, &tags)?;
            writeln!(out, "Stored {} ({} bytes)", id, payload.len())?;
        }
        Command::Get { id, output } => {
            unlock(service, store)?;
            let payload = service
                .read(store, &id)?
                .ok_or_else(|| DatabaseError::NotFound(id.clone()))?;
            match output {
                Some(path) => fs::write(path, &payload)?,
                None => out.write_all(&payload)?,
            }
        }
        Command::List { tag } => {
            unlock(service, store)?;
            let ids = match tag {
                Some(tag) => service.find_by_tag(store, &tag)?,
                None => service.list(store)?,
            };
            for id in ids {
                writeln!(out, "{}", id)?;
            }
        }
        Command::Delete { ids, level } => {
            unlock(service, store)?;
            let report = service.delete_many(store, &DeletionRequest { targets: ids, level })?;
            print_deletion(&mut out, &report)?;
        }
        Command::Audit(audit) => {
            let entries = service.audit_query(store, &audit.filter(store))?;
            for entry in entries {
                if audit.json {
                    writeln!(out, "{}", serde_json::to_string(&entry)?)?;
                } else {
                    writeln!(
                        out,
                        "{:>6}  {}  {:<18} {:<8} {}",
                        entry.sequence,
                        entry.timestamp,
                        entry.action,
                        entry.outcome,
                        entry.detail
                    )?;
                }
            }
        }
        Command::VerifyAudit => {
            let report = service.verify_audit(store)?;
            writeln!(
                out,
                "Audit chain intact: {} entries, head {}",
                report.entries, report.head_hash
            )?;
        }
        Command::ExportAudit { output } => {
            let report = service.export_audit(store, &output)?;
            writeln!(
                out,
                "Exported {} entries to {} ({} bytes, blake3 {})",
                report.entries,
                output.display(),
                report.archive_size,
                report.checksum
            )?;
            if let Some(sequence) = report.tamper_detected_at {
                writeln!(out, "WARNING: chain diverges at sequence {}", sequence)?;
            }
        }
        Command::ResumeRekey => {
            let passphrase = read_passphrase(ENV_VAR_PASSPHRASE, "Passphrase: ")?;
            let report = service.resume_rekey(store, &passphrase)?;
            writeln!(
                out,
                "Re-key {} -> {} completed ({} records migrated)",
                report.from_version, report.to_version, report.migrated
            )?;
        }
        Command::Passwd => {
            let current = read_passphrase(ENV_VAR_PASSPHRASE, "Current passphrase: ")?;
            service.unlock(store, &current)?;
            let new = read_new_passphrase(ENV_VAR_NEW_PASSPHRASE)?;
            let version = service.change_passphrase(store, &current, &new)?;
            writeln!(out, "Passphrase changed (key version {})", version)?;
        }
    }
    Ok(())
}

fn unlock(service: &VaultService, store: StoreKind) -> AppResult<()> {
    let passphrase = read_passphrase(ENV_VAR_PASSPHRASE, "Passphrase: ")?;
    let status = service.unlock(store, &passphrase)?;
    info!("{} store unlocked at key version {:?}", store, status.key_version);
    Ok(())
}

fn print_deletion(out: &mut impl Write, report: &DeletionReport) -> io::Result<()> {
    writeln!(
        out,
        "Deleted {} record(s) at level {}",
        report.targets.len(),
        report.level
    )?;
    for id in &report.missing {
        writeln!(out, "not found: {}", id)?;
    }
    if let Some(version) = report.new_key_version {
        writeln!(out, "Store re-keyed to version {}", version)?;
    }
    Ok(())
}
