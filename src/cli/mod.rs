pub mod passphrase;

use crate::audit::{AuditAction, AuditFilter};
use crate::constants::{APP_NAME, DEFAULT_LOG_LEVEL, LOG_FORMAT_JSON, LOG_FORMAT_TEXT};
use crate::deletion::DeletionLevel;
use crate::store::StoreKind;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Local encrypted data vault with sessions, secure deletion and audit
#[derive(Parser, Debug)]
#[command(name = APP_NAME, author, version, long_about = None)]
pub struct CliArgs {
    /// Store to operate on (library or vault)
    #[arg(short = 's', long, global = true, default_value = "vault")]
    pub store: StoreKind,

    /// Log output format
    #[arg(long, global = true, default_value = LOG_FORMAT_TEXT,
          value_parser = [LOG_FORMAT_TEXT, LOG_FORMAT_JSON])]
    pub log_format: String,

    /// Log level filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create the store's salt and first key (prompts for a new passphrase)
    Init,

    /// Show whether the store is initialized, locked out or mid re-key
    Status,

    /// Encrypt and store a record, reading the payload from --file or stdin
    Put {
        /// Record id; an existing record is overwritten
        id: String,

        /// Index tag, may be repeated
        #[arg(short = 't', long = "tag")]
        tags: Vec<String>,

        /// Read the payload from this file instead of stdin
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,
    },

    /// Decrypt a record to stdout or --output
    Get {
        /// Record id
        id: String,

        /// Write the payload to this file instead of stdout
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },

    /// List record ids
    List {
        /// Only ids carrying this tag
        #[arg(short = 't', long)]
        tag: Option<String>,
    },

    /// Delete records from every layer in one transaction
    Delete {
        /// Record ids
        #[arg(required = true)]
        ids: Vec<String>,

        /// standard, secure or cryptographic
        #[arg(short = 'l', long, default_value = "secure")]
        level: DeletionLevel,
    },

    /// Query the audit log
    Audit(AuditArgs),

    /// Verify the audit hash chain
    VerifyAudit,

    /// Export the audit log to a tar.gz archive
    ExportAudit {
        /// Archive path
        output: PathBuf,
    },

    /// Finish an interrupted re-key
    ResumeRekey,

    /// Change the store passphrase, re-keying every record
    Passwd,
}

#[derive(Args, Debug, PartialEq, Eq)]
pub struct AuditArgs {
    /// Only entries at or after this RFC 3339 instant
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,

    /// Only entries at or before this RFC 3339 instant
    #[arg(long)]
    pub until: Option<DateTime<Utc>>,

    /// Only entries with this action (e.g. delete, unlock, lockout-started)
    #[arg(short = 'a', long)]
    pub action: Option<AuditAction>,

    /// Return at most this many entries
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Print entries as JSON lines
    #[arg(long)]
    pub json: bool,
}

impl AuditArgs {
    /// Builds the query filter for `store`.
    pub fn filter(&self, store: StoreKind) -> AuditFilter {
        AuditFilter {
            since: self.since,
            until: self.until,
            action: self.action,
            store: Some(store),
            limit: self.limit,
        }
    }
}
