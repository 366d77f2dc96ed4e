//! Store schema definitions and initialization.
//!
//! One SQLite file per store holds the plaintext key-management records (salt,
//! key version, wrapped key slots, canary) and the three data layers a record
//! touches: the content layer (`records`), the metadata layer (`record_meta`)
//! and the index layer (`record_index`). The layers deliberately have no
//! foreign keys between them; deletion removes each one explicitly so that a
//! cascade step can be observed and rolled back.

use crate::errors::{AppResult, DatabaseError};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
///
/// Increment this whenever schema changes are made to support future migrations.
pub const SCHEMA_VERSION: i32 = 1;

/// Creates all store tables and indexes.
///
/// This function is idempotent - it uses `CREATE TABLE IF NOT EXISTS`
/// so it's safe to call multiple times.
///
/// # Tables
///
/// - `store_meta`: singleton with purpose, salt and current key version
/// - `key_slots`: data keys wrapped under the master key, one per live version
/// - `canary`: known plaintext sealed under the current data key
/// - `records`: content layer (ciphertext)
/// - `record_meta`: metadata layer
/// - `record_index`: index layer (hashed tags)
/// - `rekey_state`: transient marker, present only while a re-key is incomplete
/// - `session_guard`: persisted failed-attempt counter and lockout deadline
///
/// # Errors
///
/// Returns an error if any DDL statement fails.
pub fn create_tables(conn: &Connection) -> AppResult<()> {
    debug!("Creating store tables");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS store_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            purpose TEXT NOT NULL,
            salt BLOB NOT NULL,
            key_version INTEGER NOT NULL,
            schema_version INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS key_slots (
            key_version INTEGER PRIMARY KEY,
            nonce BLOB NOT NULL,
            wrapped_key BLOB NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS canary (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            key_version INTEGER NOT NULL,
            nonce BLOB NOT NULL,
            ciphertext BLOB NOT NULL
        );
        "#,
    )
    .map_err(DatabaseError::Sqlite)?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            key_version INTEGER NOT NULL,
            nonce BLOB NOT NULL,
            ciphertext BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_records_key_version ON records(key_version);

        CREATE TABLE IF NOT EXISTS record_meta (
            record_id TEXT PRIMARY KEY,
            byte_len INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS record_index (
            tag_hash TEXT NOT NULL,
            record_id TEXT NOT NULL,
            PRIMARY KEY (tag_hash, record_id)
        );

        CREATE INDEX IF NOT EXISTS idx_record_index_record_id ON record_index(record_id);
        "#,
    )
    .map_err(DatabaseError::Sqlite)?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS rekey_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            from_version INTEGER NOT NULL,
            to_version INTEGER NOT NULL,
            pending_nonce BLOB NOT NULL,
            pending_wrapped_key BLOB NOT NULL,
            cursor TEXT,
            migrated INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS session_guard (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            failed_attempts INTEGER NOT NULL DEFAULT 0,
            lockout_until TEXT
        );
        "#,
    )
    .map_err(DatabaseError::Sqlite)?;

    info!("Store schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let tables = table_names(&conn);
        for expected in [
            "canary",
            "key_slots",
            "record_index",
            "record_meta",
            "records",
            "rekey_state",
            "session_guard",
            "store_meta",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_create_tables_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
    }

    #[test]
    fn test_rekey_state_is_singleton() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let insert = "INSERT INTO rekey_state (id, from_version, to_version, pending_nonce, pending_wrapped_key, started_at) VALUES (?1, 1, 2, x'00', x'00', 'now')";
        conn.execute(insert, [1]).unwrap();
        assert!(conn.execute(insert, [2]).is_err());
    }
}
