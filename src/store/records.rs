//! Row-level operations on the three data layers.
//!
//! These functions take a plain `Connection` (or a `Transaction`, which derefs
//! to one) and never touch key material: ciphertext goes in and out as
//! [`SealedRecord`] values. Encryption happens one level up in
//! [`super::Handle`].

use crate::crypto::SealedRecord;
use crate::errors::{AppResult, DatabaseError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

/// Metadata layer row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub record_id: String,
    pub byte_len: u64,
    pub created_at: String,
    pub updated_at: String,
}

/// Which layers still reference a record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayerPresence {
    pub index: bool,
    pub metadata: bool,
    pub content: bool,
}

impl LayerPresence {
    /// `true` when no layer references the record.
    pub fn is_absent(&self) -> bool {
        !self.index && !self.metadata && !self.content
    }
}

/// Hashed form of a tag as stored in the index layer.
pub fn tag_hash(tag: &str) -> String {
    blake3::hash(tag.as_bytes()).to_hex().to_string()
}

/// Inserts or replaces a sealed record in the content layer.
pub fn upsert_record(conn: &Connection, record: &SealedRecord) -> AppResult<()> {
    conn.execute(
        r#"
        INSERT INTO records (id, key_version, nonce, ciphertext)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
            key_version = excluded.key_version,
            nonce = excluded.nonce,
            ciphertext = excluded.ciphertext
        "#,
        params![
            record.id,
            record.key_version as i64,
            record.nonce,
            record.ciphertext
        ],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

/// Fetches a sealed record from the content layer.
pub fn get_record(conn: &Connection, id: &str) -> AppResult<Option<SealedRecord>> {
    let record = conn
        .query_row(
            "SELECT id, key_version, nonce, ciphertext FROM records WHERE id = ?1",
            params![id],
            |row| {
                Ok(SealedRecord {
                    id: row.get(0)?,
                    key_version: row.get::<_, i64>(1)? as u64,
                    nonce: row.get(2)?,
                    ciphertext: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    Ok(record)
}

/// Fetches up to `limit` records sealed under `key_version` with ids after `cursor`.
pub fn records_after(
    conn: &Connection,
    key_version: u64,
    cursor: Option<&str>,
    limit: usize,
) -> AppResult<Vec<SealedRecord>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, key_version, nonce, ciphertext FROM records
            WHERE key_version = ?1 AND (?2 IS NULL OR id > ?2)
            ORDER BY id
            LIMIT ?3
            "#,
        )
        .map_err(DatabaseError::Sqlite)?;

    let rows = stmt
        .query_map(params![key_version as i64, cursor, limit as i64], |row| {
            Ok(SealedRecord {
                id: row.get(0)?,
                key_version: row.get::<_, i64>(1)? as u64,
                nonce: row.get(2)?,
                ciphertext: row.get(3)?,
            })
        })
        .map_err(DatabaseError::Sqlite)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::Sqlite)?;
    Ok(rows)
}

/// Number of content rows sealed under `key_version`.
pub fn count_with_version(conn: &Connection, key_version: u64) -> AppResult<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM records WHERE key_version = ?1",
            params![key_version as i64],
            |row| row.get(0),
        )
        .map_err(DatabaseError::Sqlite)?;
    Ok(count as u64)
}

/// Lists all record ids in the content layer, sorted.
pub fn list_ids(conn: &Connection) -> AppResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT id FROM records ORDER BY id")
        .map_err(DatabaseError::Sqlite)?;
    let ids = stmt
        .query_map([], |row| row.get(0))
        .map_err(DatabaseError::Sqlite)?
        .collect::<Result<Vec<String>, _>>()
        .map_err(DatabaseError::Sqlite)?;
    Ok(ids)
}

/// Overwrites a record's nonce and ciphertext with zeros of the same length.
///
/// Returns the number of rows touched.
pub fn overwrite_record(conn: &Connection, id: &str) -> AppResult<usize> {
    let changed = conn
        .execute(
            r#"
            UPDATE records
            SET nonce = zeroblob(length(nonce)),
                ciphertext = zeroblob(length(ciphertext))
            WHERE id = ?1
            "#,
            params![id],
        )
        .map_err(DatabaseError::Sqlite)?;
    Ok(changed)
}

/// Removes a record from the content layer.
pub fn delete_record(conn: &Connection, id: &str) -> AppResult<usize> {
    let removed = conn
        .execute("DELETE FROM records WHERE id = ?1", params![id])
        .map_err(DatabaseError::Sqlite)?;
    Ok(removed)
}

/// Inserts or updates the metadata row, keeping the original creation time.
pub fn upsert_meta(conn: &Connection, id: &str, byte_len: u64, now: DateTime<Utc>) -> AppResult<()> {
    let now = now.to_rfc3339();
    conn.execute(
        r#"
        INSERT INTO record_meta (record_id, byte_len, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?3)
        ON CONFLICT(record_id) DO UPDATE SET
            byte_len = excluded.byte_len,
            updated_at = excluded.updated_at
        "#,
        params![id, byte_len as i64, now],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

/// Fetches the metadata row of a record.
pub fn get_meta(conn: &Connection, id: &str) -> AppResult<Option<RecordMeta>> {
    let meta = conn
        .query_row(
            "SELECT record_id, byte_len, created_at, updated_at FROM record_meta WHERE record_id = ?1",
            params![id],
            |row| {
                Ok(RecordMeta {
                    record_id: row.get(0)?,
                    byte_len: row.get::<_, i64>(1)? as u64,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    Ok(meta)
}

/// Removes a record from the metadata layer.
pub fn delete_meta(conn: &Connection, id: &str) -> AppResult<usize> {
    let removed = conn
        .execute("DELETE FROM record_meta WHERE record_id = ?1", params![id])
        .map_err(DatabaseError::Sqlite)?;
    Ok(removed)
}

/// Replaces the index entries of a record with `tags`.
pub fn replace_tags(conn: &Connection, id: &str, tags: &[&str]) -> AppResult<()> {
    delete_index(conn, id)?;
    for tag in tags {
        conn.execute(
            "INSERT OR IGNORE INTO record_index (tag_hash, record_id) VALUES (?1, ?2)",
            params![tag_hash(tag), id],
        )
        .map_err(DatabaseError::Sqlite)?;
    }
    debug!("Indexed record under {} tags", tags.len());
    Ok(())
}

/// Removes a record from the index layer.
pub fn delete_index(conn: &Connection, id: &str) -> AppResult<usize> {
    let removed = conn
        .execute("DELETE FROM record_index WHERE record_id = ?1", params![id])
        .map_err(DatabaseError::Sqlite)?;
    Ok(removed)
}

/// Record ids indexed under `tag`, sorted.
pub fn ids_for_tag(conn: &Connection, tag: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT record_id FROM record_index WHERE tag_hash = ?1 ORDER BY record_id")
        .map_err(DatabaseError::Sqlite)?;
    let ids = stmt
        .query_map(params![tag_hash(tag)], |row| row.get(0))
        .map_err(DatabaseError::Sqlite)?
        .collect::<Result<Vec<String>, _>>()
        .map_err(DatabaseError::Sqlite)?;
    Ok(ids)
}

/// Scans all three layers for references to `id`.
pub fn layer_presence(conn: &Connection, id: &str) -> AppResult<LayerPresence> {
    let exists = |sql: &str| -> AppResult<bool> {
        let found: bool = conn
            .query_row(sql, params![id], |row| row.get(0))
            .map_err(DatabaseError::Sqlite)?;
        Ok(found)
    };

    Ok(LayerPresence {
        index: exists("SELECT EXISTS(SELECT 1 FROM record_index WHERE record_id = ?1)")?,
        metadata: exists("SELECT EXISTS(SELECT 1 FROM record_meta WHERE record_id = ?1)")?,
        content: exists("SELECT EXISTS(SELECT 1 FROM records WHERE id = ?1)")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::create_tables;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        conn
    }

    fn sealed(id: &str, version: u64) -> SealedRecord {
        SealedRecord {
            id: id.to_string(),
            key_version: version,
            nonce: vec![1; 24],
            ciphertext: vec![2; 40],
        }
    }

    #[test]
    fn test_upsert_and_get_record() {
        let conn = setup();
        upsert_record(&conn, &sealed("a", 1)).unwrap();
        assert_eq!(get_record(&conn, "a").unwrap(), Some(sealed("a", 1)));

        upsert_record(&conn, &sealed("a", 2)).unwrap();
        assert_eq!(get_record(&conn, "a").unwrap().unwrap().key_version, 2);
        assert!(get_record(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_records_after_cursor() {
        let conn = setup();
        for id in ["a", "b", "c", "d"] {
            upsert_record(&conn, &sealed(id, 1)).unwrap();
        }
        upsert_record(&conn, &sealed("e", 2)).unwrap();

        let first = records_after(&conn, 1, None, 2).unwrap();
        assert_eq!(first.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        let rest = records_after(&conn, 1, Some("b"), 10).unwrap();
        assert_eq!(rest.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["c", "d"]);
        assert_eq!(count_with_version(&conn, 1).unwrap(), 4);
    }

    #[test]
    fn test_overwrite_record_zeroes_ciphertext() {
        let conn = setup();
        upsert_record(&conn, &sealed("a", 1)).unwrap();
        assert_eq!(overwrite_record(&conn, "a").unwrap(), 1);

        let record = get_record(&conn, "a").unwrap().unwrap();
        assert_eq!(record.ciphertext.len(), 40);
        assert!(record.ciphertext.iter().all(|b| *b == 0));
        assert!(record.nonce.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_meta_keeps_created_at() {
        let conn = setup();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(10);
        upsert_meta(&conn, "a", 10, t1).unwrap();
        upsert_meta(&conn, "a", 20, t2).unwrap();

        let meta = get_meta(&conn, "a").unwrap().unwrap();
        assert_eq!(meta.byte_len, 20);
        assert_eq!(meta.created_at, t1.to_rfc3339());
        assert_eq!(meta.updated_at, t2.to_rfc3339());
    }

    #[test]
    fn test_tags_are_hashed_and_replaced() {
        let conn = setup();
        replace_tags(&conn, "a", &["medical", "2024"]).unwrap();
        replace_tags(&conn, "b", &["medical"]).unwrap();

        assert_eq!(ids_for_tag(&conn, "medical").unwrap(), ["a", "b"]);

        replace_tags(&conn, "a", &["finance"]).unwrap();
        assert_eq!(ids_for_tag(&conn, "medical").unwrap(), ["b"]);
        assert_eq!(ids_for_tag(&conn, "finance").unwrap(), ["a"]);

        let raw: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM record_index WHERE tag_hash = 'finance'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(raw, 0);
    }

    #[test]
    fn test_layer_presence() {
        let conn = setup();
        upsert_record(&conn, &sealed("a", 1)).unwrap();
        upsert_meta(&conn, "a", 3, Utc::now()).unwrap();
        replace_tags(&conn, "a", &["x"]).unwrap();

        let presence = layer_presence(&conn, "a").unwrap();
        assert!(presence.index && presence.metadata && presence.content);

        delete_index(&conn, "a").unwrap();
        delete_meta(&conn, "a").unwrap();
        delete_record(&conn, "a").unwrap();
        assert!(layer_presence(&conn, "a").unwrap().is_absent());
    }
}
