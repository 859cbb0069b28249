//! CRUD operations for [`ThreadRecord`] records.

use rusqlite::params;

use loom_shared::types::{ContentId, ThreadId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::ThreadRecord;
use crate::sql::{fmt_time, join_ids, parse_col, parse_json, parse_time, split_ids};

const COLUMNS: &str =
    "id, key, secret, name, schema_id, initiator, type, sharing, whitelist, head, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new thread. Fails with a constraint error if the id or
    /// application key already exists.
    pub fn add_thread(&self, thread: &ThreadRecord) -> Result<()> {
        self.conn().execute(
            &format!("INSERT INTO threads ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
            params![
                thread.id.to_hex(),
                thread.key,
                hex::encode(thread.secret),
                thread.name,
                thread.schema.as_ref().map(ContentId::as_str),
                thread.initiator.to_string(),
                thread.thread_type.as_str(),
                thread.sharing.as_str(),
                serde_json::to_string(&thread.whitelist)?,
                join_ids(&thread.head),
                fmt_time(&thread.created_at),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_thread(&self, id: &ThreadId) -> Result<ThreadRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM threads WHERE id = ?1"),
                params![id.to_hex()],
                row_to_thread,
            )
            .map_err(not_found)
    }

    pub fn get_thread_by_key(&self, key: &str) -> Result<ThreadRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM threads WHERE key = ?1"),
                params![key],
                row_to_thread,
            )
            .map_err(not_found)
    }

    pub fn has_thread(&self, id: &ThreadId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM threads WHERE id = ?1",
            params![id.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// List all threads, oldest first.
    pub fn list_threads(&self) -> Result<Vec<ThreadRecord>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {COLUMNS} FROM threads ORDER BY created_at ASC"))?;

        let rows = stmt.query_map([], row_to_thread)?;

        let mut threads = Vec::new();
        for row in rows {
            threads.push(row?);
        }
        Ok(threads)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    pub fn update_thread_head(&self, id: &ThreadId, head: &[ContentId]) -> Result<()> {
        self.conn().execute(
            "UPDATE threads SET head = ?1 WHERE id = ?2",
            params![join_ids(head), id.to_hex()],
        )?;
        Ok(())
    }

    pub fn update_thread_name(&self, id: &ThreadId, name: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE threads SET name = ?1 WHERE id = ?2",
            params![name, id.to_hex()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a thread; its blocks and peers go with it.
    pub fn delete_thread(&self, id: &ThreadId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM threads WHERE id = ?1", params![id.to_hex()])?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadRecord> {
    let id: String = row.get(0)?;
    let key: String = row.get(1)?;
    let secret_hex: String = row.get(2)?;
    let name: String = row.get(3)?;
    let schema: Option<String> = row.get(4)?;
    let initiator: String = row.get(5)?;
    let thread_type: String = row.get(6)?;
    let sharing: String = row.get(7)?;
    let whitelist: String = row.get(8)?;
    let head: String = row.get(9)?;
    let created: String = row.get(10)?;

    let secret = hex::decode(&secret_hex)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                "thread secret is not 32 hex bytes".into(),
            )
        })?;

    Ok(ThreadRecord {
        id: parse_col(0, &id)?,
        key,
        secret,
        name,
        schema: schema.map(|s| parse_col(4, &s)).transpose()?,
        initiator: parse_col(5, &initiator)?,
        thread_type: parse_col(6, &thread_type)?,
        sharing: parse_col(7, &sharing)?,
        whitelist: parse_json(8, &whitelist)?,
        head: split_ids(9, &head)?,
        created_at: parse_time(10, &created)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use loom_shared::types::{Address, ThreadSharing, ThreadType};

    pub(crate) fn sample_thread(seed: u8, key: &str) -> ThreadRecord {
        ThreadRecord {
            id: ThreadId([seed; 32]),
            key: key.to_string(),
            secret: [seed.wrapping_add(1); 32],
            name: "notes".to_string(),
            schema: None,
            initiator: Address([3u8; 32]),
            thread_type: ThreadType::Open,
            sharing: ThreadSharing::Shared,
            whitelist: vec![Address([4u8; 32])],
            head: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn thread_round_trip_and_head_update() {
        let db = Database::open_in_memory().unwrap();
        let thread = sample_thread(1, "k1");
        db.add_thread(&thread).unwrap();

        let loaded = db.get_thread_by_key("k1").unwrap();
        assert_eq!(loaded.id, thread.id);
        assert_eq!(loaded.whitelist, thread.whitelist);
        assert!(loaded.head.is_empty());

        let head = vec![ContentId::of(b"a"), ContentId::of(b"b")];
        db.update_thread_head(&thread.id, &head).unwrap();
        assert_eq!(db.get_thread(&thread.id).unwrap().head, head);
    }

    #[test]
    fn duplicate_key_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.add_thread(&sample_thread(1, "k1")).unwrap();
        assert!(db.add_thread(&sample_thread(2, "k1")).is_err());
    }

    #[test]
    fn missing_thread_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_thread(&ThreadId([9u8; 32])),
            Err(crate::StoreError::NotFound)
        ));
    }
}
