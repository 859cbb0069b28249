//! CRUD operations for [`BlockRecord`] index rows.

use rusqlite::params;

use loom_shared::types::{BlockType, ContentId, ThreadId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::BlockRecord;
use crate::sql::{fmt_time, join_ids, parse_col, parse_time, split_ids};

const COLUMNS: &str = "id, thread_id, author, address, type, date, target, body, parents";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Index a block. Returns `false` if it was already indexed.
    pub fn add_block(&self, block: &BlockRecord) -> Result<bool> {
        let affected = self.conn().execute(
            &format!("INSERT OR IGNORE INTO blocks ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                block.id.as_str(),
                block.thread_id.to_hex(),
                block.author.map(|a| a.to_hex()),
                block.address.map(|a| a.to_string()),
                block.block_type.as_str(),
                fmt_time(&block.date),
                block.target.as_ref().map(ContentId::as_str),
                block.body,
                join_ids(&block.parents),
            ],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_block(&self, id: &ContentId) -> Result<BlockRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM blocks WHERE id = ?1"),
                params![id.as_str()],
                row_to_block,
            )
            .map_err(not_found)
    }

    pub fn has_block(&self, id: &ContentId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM blocks WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// List a thread's blocks, newest first, skipping ignored blocks.
    ///
    /// `offset` is the id of the last block of the previous page.
    pub fn list_blocks(
        &self,
        thread_id: &ThreadId,
        offset: Option<&ContentId>,
        limit: usize,
    ) -> Result<Vec<BlockRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {COLUMNS} FROM blocks b
             WHERE b.thread_id = ?1
               AND (?2 IS NULL OR b.date < (SELECT date FROM blocks WHERE id = ?2))
               AND NOT EXISTS (
                   SELECT 1 FROM blocks i
                   WHERE i.type = 'IGNORE' AND i.target = b.id AND i.thread_id = b.thread_id
               )
             ORDER BY b.date DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![thread_id.to_hex(), offset.map(ContentId::as_str), limit as i64],
            row_to_block,
        )?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }

    /// Blocks annotating `target` (comments, likes, flags, ignores).
    pub fn list_blocks_by_target(&self, target: &ContentId) -> Result<Vec<BlockRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {COLUMNS} FROM blocks WHERE target = ?1 ORDER BY date ASC"
        ))?;

        let rows = stmt.query_map(params![target.as_str()], row_to_block)?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }

    pub fn count_blocks(&self, thread_id: &ThreadId, block_type: Option<BlockType>) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM blocks WHERE thread_id = ?1 AND (?2 IS NULL OR type = ?2)",
            params![thread_id.to_hex(), block_type.map(|t| t.as_str())],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    pub fn delete_blocks_by_thread(&self, thread_id: &ThreadId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM blocks WHERE thread_id = ?1",
            params![thread_id.to_hex()],
        )?;
        Ok(affected)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockRecord> {
    let id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let author: Option<String> = row.get(2)?;
    let address: Option<String> = row.get(3)?;
    let block_type: String = row.get(4)?;
    let date: String = row.get(5)?;
    let target: Option<String> = row.get(6)?;
    let body: Option<String> = row.get(7)?;
    let parents: String = row.get(8)?;

    Ok(BlockRecord {
        id: parse_col(0, &id)?,
        thread_id: parse_col(1, &thread_id)?,
        author: author.map(|s| parse_col(2, &s)).transpose()?,
        address: address.map(|s| parse_col(3, &s)).transpose()?,
        block_type: parse_col(4, &block_type)?,
        date: parse_time(5, &date)?,
        target: target.map(|s| parse_col(6, &s)).transpose()?,
        body,
        parents: split_ids(8, &parents)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use loom_shared::types::PeerId;

    use crate::threads::tests::sample_thread;

    fn block(thread_id: ThreadId, tag: &[u8], block_type: BlockType, minutes: i64) -> BlockRecord {
        BlockRecord {
            id: ContentId::of(tag),
            thread_id,
            author: Some(PeerId([5u8; 32])),
            address: None,
            block_type,
            date: Utc::now() + Duration::minutes(minutes),
            target: None,
            body: Some("hi".to_string()),
            parents: vec![ContentId::of(b"parent")],
        }
    }

    #[test]
    fn add_block_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let thread = sample_thread(1, "k1");
        db.add_thread(&thread).unwrap();

        let b = block(thread.id, b"one", BlockType::Message, 0);
        assert!(db.add_block(&b).unwrap());
        assert!(!db.add_block(&b).unwrap());
        assert_eq!(db.count_blocks(&thread.id, None).unwrap(), 1);
        assert_eq!(db.get_block(&b.id).unwrap(), b);
    }

    #[test]
    fn list_skips_ignored_and_paginates() {
        let db = Database::open_in_memory().unwrap();
        let thread = sample_thread(1, "k1");
        db.add_thread(&thread).unwrap();

        let first = block(thread.id, b"first", BlockType::Message, 0);
        let second = block(thread.id, b"second", BlockType::Message, 1);
        let third = block(thread.id, b"third", BlockType::Message, 2);
        let mut ignore = block(thread.id, b"ignore", BlockType::Ignore, 3);
        ignore.target = Some(second.id.clone());
        for b in [&first, &second, &third, &ignore] {
            db.add_block(b).unwrap();
        }

        let page = db.list_blocks(&thread.id, None, 2).unwrap();
        let ids: Vec<_> = page.iter().map(|b| b.id.clone()).collect();
        assert_eq!(ids, vec![ignore.id.clone(), third.id.clone()]);

        let next = db.list_blocks(&thread.id, Some(&third.id), 10).unwrap();
        let ids: Vec<_> = next.iter().map(|b| b.id.clone()).collect();
        assert_eq!(ids, vec![first.id.clone()]);
    }

    #[test]
    fn blocks_go_with_their_thread() {
        let db = Database::open_in_memory().unwrap();
        let thread = sample_thread(1, "k1");
        db.add_thread(&thread).unwrap();
        db.add_block(&block(thread.id, b"one", BlockType::Join, 0)).unwrap();

        db.delete_thread(&thread.id).unwrap();
        assert!(!db.has_block(&ContentId::of(b"one")).unwrap());
    }
}
