//! Block delivery queue ([`BlockMessage`]).

use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::BlockMessage;
use crate::sql::{fmt_time, parse_col, parse_time};

impl Database {
    /// Enqueue a message. Returns the assigned queue position.
    pub fn add_block_message(&self, msg: &BlockMessage) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO block_messages (id, peer, envelope, sync_group, date)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                msg.id,
                msg.peer.to_hex(),
                msg.envelope,
                msg.sync_group.as_ref().map(|g| g.as_str()),
                fmt_time(&msg.date),
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Oldest messages after queue position `offset`.
    ///
    /// Messages whose sync group still has pending cafe requests are skipped
    /// until those requests complete.
    pub fn list_block_messages(&self, offset: i64, limit: usize) -> Result<Vec<BlockMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT m.seq, m.id, m.peer, m.envelope, m.sync_group, m.date
             FROM block_messages m
             WHERE m.seq > ?1
               AND (m.sync_group IS NULL OR NOT EXISTS (
                   SELECT 1 FROM cafe_requests r WHERE r.sync_group = m.sync_group
               ))
             ORDER BY m.seq ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![offset, limit as i64], |row| {
            let peer: String = row.get(2)?;
            let group: Option<String> = row.get(4)?;
            let date: String = row.get(5)?;
            Ok(BlockMessage {
                seq: row.get(0)?,
                id: row.get(1)?,
                peer: parse_col(2, &peer)?,
                envelope: row.get(3)?,
                sync_group: group.map(|g| parse_col(4, &g)).transpose()?,
                date: parse_time(5, &date)?,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn delete_block_message(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM block_messages WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn count_block_messages(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM block_messages", [], |row| row.get(0))?;
        Ok(count)
    }
}
