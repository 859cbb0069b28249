//! Inbox messages fetched from cafes ([`CafeMessage`]).

use rusqlite::params;

use loom_shared::types::ContentId;

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::CafeMessage;
use crate::sql::{fmt_time, parse_col, parse_time};

const COLUMNS: &str = "seq, id, peer, date, attempts";

impl Database {
    /// Returns `false` when the message is already queued.
    pub fn add_cafe_message(&self, msg: &CafeMessage) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO cafe_messages (id, peer, date, attempts)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                msg.id.as_str(),
                msg.peer.to_hex(),
                fmt_time(&msg.date),
                msg.attempts,
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_cafe_message(&self, id: &ContentId) -> Result<CafeMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM cafe_messages WHERE id = ?1"),
                params![id.as_str()],
                row_to_message,
            )
            .map_err(not_found)
    }

    pub fn list_cafe_messages(&self, offset: i64, limit: usize) -> Result<Vec<CafeMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {COLUMNS} FROM cafe_messages WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![offset, limit as i64], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Record a failed handling attempt.
    pub fn add_cafe_message_attempt(&self, id: &ContentId) -> Result<()> {
        self.conn().execute(
            "UPDATE cafe_messages SET attempts = attempts + 1 WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    pub fn delete_cafe_message(&self, id: &ContentId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM cafe_messages WHERE id = ?1", params![id.as_str()])?;
        Ok(affected > 0)
    }

    pub fn count_cafe_messages(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM cafe_messages", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<CafeMessage> {
    let id: String = row.get(1)?;
    let peer: String = row.get(2)?;
    let date: String = row.get(3)?;

    Ok(CafeMessage {
        seq: row.get(0)?,
        id: parse_col(1, &id)?,
        peer: parse_col(2, &peer)?,
        date: parse_time(3, &date)?,
        attempts: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loom_shared::types::PeerId;

    #[test]
    fn duplicate_messages_are_ignored() {
        let db = Database::open_in_memory().unwrap();
        let msg = CafeMessage {
            seq: 0,
            id: ContentId::of(b"env"),
            peer: PeerId([4u8; 32]),
            date: Utc::now(),
            attempts: 0,
        };
        assert!(db.add_cafe_message(&msg).unwrap());
        assert!(!db.add_cafe_message(&msg).unwrap());
        assert_eq!(db.count_cafe_messages().unwrap(), 1);
    }

    #[test]
    fn attempts_accumulate() {
        let db = Database::open_in_memory().unwrap();
        let id = ContentId::of(b"env");
        db.add_cafe_message(&CafeMessage {
            seq: 0,
            id: id.clone(),
            peer: PeerId([4u8; 32]),
            date: Utc::now(),
            attempts: 0,
        })
        .unwrap();

        db.add_cafe_message_attempt(&id).unwrap();
        db.add_cafe_message_attempt(&id).unwrap();
        assert_eq!(db.get_cafe_message(&id).unwrap().attempts, 2);

        assert!(db.delete_cafe_message(&id).unwrap());
        assert!(db.list_cafe_messages(0, 16).unwrap().is_empty());
    }
}
