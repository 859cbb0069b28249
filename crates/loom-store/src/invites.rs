//! Pending [`ThreadInvite`] records.

use rusqlite::params;

use loom_shared::types::ContentId;

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::ThreadInvite;
use crate::sql::{fmt_time, parse_col, parse_time};

impl Database {
    pub fn add_thread_invite(&self, invite: &ThreadInvite) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO thread_invites (id, thread_id, name, inviter, block, date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                invite.id.as_str(),
                invite.thread_id.to_hex(),
                invite.name,
                invite.inviter.to_hex(),
                invite.block,
                fmt_time(&invite.date),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_thread_invite(&self, id: &ContentId) -> Result<ThreadInvite> {
        self.conn()
            .query_row(
                "SELECT id, thread_id, name, inviter, block, date FROM thread_invites WHERE id = ?1",
                params![id.as_str()],
                row_to_invite,
            )
            .map_err(not_found)
    }

    pub fn list_thread_invites(&self) -> Result<Vec<ThreadInvite>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, thread_id, name, inviter, block, date FROM thread_invites ORDER BY date DESC",
        )?;

        let rows = stmt.query_map([], row_to_invite)?;

        let mut invites = Vec::new();
        for row in rows {
            invites.push(row?);
        }
        Ok(invites)
    }

    pub fn delete_thread_invite(&self, id: &ContentId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM thread_invites WHERE id = ?1", params![id.as_str()])?;
        Ok(affected > 0)
    }
}

fn row_to_invite(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadInvite> {
    let id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let name: String = row.get(2)?;
    let inviter: String = row.get(3)?;
    let block: Vec<u8> = row.get(4)?;
    let date: String = row.get(5)?;

    Ok(ThreadInvite {
        id: parse_col(0, &id)?,
        thread_id: parse_col(1, &thread_id)?,
        name,
        inviter: parse_col(3, &inviter)?,
        block,
        date: parse_time(5, &date)?,
    })
}
