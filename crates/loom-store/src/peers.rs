//! Thread membership ([`ThreadPeer`]) and contact ([`Peer`]) records.

use rusqlite::params;

use loom_shared::types::{PeerId, ThreadId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{Peer, ThreadPeer};
use crate::sql::{fmt_time, parse_col, parse_json, parse_time};

impl Database {
    // ------------------------------------------------------------------
    // Thread peers
    // ------------------------------------------------------------------

    /// Add a peer to a thread. Existing memberships are left untouched.
    pub fn add_thread_peer(&self, peer: &ThreadPeer) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO thread_peers (id, thread_id, welcomed) VALUES (?1, ?2, ?3)",
            params![peer.id.to_hex(), peer.thread_id.to_hex(), peer.welcomed as i32],
        )?;
        Ok(affected > 0)
    }

    pub fn list_thread_peers(&self, thread_id: &ThreadId) -> Result<Vec<ThreadPeer>> {
        self.query_thread_peers(
            "SELECT id, thread_id, welcomed FROM thread_peers WHERE thread_id = ?1 ORDER BY id",
            thread_id,
        )
    }

    /// Peers that have not been sent the thread head yet.
    pub fn list_unwelcomed_thread_peers(&self, thread_id: &ThreadId) -> Result<Vec<ThreadPeer>> {
        self.query_thread_peers(
            "SELECT id, thread_id, welcomed FROM thread_peers
             WHERE thread_id = ?1 AND welcomed = 0 ORDER BY id",
            thread_id,
        )
    }

    pub fn welcome_thread_peers(&self, thread_id: &ThreadId) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE thread_peers SET welcomed = 1 WHERE thread_id = ?1",
            params![thread_id.to_hex()],
        )?;
        Ok(affected)
    }

    pub fn delete_thread_peer(&self, id: &PeerId, thread_id: &ThreadId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM thread_peers WHERE id = ?1 AND thread_id = ?2",
            params![id.to_hex(), thread_id.to_hex()],
        )?;
        Ok(affected > 0)
    }

    fn query_thread_peers(&self, sql: &str, thread_id: &ThreadId) -> Result<Vec<ThreadPeer>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params![thread_id.to_hex()], |row| {
            let id: String = row.get(0)?;
            let thread: String = row.get(1)?;
            let welcomed: i32 = row.get(2)?;
            Ok(ThreadPeer {
                id: parse_col(0, &id)?,
                thread_id: parse_col(1, &thread)?,
                welcomed: welcomed != 0,
            })
        })?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }

    // ------------------------------------------------------------------
    // Contacts
    // ------------------------------------------------------------------

    /// Insert a contact, or replace the stored one if `peer.updated` is newer.
    /// Returns `true` when the row changed.
    pub fn add_or_update_peer(&self, peer: &Peer) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT INTO peers (id, address, name, avatar, inboxes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 address = excluded.address,
                 name = excluded.name,
                 avatar = excluded.avatar,
                 inboxes = excluded.inboxes,
                 updated_at = excluded.updated_at
             WHERE excluded.updated_at > peers.updated_at",
            params![
                peer.id.to_hex(),
                peer.address.to_string(),
                peer.name,
                peer.avatar,
                serde_json::to_string(&peer.inboxes)?,
                fmt_time(&peer.updated),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_peer(&self, id: &PeerId) -> Result<Peer> {
        self.conn()
            .query_row(
                "SELECT id, address, name, avatar, inboxes, updated_at FROM peers WHERE id = ?1",
                params![id.to_hex()],
                row_to_peer,
            )
            .map_err(not_found)
    }

    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, address, name, avatar, inboxes, updated_at FROM peers ORDER BY name ASC",
        )?;

        let rows = stmt.query_map([], row_to_peer)?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }
}

fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Peer> {
    let id: String = row.get(0)?;
    let address: String = row.get(1)?;
    let name: String = row.get(2)?;
    let avatar: Option<String> = row.get(3)?;
    let inboxes: String = row.get(4)?;
    let updated: String = row.get(5)?;

    Ok(Peer {
        id: parse_col(0, &id)?,
        address: parse_col(1, &address)?,
        name,
        avatar,
        inboxes: parse_json(4, &inboxes)?,
        updated: parse_time(5, &updated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use loom_shared::types::Address;

    use crate::threads::tests::sample_thread;

    fn contact(name: &str, minutes: i64) -> Peer {
        Peer {
            id: PeerId([7u8; 32]),
            address: Address([8u8; 32]),
            name: name.to_string(),
            avatar: None,
            inboxes: Vec::new(),
            updated: Utc::now() + Duration::minutes(minutes),
        }
    }

    #[test]
    fn contact_last_writer_wins() {
        let db = Database::open_in_memory().unwrap();

        assert!(db.add_or_update_peer(&contact("first", 0)).unwrap());
        assert!(db.add_or_update_peer(&contact("newer", 5)).unwrap());
        assert!(!db.add_or_update_peer(&contact("stale", 1)).unwrap());

        assert_eq!(db.get_peer(&PeerId([7u8; 32])).unwrap().name, "newer");
    }

    #[test]
    fn welcome_marks_all_thread_peers() {
        let db = Database::open_in_memory().unwrap();
        let thread = sample_thread(1, "k1");
        db.add_thread(&thread).unwrap();

        for seed in [10u8, 11] {
            db.add_thread_peer(&ThreadPeer {
                id: PeerId([seed; 32]),
                thread_id: thread.id,
                welcomed: false,
            })
            .unwrap();
        }
        assert_eq!(db.list_unwelcomed_thread_peers(&thread.id).unwrap().len(), 2);

        db.welcome_thread_peers(&thread.id).unwrap();
        assert!(db.list_unwelcomed_thread_peers(&thread.id).unwrap().is_empty());
        assert_eq!(db.list_thread_peers(&thread.id).unwrap().len(), 2);
    }
}
