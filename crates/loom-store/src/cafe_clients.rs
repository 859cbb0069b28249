//! Cafe host tables: registered clients, registration nonces, pins, thread
//! backups, client inboxes and dev tokens.

use chrono::{DateTime, Utc};
use rusqlite::params;

use loom_shared::types::{ContentId, PeerId, ThreadId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{CafeClient, CafeClientMessage, CafeClientNonce, CafeClientThread, CafeToken};
use crate::sql::{fmt_time, parse_col, parse_time};

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

impl Database {
    /// Register a client, keeping its original creation date on re-registration.
    pub fn add_or_update_cafe_client(&self, client: &CafeClient) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_clients (id, address, created_at, last_seen)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                address = excluded.address,
                last_seen = excluded.last_seen",
            params![
                client.id.to_hex(),
                client.address.to_string(),
                fmt_time(&client.created_at),
                fmt_time(&client.last_seen),
            ],
        )?;
        Ok(())
    }

    pub fn get_cafe_client(&self, id: &PeerId) -> Result<CafeClient> {
        self.conn()
            .query_row(
                "SELECT id, address, created_at, last_seen FROM cafe_clients WHERE id = ?1",
                params![id.to_hex()],
                |row| {
                    let id: String = row.get(0)?;
                    let address: String = row.get(1)?;
                    let created: String = row.get(2)?;
                    let seen: String = row.get(3)?;
                    Ok(CafeClient {
                        id: parse_col(0, &id)?,
                        address: parse_col(1, &address)?,
                        created_at: parse_time(2, &created)?,
                        last_seen: parse_time(3, &seen)?,
                    })
                },
            )
            .map_err(not_found)
    }

    pub fn update_cafe_client_last_seen(&self, id: &PeerId, at: &DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE cafe_clients SET last_seen = ?1 WHERE id = ?2",
            params![fmt_time(at), id.to_hex()],
        )?;
        Ok(())
    }

    /// Remove a client together with its backups and inbox.
    pub fn delete_cafe_client(&self, id: &PeerId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM cafe_clients WHERE id = ?1", params![id.to_hex()])?;
        Ok(affected > 0)
    }

    pub fn count_cafe_clients(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM cafe_clients", [], |row| row.get(0))?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Nonces
// ---------------------------------------------------------------------------

impl Database {
    pub fn add_cafe_client_nonce(&self, nonce: &CafeClientNonce) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_client_nonces (value, address, date) VALUES (?1, ?2, ?3)",
            params![nonce.value, nonce.address.to_string(), fmt_time(&nonce.date)],
        )?;
        Ok(())
    }

    pub fn get_cafe_client_nonce(&self, value: &str) -> Result<CafeClientNonce> {
        self.conn()
            .query_row(
                "SELECT value, address, date FROM cafe_client_nonces WHERE value = ?1",
                params![value],
                |row| {
                    let address: String = row.get(1)?;
                    let date: String = row.get(2)?;
                    Ok(CafeClientNonce {
                        value: row.get(0)?,
                        address: parse_col(1, &address)?,
                        date: parse_time(2, &date)?,
                    })
                },
            )
            .map_err(not_found)
    }

    pub fn delete_cafe_client_nonce(&self, value: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM cafe_client_nonces WHERE value = ?1", params![value])?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Thread backups
// ---------------------------------------------------------------------------

impl Database {
    pub fn add_or_update_cafe_client_thread(&self, thread: &CafeClientThread) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO cafe_client_threads (id, client_id, ciphertext, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                thread.id.to_hex(),
                thread.client_id.to_hex(),
                thread.ciphertext,
                fmt_time(&thread.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_cafe_client_threads(&self, client_id: &PeerId) -> Result<Vec<CafeClientThread>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, client_id, ciphertext, updated_at
             FROM cafe_client_threads
             WHERE client_id = ?1
             ORDER BY updated_at ASC",
        )?;

        let rows = stmt.query_map(params![client_id.to_hex()], |row| {
            let id: String = row.get(0)?;
            let client: String = row.get(1)?;
            let updated: String = row.get(3)?;
            Ok(CafeClientThread {
                id: parse_col(0, &id)?,
                client_id: parse_col(1, &client)?,
                ciphertext: row.get(2)?,
                updated_at: parse_time(3, &updated)?,
            })
        })?;

        let mut threads = Vec::new();
        for row in rows {
            threads.push(row?);
        }
        Ok(threads)
    }

    pub fn delete_cafe_client_thread(&self, id: &ThreadId, client_id: &PeerId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM cafe_client_threads WHERE id = ?1 AND client_id = ?2",
            params![id.to_hex(), client_id.to_hex()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Client inboxes
// ---------------------------------------------------------------------------

impl Database {
    pub fn add_or_update_cafe_client_message(&self, msg: &CafeClientMessage) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_client_messages (id, peer, client_id, envelope, date)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id, client_id) DO UPDATE SET
                envelope = excluded.envelope,
                date = excluded.date",
            params![
                msg.id.as_str(),
                msg.peer.to_hex(),
                msg.client_id.to_hex(),
                msg.envelope,
                fmt_time(&msg.date),
            ],
        )?;
        Ok(())
    }

    /// Oldest `limit` messages waiting for a client.
    pub fn list_cafe_client_messages(
        &self,
        client_id: &PeerId,
        limit: usize,
    ) -> Result<Vec<CafeClientMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT seq, id, peer, client_id, envelope, date
             FROM cafe_client_messages
             WHERE client_id = ?1
             ORDER BY seq ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![client_id.to_hex(), limit as i64], |row| {
            let id: String = row.get(1)?;
            let peer: String = row.get(2)?;
            let client: String = row.get(3)?;
            let date: String = row.get(5)?;
            Ok(CafeClientMessage {
                seq: row.get(0)?,
                id: parse_col(1, &id)?,
                peer: parse_col(2, &peer)?,
                client_id: parse_col(3, &client)?,
                envelope: row.get(4)?,
                date: parse_time(5, &date)?,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Delete a client's messages up to and including inbox position
    /// `through` and return how many remain afterwards.
    pub fn delete_cafe_client_messages(&self, client_id: &PeerId, through: i64) -> Result<i64> {
        self.conn().execute(
            "DELETE FROM cafe_client_messages WHERE client_id = ?1 AND seq <= ?2",
            params![client_id.to_hex(), through],
        )?;
        self.count_cafe_client_messages(client_id)
    }

    pub fn count_cafe_client_messages(&self, client_id: &PeerId) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM cafe_client_messages WHERE client_id = ?1",
            params![client_id.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Pins
// ---------------------------------------------------------------------------

impl Database {
    pub fn add_cafe_client_pin(&self, cid: &ContentId, client_id: &PeerId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO cafe_client_pins (cid, client_id) VALUES (?1, ?2)",
            params![cid.as_str(), client_id.to_hex()],
        )?;
        Ok(())
    }

    /// Drop a client's pin. False if the client never held it.
    pub fn delete_cafe_client_pin(&self, cid: &ContentId, client_id: &PeerId) -> Result<bool> {
        let n = self.conn().execute(
            "DELETE FROM cafe_client_pins WHERE cid = ?1 AND client_id = ?2",
            params![cid.as_str(), client_id.to_hex()],
        )?;
        Ok(n > 0)
    }

    /// How many clients still hold `cid`.
    pub fn count_cafe_client_pins(&self, cid: &ContentId) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM cafe_client_pins WHERE cid = ?1",
            params![cid.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Dev tokens
// ---------------------------------------------------------------------------

impl Database {
    pub fn add_cafe_token(&self, token: &CafeToken) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_tokens (id, token_hash, created_at) VALUES (?1, ?2, ?3)",
            params![token.id, token.token_hash, fmt_time(&token.created_at)],
        )?;
        Ok(())
    }

    pub fn list_cafe_tokens(&self) -> Result<Vec<CafeToken>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, token_hash, created_at FROM cafe_tokens ORDER BY created_at DESC")?;

        let rows = stmt.query_map([], |row| {
            let created: String = row.get(2)?;
            Ok(CafeToken {
                id: row.get(0)?,
                token_hash: row.get(1)?,
                created_at: parse_time(2, &created)?,
            })
        })?;

        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row?);
        }
        Ok(tokens)
    }

    pub fn has_cafe_token_hash(&self, token_hash: &str) -> Result<bool> {
        let exists = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM cafe_tokens WHERE token_hash = ?1)",
            params![token_hash],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn delete_cafe_token(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM cafe_tokens WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_shared::types::Address;

    fn client(seed: u8) -> CafeClient {
        let now = Utc::now();
        CafeClient {
            id: PeerId([seed; 32]),
            address: Address([seed; 32]),
            created_at: now,
            last_seen: now,
        }
    }

    fn inbox_message(n: u8, client_id: PeerId) -> CafeClientMessage {
        CafeClientMessage {
            seq: 0,
            id: ContentId::of(&[n]),
            peer: PeerId([n; 32]),
            client_id,
            envelope: vec![n],
            date: Utc::now(),
        }
    }

    #[test]
    fn reregistration_keeps_creation_date() {
        let db = Database::open_in_memory().unwrap();
        let first = client(1);
        db.add_or_update_cafe_client(&first).unwrap();

        let mut again = client(1);
        again.created_at = first.created_at + chrono::Duration::days(1);
        again.last_seen = again.created_at;
        db.add_or_update_cafe_client(&again).unwrap();

        let stored = db.get_cafe_client(&first.id).unwrap();
        assert_eq!(stored.created_at, first.created_at);
        assert_eq!(stored.last_seen, again.last_seen);
        assert_eq!(db.count_cafe_clients().unwrap(), 1);
    }

    #[test]
    fn nonce_is_single_use() {
        let db = Database::open_in_memory().unwrap();
        let nonce = CafeClientNonce {
            value: "abc".to_string(),
            address: Address([3u8; 32]),
            date: Utc::now(),
        };
        db.add_cafe_client_nonce(&nonce).unwrap();
        assert_eq!(db.get_cafe_client_nonce("abc").unwrap().address, nonce.address);
        assert!(db.delete_cafe_client_nonce("abc").unwrap());
        assert!(db.get_cafe_client_nonce("abc").is_err());
    }

    #[test]
    fn inbox_pages_drain_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        let c = client(1);
        db.add_or_update_cafe_client(&c).unwrap();
        for n in 0..12 {
            db.add_or_update_cafe_client_message(&inbox_message(n, c.id)).unwrap();
        }

        let page = db.list_cafe_client_messages(&c.id, 10).unwrap();
        assert_eq!(page.len(), 10);
        assert_eq!(page[0].envelope, vec![0]);

        assert_eq!(db.delete_cafe_client_messages(&c.id, page[9].seq).unwrap(), 2);
        let rest = db.list_cafe_client_messages(&c.id, 10).unwrap();
        assert_eq!(rest[0].envelope, vec![10]);
        assert_eq!(db.delete_cafe_client_messages(&c.id, rest[1].seq).unwrap(), 0);
    }

    #[test]
    fn inbox_delete_keeps_later_arrivals() {
        let db = Database::open_in_memory().unwrap();
        let c = client(1);
        db.add_or_update_cafe_client(&c).unwrap();
        db.add_or_update_cafe_client_message(&inbox_message(0, c.id)).unwrap();
        db.add_or_update_cafe_client_message(&inbox_message(1, c.id)).unwrap();

        let page = db.list_cafe_client_messages(&c.id, 10).unwrap();
        db.add_or_update_cafe_client_message(&inbox_message(2, c.id)).unwrap();

        assert_eq!(db.delete_cafe_client_messages(&c.id, page[1].seq).unwrap(), 1);
        let rest = db.list_cafe_client_messages(&c.id, 10).unwrap();
        assert_eq!(rest[0].envelope, vec![2]);
    }

    #[test]
    fn deleting_client_drops_backups() {
        let db = Database::open_in_memory().unwrap();
        let c = client(1);
        db.add_or_update_cafe_client(&c).unwrap();
        db.add_or_update_cafe_client_thread(&CafeClientThread {
            id: ThreadId([5u8; 32]),
            client_id: c.id,
            ciphertext: vec![1, 2, 3],
            updated_at: Utc::now(),
        })
        .unwrap();
        assert_eq!(db.list_cafe_client_threads(&c.id).unwrap().len(), 1);

        db.delete_cafe_client(&c.id).unwrap();
        assert!(db.list_cafe_client_threads(&c.id).unwrap().is_empty());
    }

    #[test]
    fn pins_are_counted_per_client() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (client(1), client(2));
        db.add_or_update_cafe_client(&a).unwrap();
        db.add_or_update_cafe_client(&b).unwrap();
        let cid = ContentId::of(b"shared");

        db.add_cafe_client_pin(&cid, &a.id).unwrap();
        db.add_cafe_client_pin(&cid, &a.id).unwrap();
        db.add_cafe_client_pin(&cid, &b.id).unwrap();
        assert_eq!(db.count_cafe_client_pins(&cid).unwrap(), 2);

        assert!(db.delete_cafe_client_pin(&cid, &a.id).unwrap());
        assert!(!db.delete_cafe_client_pin(&cid, &a.id).unwrap());
        db.delete_cafe_client(&b.id).unwrap();
        assert_eq!(db.count_cafe_client_pins(&cid).unwrap(), 0);
    }

    #[test]
    fn token_lookup_by_hash() {
        let db = Database::open_in_memory().unwrap();
        db.add_cafe_token(&CafeToken {
            id: "t1".to_string(),
            token_hash: "h1".to_string(),
            created_at: Utc::now(),
        })
        .unwrap();
        assert!(db.has_cafe_token_hash("h1").unwrap());
        assert!(!db.has_cafe_token_hash("h2").unwrap());
        assert!(db.delete_cafe_token("t1").unwrap());
        assert!(db.list_cafe_tokens().unwrap().is_empty());
    }
}
