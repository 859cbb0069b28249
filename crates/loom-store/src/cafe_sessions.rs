//! Client-side [`CafeSession`] records.

use rusqlite::params;

use loom_shared::types::PeerId;

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::CafeSession;
use crate::sql::{fmt_time, parse_col, parse_json, parse_time};

const COLUMNS: &str = "id, access, exp, refresh, rexp, subject, token_type, cafe";

impl Database {
    /// Store a session, replacing any previous one with the same cafe.
    pub fn add_or_update_cafe_session(&self, session: &CafeSession) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT OR REPLACE INTO cafe_sessions ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                session.id.to_hex(),
                session.access,
                fmt_time(&session.exp),
                session.refresh,
                fmt_time(&session.rexp),
                session.subject.to_hex(),
                session.token_type,
                serde_json::to_string(&session.cafe)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_cafe_session(&self, cafe_id: &PeerId) -> Result<CafeSession> {
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM cafe_sessions WHERE id = ?1"),
                params![cafe_id.to_hex()],
                row_to_session,
            )
            .map_err(not_found)
    }

    pub fn list_cafe_sessions(&self) -> Result<Vec<CafeSession>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {COLUMNS} FROM cafe_sessions ORDER BY id"))?;

        let rows = stmt.query_map([], row_to_session)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    pub fn delete_cafe_session(&self, cafe_id: &PeerId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM cafe_sessions WHERE id = ?1",
            params![cafe_id.to_hex()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<CafeSession> {
    let id: String = row.get(0)?;
    let exp: String = row.get(2)?;
    let rexp: String = row.get(4)?;
    let subject: String = row.get(5)?;
    let cafe: String = row.get(7)?;

    Ok(CafeSession {
        id: parse_col(0, &id)?,
        access: row.get(1)?,
        exp: parse_time(2, &exp)?,
        refresh: row.get(3)?,
        rexp: parse_time(4, &rexp)?,
        subject: parse_col(5, &subject)?,
        token_type: row.get(6)?,
        cafe: parse_json(7, &cafe)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use loom_shared::protocol::Cafe;
    use loom_shared::types::Address;

    pub(crate) fn sample_cafe(seed: u8) -> Cafe {
        Cafe {
            peer: PeerId([seed; 32]),
            address: Address([seed; 32]),
            api: "v1".to_string(),
            protocol: "/loom/cafe/1.0.0".to_string(),
            node: "0.1.0".to_string(),
            url: String::new(),
        }
    }

    fn session(seed: u8, access: &str) -> CafeSession {
        CafeSession {
            id: PeerId([seed; 32]),
            access: access.to_string(),
            exp: Utc::now(),
            refresh: format!("r{access}"),
            rexp: Utc::now(),
            subject: PeerId([1u8; 32]),
            token_type: "ed25519".to_string(),
            cafe: sample_cafe(seed),
        }
    }

    #[test]
    fn session_is_replaced_not_merged() {
        let db = Database::open_in_memory().unwrap();
        db.add_or_update_cafe_session(&session(2, "a1")).unwrap();
        db.add_or_update_cafe_session(&session(2, "a2")).unwrap();

        let sessions = db.list_cafe_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].access, "a2");
        assert_eq!(sessions[0].cafe, sample_cafe(2));

        assert!(db.delete_cafe_session(&PeerId([2u8; 32])).unwrap());
        assert!(db.get_cafe_session(&PeerId([2u8; 32])).is_err());
    }
}
