//! Durable cafe work queue ([`CafeRequest`]).

use rusqlite::params;

use loom_shared::types::{ContentId, PeerId};

use crate::database::Database;
use crate::error::Result;
use crate::models::CafeRequest;
use crate::sql::{fmt_time, parse_col, parse_json, parse_time};

impl Database {
    pub fn add_cafe_request(&self, req: &CafeRequest) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO cafe_requests (id, peer, target, cafe_id, cafe, type, sync_group, date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                req.id,
                req.peer.to_hex(),
                req.target,
                req.cafe.peer.to_hex(),
                serde_json::to_string(&req.cafe)?,
                req.request_type.as_str(),
                req.sync_group.as_ref().map(|g| g.as_str()),
                fmt_time(&req.date),
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Oldest requests after queue position `offset`.
    pub fn list_cafe_requests(&self, offset: i64, limit: usize) -> Result<Vec<CafeRequest>> {
        let mut stmt = self.conn().prepare(
            "SELECT seq, id, peer, target, cafe, type, sync_group, date
             FROM cafe_requests
             WHERE seq > ?1
             ORDER BY seq ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![offset, limit as i64], |row| {
            let peer: String = row.get(2)?;
            let cafe: String = row.get(4)?;
            let kind: String = row.get(5)?;
            let group: Option<String> = row.get(6)?;
            let date: String = row.get(7)?;
            Ok(CafeRequest {
                seq: row.get(0)?,
                id: row.get(1)?,
                peer: parse_col(2, &peer)?,
                target: row.get(3)?,
                cafe: parse_json(4, &cafe)?,
                request_type: parse_col(5, &kind)?,
                sync_group: group.map(|g| parse_col(6, &g)).transpose()?,
                date: parse_time(7, &date)?,
            })
        })?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    pub fn delete_cafe_request(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM cafe_requests WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// Drop every request bound for a cafe, e.g. after deregistering.
    pub fn delete_cafe_requests_by_cafe(&self, cafe_id: &PeerId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM cafe_requests WHERE cafe_id = ?1",
            params![cafe_id.to_hex()],
        )?;
        Ok(affected)
    }

    pub fn count_cafe_requests(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM cafe_requests", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_cafe_requests_by_group(&self, group: &ContentId) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM cafe_requests WHERE sync_group = ?1",
            params![group.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cafe_sessions::tests::sample_cafe;
    use chrono::Utc;
    use loom_shared::types::CafeRequestType;

    fn request(n: u8, cafe: u8, group: Option<ContentId>) -> CafeRequest {
        CafeRequest {
            seq: 0,
            id: format!("req{n}"),
            peer: PeerId([n; 32]),
            target: ContentId::of(&[n]).to_string(),
            cafe: sample_cafe(cafe),
            request_type: CafeRequestType::Store,
            sync_group: group,
            date: Utc::now(),
        }
    }

    #[test]
    fn requests_keep_insertion_order_and_cafe() {
        let db = Database::open_in_memory().unwrap();
        let group = ContentId::of(b"g");
        db.add_cafe_request(&request(1, 9, Some(group.clone()))).unwrap();
        db.add_cafe_request(&request(2, 9, Some(group.clone()))).unwrap();
        db.add_cafe_request(&request(3, 8, None)).unwrap();

        let listed = db.list_cafe_requests(0, 16).unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["req1", "req2", "req3"]);
        assert_eq!(listed[0].cafe, sample_cafe(9));
        assert_eq!(listed[0].request_type, CafeRequestType::Store);

        assert_eq!(db.count_cafe_requests_by_group(&group).unwrap(), 2);
        assert_eq!(db.delete_cafe_requests_by_cafe(&PeerId([9u8; 32])).unwrap(), 2);
        assert_eq!(db.count_cafe_requests_by_group(&group).unwrap(), 0);
        assert_eq!(db.count_cafe_requests().unwrap(), 1);
    }
}
