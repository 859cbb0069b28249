//! v002 -- Per-client pins on a cafe host.
//!
//! An object stays pinned while at least one registered client holds it.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cafe_client_pins (
    cid        TEXT NOT NULL,
    client_id  TEXT NOT NULL,

    PRIMARY KEY (cid, client_id),
    FOREIGN KEY (client_id) REFERENCES cafe_clients(id) ON DELETE CASCADE
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
