//! v001 -- Initial schema creation.
//!
//! Creates the ledger tables (`threads`, `blocks`, `thread_peers`, `peers`,
//! `thread_invites`), the three delivery queues (`block_messages`,
//! `cafe_requests`, `cafe_messages`), client-side `cafe_sessions`, and the
//! tables used when this node hosts a cafe.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Threads
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS threads (
    id          TEXT PRIMARY KEY NOT NULL,   -- hex thread public key
    key         TEXT NOT NULL UNIQUE,        -- application key
    secret      TEXT NOT NULL,               -- hex thread secret key
    name        TEXT NOT NULL,
    schema_id   TEXT,                        -- content id
    initiator   TEXT NOT NULL,               -- account address
    type        TEXT NOT NULL,
    sharing     TEXT NOT NULL,
    whitelist   TEXT NOT NULL,               -- JSON array of addresses
    head        TEXT NOT NULL DEFAULT '',    -- comma-joined content ids
    created_at  TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Blocks
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocks (
    id         TEXT PRIMARY KEY NOT NULL,    -- content id of the ciphertext
    thread_id  TEXT NOT NULL,
    author     TEXT,                         -- NULL for merges
    address    TEXT,
    type       TEXT NOT NULL,
    date       TEXT NOT NULL,
    target     TEXT,
    body       TEXT,
    parents    TEXT NOT NULL DEFAULT '',

    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_blocks_thread_date ON blocks(thread_id, date);
CREATE INDEX IF NOT EXISTS idx_blocks_target ON blocks(target);

-- ----------------------------------------------------------------
-- Thread peers
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS thread_peers (
    id         TEXT NOT NULL,                -- peer id
    thread_id  TEXT NOT NULL,
    welcomed   INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (id, thread_id),
    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Contacts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS peers (
    id          TEXT PRIMARY KEY NOT NULL,
    address     TEXT NOT NULL,
    name        TEXT NOT NULL,
    avatar      TEXT,
    inboxes     TEXT NOT NULL,               -- JSON array of cafes
    updated_at  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Pending invites
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS thread_invites (
    id         TEXT PRIMARY KEY NOT NULL,    -- content id of the invite block
    thread_id  TEXT NOT NULL,
    name       TEXT NOT NULL,
    inviter    TEXT NOT NULL,
    block      BLOB NOT NULL,                -- opened invite block
    date       TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Block delivery queue
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS block_messages (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    peer        TEXT NOT NULL,
    envelope    BLOB NOT NULL,
    sync_group  TEXT,
    date        TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Cafe sessions (client side)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_sessions (
    id          TEXT PRIMARY KEY NOT NULL,   -- cafe peer id
    access      TEXT NOT NULL,
    exp         TEXT NOT NULL,
    refresh     TEXT NOT NULL,
    rexp        TEXT NOT NULL,
    subject     TEXT NOT NULL,
    token_type  TEXT NOT NULL,
    cafe        TEXT NOT NULL                -- JSON cafe record
);

-- ----------------------------------------------------------------
-- Cafe request queue
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_requests (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    peer        TEXT NOT NULL,               -- owner, or recipient for inbox requests
    target      TEXT NOT NULL,
    cafe_id     TEXT NOT NULL,
    cafe        TEXT NOT NULL,               -- JSON cafe record
    type        TEXT NOT NULL,
    sync_group  TEXT,
    date        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cafe_requests_cafe ON cafe_requests(cafe_id);
CREATE INDEX IF NOT EXISTS idx_cafe_requests_group ON cafe_requests(sync_group);

-- ----------------------------------------------------------------
-- Cafe inbox queue
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_messages (
    seq       INTEGER PRIMARY KEY AUTOINCREMENT,
    id        TEXT NOT NULL UNIQUE,          -- content id of the sealed envelope
    peer      TEXT NOT NULL,                 -- sender
    date      TEXT NOT NULL,
    attempts  INTEGER NOT NULL DEFAULT 0
);

-- ----------------------------------------------------------------
-- Cafe host: clients, nonces, thread backups, inboxes, dev tokens
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_clients (
    id          TEXT PRIMARY KEY NOT NULL,   -- client peer id
    address     TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    last_seen   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cafe_client_nonces (
    value    TEXT PRIMARY KEY NOT NULL,
    address  TEXT NOT NULL,
    date     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cafe_client_threads (
    id          TEXT NOT NULL,
    client_id   TEXT NOT NULL,
    ciphertext  BLOB NOT NULL,
    updated_at  TEXT NOT NULL,

    PRIMARY KEY (id, client_id),
    FOREIGN KEY (client_id) REFERENCES cafe_clients(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS cafe_client_messages (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    id         TEXT NOT NULL,
    peer       TEXT NOT NULL,
    client_id  TEXT NOT NULL,
    envelope   BLOB NOT NULL,
    date       TEXT NOT NULL,

    UNIQUE (id, client_id),
    FOREIGN KEY (client_id) REFERENCES cafe_clients(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS cafe_tokens (
    id          TEXT PRIMARY KEY NOT NULL,
    token_hash  TEXT NOT NULL UNIQUE,        -- hex BLAKE3 of the token
    created_at  TEXT NOT NULL
);
"#;

/// Apply the v001 migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
