//! Schema migrations, applied in order when a database is opened.
//!
//! `PRAGMA user_version` records the last applied step, so each runs once.

pub mod v001_initial;
pub mod v002_client_pins;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// `(version, name, step)`; append new steps at the end.
const MIGRATIONS: &[(u32, &str, Step)] = &[
    (1, "v001_initial", v001_initial::up),
    (2, "v002_client_pins", v002_client_pins::up),
];

/// Schema version after every step has run.
pub const CURRENT_VERSION: u32 = MIGRATIONS[MIGRATIONS.len() - 1].0;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    tracing::debug!(current_version = current, target_version = CURRENT_VERSION, "checking database migrations");

    for (version, name, step) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        tracing::info!(migration = name, "applying migration");
        step(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }

    Ok(())
}
