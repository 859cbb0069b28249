//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation. [`Datastore`] shares one
//! `Database` between tasks.
//!
//! Note: SQLCipher (encrypted SQLite) requires OpenSSL at build time. Without
//! the `sqlcipher` feature the key passed to [`Database::open_at`] is unused
//! and the file is plain SQLite; thread blocks are encrypted before they
//! reach the content store either way.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default node database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/loom/loom.db`
    /// - macOS:   `~/Library/Application Support/org.loom.loom/loom.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\loom\loom\data\loom.db`
    pub fn new(db_key: &[u8; 32]) -> Result<Self> {
        let project_dirs = ProjectDirs::from("org", "loom", "loom").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("loom.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path, db_key)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path, db_key: &[u8; 32]) -> Result<Self> {
        let conn = Connection::open(path)?;

        #[cfg(feature = "sqlcipher")]
        conn.pragma_update(None, "key", format!("x'{}'", hex::encode(db_key)))?;
        #[cfg(not(feature = "sqlcipher"))]
        let _ = db_key;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return a mutable reference to the underlying connection.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

/// Cloneable handle to a [`Database`] shared between tasks.
///
/// Every access goes through [`Datastore::with`], whose closure is
/// synchronous, so the lock is never held across an await point.
#[derive(Clone)]
pub struct Datastore {
    inner: Arc<Mutex<Database>>,
}

impl Datastore {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Run `f` with exclusive access to the database.
    pub fn with<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let guard = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }

    /// Run `f` inside a transaction, committing when it succeeds.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = guard.conn_mut().transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let key = [0xABu8; 32];

        let db = Database::open_at(&path, &key).expect("should open");
        assert!(db.path().is_some());
    }

    #[test]
    fn reopen_keeps_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let key = [0u8; 32];

        drop(Database::open_at(&path, &key).unwrap());
        let db = Database::open_at(&path, &key).unwrap();
        let version: u32 = db
            .conn()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, migrations::CURRENT_VERSION);
    }
}
