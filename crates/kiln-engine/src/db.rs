//! Embedded key/value database.
//!
//! `SQLite`-backed persistence for the two relations the engine maintains:
//!
//! - `path_to_id`: which id a materialised store path was registered under.
//! - `successors`: the memo edge from a term's id to the id of its normal
//!   form.
//!
//! Both tables are keyed by a single column and written with idempotent
//! upserts; the successor table is advisory (losing it costs rebuilds, not
//! correctness). The store may be shared across engine processes;
//! `SQLite` provides the per-statement transactional isolation the
//! contract asks for.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use kiln_core::FsId;

/// Database failure.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database file could not be opened.
    #[error("cannot open database at `{path}`: {source}")]
    Open {
        /// Configured database location.
        path: PathBuf,
        /// Underlying `SQLite` error.
        source: rusqlite::Error,
    },

    /// A statement failed.
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// The connection lock was poisoned by a panicking thread.
    #[error("database connection lock poisoned")]
    LockPoisoned,

    /// A stored id column does not parse as an id.
    #[error("corrupt id `{value}` in table `{table}`")]
    CorruptId {
        /// Table holding the bad value.
        table: &'static str,
        /// The bad value.
        value: String,
    },
}

/// Handle to the embedded database.
#[derive(Debug)]
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Opens (creating if needed) the database at `path` and ensures the
    /// schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] if the file cannot be opened and
    /// [`DbError::Query`] if schema creation fails.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path).map_err(|source| DbError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a private in-memory database. Test fixtures only.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Query`] if schema creation fails.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().map_err(DbError::Query)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), DbError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS path_to_id (
                path TEXT PRIMARY KEY,
                id TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_path_to_id_id ON path_to_id(id)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS successors (
                id TEXT PRIMARY KEY,
                successor TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, DbError>) -> Result<T, DbError> {
        let conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        f(&conn)
    }

    /// Looks up the id a path was registered under.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure or a corrupt stored id.
    pub fn id_for_path(&self, path: &Path) -> Result<Option<FsId>, DbError> {
        self.with_conn(|conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT id FROM path_to_id WHERE path = ?1",
                    params![path_key(path)],
                    |row| row.get(0),
                )
                .optional()?;
            value.map(|v| parse_stored_id("path_to_id", v)).transpose()
        })
    }

    /// Registers (or idempotently re-registers) a path under an id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on write failure.
    pub fn set_path_id(&self, path: &Path, id: FsId) -> Result<(), DbError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO path_to_id (path, id) VALUES (?1, ?2)
                 ON CONFLICT(path) DO UPDATE SET id = excluded.id",
                params![path_key(path), id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Removes a path registration, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on write failure.
    pub fn remove_path(&self, path: &Path) -> Result<(), DbError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM path_to_id WHERE path = ?1",
                params![path_key(path)],
            )?;
            Ok(())
        })
    }

    /// Returns every path registered under an id, in path order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub fn paths_for_id(&self, id: FsId) -> Result<Vec<PathBuf>, DbError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT path FROM path_to_id WHERE id = ?1 ORDER BY path")?;
            let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;
            let mut paths = Vec::new();
            for row in rows {
                paths.push(PathBuf::from(row?));
            }
            Ok(paths)
        })
    }

    /// Reads the memoised successor of an id, if one is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure or a corrupt stored id.
    pub fn successor(&self, id: FsId) -> Result<Option<FsId>, DbError> {
        self.with_conn(|conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT successor FROM successors WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            value.map(|v| parse_stored_id("successors", v)).transpose()
        })
    }

    /// Records `from -> to` in the successor table. Overwriting is
    /// idempotent: ids determine serialisations, so a re-registration
    /// writes the same value.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on write failure.
    pub fn set_successor(&self, from: FsId, to: FsId) -> Result<(), DbError> {
        debug!(from = %from, to = %to, "registering successor");
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO successors (id, successor) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET successor = excluded.successor",
                params![from.to_string(), to.to_string()],
            )?;
            Ok(())
        })
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_stored_id(table: &'static str, value: String) -> Result<FsId, DbError> {
    value.parse().map_err(|_| DbError::CorruptId { table, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::hash_bytes;

    fn id(tag: &str) -> FsId {
        hash_bytes(tag.as_bytes())
    }

    #[test]
    fn test_path_registration_round_trip() {
        let db = Db::open_in_memory().unwrap();
        let path = Path::new("/store/abc");

        assert_eq!(db.id_for_path(path).unwrap(), None);
        db.set_path_id(path, id("a")).unwrap();
        assert_eq!(db.id_for_path(path).unwrap(), Some(id("a")));
    }

    #[test]
    fn test_set_path_id_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let path = Path::new("/store/abc");

        db.set_path_id(path, id("a")).unwrap();
        db.set_path_id(path, id("a")).unwrap();
        assert_eq!(db.id_for_path(path).unwrap(), Some(id("a")));
        assert_eq!(db.paths_for_id(id("a")).unwrap(), vec![PathBuf::from("/store/abc")]);
    }

    #[test]
    fn test_remove_path() {
        let db = Db::open_in_memory().unwrap();
        let path = Path::new("/store/abc");

        db.set_path_id(path, id("a")).unwrap();
        db.remove_path(path).unwrap();
        assert_eq!(db.id_for_path(path).unwrap(), None);
    }

    #[test]
    fn test_paths_for_id_ordered() {
        let db = Db::open_in_memory().unwrap();
        db.set_path_id(Path::new("/store/b"), id("x")).unwrap();
        db.set_path_id(Path::new("/store/a"), id("x")).unwrap();
        db.set_path_id(Path::new("/store/c"), id("y")).unwrap();

        assert_eq!(
            db.paths_for_id(id("x")).unwrap(),
            vec![PathBuf::from("/store/a"), PathBuf::from("/store/b")]
        );
    }

    #[test]
    fn test_successor_lookup_and_idempotent_register() {
        let db = Db::open_in_memory().unwrap();

        assert_eq!(db.successor(id("a")).unwrap(), None);
        db.set_successor(id("a"), id("b")).unwrap();
        db.set_successor(id("a"), id("b")).unwrap();
        assert_eq!(db.successor(id("a")).unwrap(), Some(id("b")));
    }

    #[test]
    fn test_open_creates_file_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("kiln.sqlite");

        {
            let db = Db::open(&db_path).unwrap();
            db.set_successor(id("a"), id("b")).unwrap();
        }
        let db = Db::open(&db_path).unwrap();
        assert_eq!(db.successor(id("a")).unwrap(), Some(id("b")));
    }
}
