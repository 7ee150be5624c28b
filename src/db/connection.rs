// src/db/connection.rs
use rusqlite::Connection;
use std::cell::RefCell;

use crate::errors::{Error, Result};

// Thread-local connection slot. Each (scraper, area) worker thread, the
// watchdog, and the periodic C4/C5 workers each get their own handle;
// SQLite's own file locking serializes concurrent writers, so no pool
// or mutex is needed around the handle itself (spec §5: "the relational
// store is the single source of truth").
thread_local! {
    static DB_CONN: RefCell<Option<Connection>> = RefCell::new(None);
}

#[derive(Clone)]
pub struct Database {
    path: String,
}

impl Database {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_memory() -> Self {
        Self { path: ":memory:".to_string() }
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .map_err(|e| Error::Db(format!("open db {}: {e}", self.path)))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        if self.path != ":memory:" {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.busy_timeout(std::time::Duration::from_secs(10))?;
        }
        Ok(conn)
    }

    /// Provides a connection to the closure, opening (and caching, per
    /// thread) one on first use.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        // In-memory DBs can't be shared across a thread-local slot per
        // thread (each thread would get its own empty db), so tests
        // that use Database::in_memory() must use a single thread and a
        // connection kept alive outside this helper. Production code
        // always uses a file path.
        DB_CONN.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_none() {
                *slot = Some(self.open()?);
            }
            let conn = slot.as_mut().unwrap();
            f(conn)
        })
    }

    pub fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(crate::db::schema::SCHEMA_SQL)?;
            Ok(())
        })
    }
}

#[cfg(test)]
pub fn test_db() -> Database {
    // A uniquely named temp file so each test thread gets its own db
    // but `Database::with_conn`'s thread-local caching still works.
    let file = tempfile::NamedTempFile::new().expect("tempfile");
    let path = file.path().to_string_lossy().to_string();
    std::mem::forget(file); // keep the file alive for the test's duration
    let db = Database::new(path);
    db.init_schema().expect("schema init");
    db
}
