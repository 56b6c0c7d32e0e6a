//! Thin layer over an embedded SQL engine: a per-database connection with a
//! prepared-statement cache, WAL journaling, a busy timeout, and a bounded
//! transaction helper. Every persistent store in the engine (catalog,
//! metadata shards, block indexes, job queue, transfer queue) opens one of
//! these per file under the node's root directory.
//!
//! Generalizes the connection-handle role a `KeyValueDB` wrapper plays over
//! RocksDB column families, and the versioned-upgrade role a migration
//! crate plays, onto a relational `rusqlite` backend: prepared statements,
//! transactions, WAL, and a busy-timeout, which only an embedded SQL engine
//! provides directly.

mod migrate;

use std::path::Path;

use hashfs_util::{fail_einternal, HfsError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction};

pub use migrate::Migration;
pub use rusqlite::{params, Row};

/// Default busy timeout: long enough to ride out a GC sweep or a peer's
/// flush transaction on the same file, short enough that a genuinely wedged
/// writer fails fast instead of hanging a caller forever.
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5_000;

/// A single-process handle onto one on-disk database file. All access is
/// serialized through an internal mutex: the engine itself is single
/// threaded within a process (§5), but a handle may still be shared across
/// Arc clones inside one process (e.g. a block-store shard accessed from
/// both the request path and a background GC sweep).
pub struct Handle {
    conn: Mutex<Connection>,
    path: std::path::PathBuf,
}

impl Handle {
    /// Open (creating if absent) the database at `path`, applying the
    /// engine's standard pragmas, then run `migrations` in version order.
    pub fn open(path: &Path, migrations: &[Migration]) -> Result<Handle> {
        let conn = Connection::open(path).map_err(HfsError::from)?;
        configure(&conn)?;
        migrate::run(&conn, migrations)?;
        Ok(Handle {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Open a private in-memory database; used by tests and by callers that
    /// only need the schema, not durability.
    pub fn open_memory(migrations: &[Migration]) -> Result<Handle> {
        let conn = Connection::open_in_memory().map_err(HfsError::from)?;
        configure(&conn)?;
        migrate::run(&conn, migrations)?;
        Ok(Handle {
            conn: Mutex::new(conn),
            path: std::path::PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside a short, bounded transaction. The transaction commits
    /// if `f` returns `Ok`, rolls back otherwise. Callers compose GC sweeps
    /// and listing out of many small calls to this rather than one call
    /// spanning the whole operation, so a write lock is never held across
    /// network I/O (§5).
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(HfsError::from)?;
        let result = f(&tx)?;
        tx.commit().map_err(HfsError::from)?;
        Ok(result)
    }

    /// Execute a statement with no result, using the connection's prepared
    /// statement cache (keyed by SQL text, per the "per-connection statement
    /// cache" design note — `rusqlite::prepare_cached` already implements
    /// exactly that, and resets bindings on drop so callers never do it by
    /// hand).
    pub fn execute_cached(&self, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql).map_err(HfsError::from)?;
        stmt.execute(params).map_err(HfsError::from)
    }

    pub fn query_row_cached<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        f: impl FnOnce(&Row) -> rusqlite::Result<T>,
    ) -> Result<Option<T>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql).map_err(HfsError::from)?;
        stmt.query_row(params, f).optional().map_err(HfsError::from)
    }

    /// Run `f` with direct access to the connection, e.g. for `query_map`
    /// calls that need to stream many rows (listing, GC batches).
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(std::time::Duration::from_millis(
        DEFAULT_BUSY_TIMEOUT_MS as u64,
    ))
    .map_err(HfsError::from)?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(HfsError::from)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(HfsError::from)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| fail_einternal(format!("enabling foreign keys: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrations() -> Vec<Migration> {
        vec![Migration::new(1, "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT NOT NULL)")]
    }

    #[test]
    fn open_memory_runs_migrations() {
        let h = Handle::open_memory(&migrations()).unwrap();
        h.execute_cached("INSERT INTO t (v) VALUES (?1)", params!["hello"])
            .unwrap();
        let v: Option<String> = h
            .query_row_cached("SELECT v FROM t WHERE id = ?1", params![1], |r| r.get(0))
            .unwrap();
        assert_eq!(v.as_deref(), Some("hello"));
    }

    #[test]
    fn migrations_are_idempotent_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.db");
        {
            let h = Handle::open(&path, &migrations()).unwrap();
            h.execute_cached("INSERT INTO t (v) VALUES (?1)", params!["a"])
                .unwrap();
        }
        let h = Handle::open(&path, &migrations()).unwrap();
        let v: Option<String> = h
            .query_row_cached("SELECT v FROM t WHERE id = ?1", params![1], |r| r.get(0))
            .unwrap();
        assert_eq!(v.as_deref(), Some("a"));
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let h = Handle::open_memory(&migrations()).unwrap();
        let result: Result<()> = h.with_tx(|tx| {
            tx.execute("INSERT INTO t (v) VALUES (?1)", params!["x"])
                .unwrap();
            Err(hashfs_util::einval("deliberate abort"))
        });
        assert!(result.is_err());
        let count: Option<i64> = h
            .query_row_cached("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, Some(0));
    }
}
