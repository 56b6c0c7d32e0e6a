//! Versioned schema migrations, tracked with SQLite's built-in
//! `user_version` pragma instead of a bespoke version table — the embedded
//! engine already gives us a durable integer slot for exactly this.

use hashfs_util::{fail_einit, HfsError, Result};
use rusqlite::Connection;

/// One schema step. `version` must be strictly increasing across the slice
/// passed to [`run`]; `sql` runs once, inside the migration transaction, the
/// first time a database is opened at a `user_version` below it.
pub struct Migration {
    version: i64,
    sql: &'static str,
}

impl Migration {
    pub const fn new(version: i64, sql: &'static str) -> Migration {
        Migration { version, sql }
    }
}

pub fn run(conn: &Connection, migrations: &[Migration]) -> Result<()> {
    let current: i64 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .map_err(HfsError::from)?;

    let mut sorted: Vec<&Migration> = migrations.iter().collect();
    sorted.sort_by_key(|m| m.version);

    for m in sorted {
        if m.version <= current {
            continue;
        }
        conn.execute_batch(m.sql).map_err(|e| {
            fail_einit(format!(
                "migration to version {} failed: {e}",
                m.version
            ))
        })?;
        conn.pragma_update(None, "user_version", m.version)
            .map_err(HfsError::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_only_newer_versions() {
        let conn = Connection::open_in_memory().unwrap();
        let migrations = vec![
            Migration::new(1, "CREATE TABLE a (id INTEGER PRIMARY KEY)"),
            Migration::new(2, "CREATE TABLE b (id INTEGER PRIMARY KEY)"),
        ];
        run(&conn, &migrations).unwrap();
        conn.execute("INSERT INTO a DEFAULT VALUES", []).unwrap();
        conn.execute("INSERT INTO b DEFAULT VALUES", []).unwrap();

        // Re-running with the same set must not re-execute CREATE TABLE.
        run(&conn, &migrations).unwrap();
    }
}
