//! Lightweight migration runner for rusqlite.
//!
//! Numbered SQL files under `migrations/` are compiled into the binary,
//! applied versions are tracked in `schema_versions`, and any pending
//! migrations run in order at startup.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::info;

/// `(version, name, sql)`, ascending by version.
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "001_sessions",
    include_str!("../migrations/001_sessions.sql"),
)];

/// Run all pending migrations against the given connection.
///
/// Call this before any other database operations. Returns the number of
/// migrations applied.
pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<usize> {
    // Set pragmas for safe concurrent access
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let mut pending = 0;
    for (version, name, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![version, name],
        )?;
        tx.commit()?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = version,
            name = %name,
            "Applied migration"
        );
        pending += 1;
    }

    let total = MIGRATIONS.len();
    info!(
        component = "migrations",
        event = "migrations.complete",
        total = total,
        applied = pending,
        skipped = total - pending,
        "Migration check complete"
    );

    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_applied_once() {
        let mut conn = Connection::open_in_memory().expect("open");
        assert_eq!(run_migrations(&mut conn).expect("first run"), MIGRATIONS.len());
        assert_eq!(run_migrations(&mut conn).expect("second run"), 0);

        let recorded: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_versions", [], |row| row.get(0))
            .expect("count");
        assert_eq!(recorded, MIGRATIONS.len() as i64);
    }

    #[test]
    fn versions_are_ascending() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|(v, _, _)| *v).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }
}
