//! Schema migration driver.
//!
//! Migration scripts are embedded in the binary and executed in
//! lexicographical order of their names. Once a script has run, its name
//! is recorded in the `migrations` table so it is never re-executed; each
//! script runs inside its own transaction to prevent partial migrations.

use rusqlite::Connection;
use tracing::debug;

use tessera_common::{Error, Result};

/// The embedded migration set, applied at every startup.
pub const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_pairs.sql", include_str!("../migrations/0001_pairs.sql")),
    ("0002_fsm_meta.sql", include_str!("../migrations/0002_fsm_meta.sql")),
];

/// Apply all pending migrations to the given database.
///
/// Idempotent: scripts recorded in the `migrations` table are skipped.
/// Any failure is fatal to node startup.
pub fn apply(conn: &mut Connection, migrations: &[(&str, &str)]) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (name TEXT PRIMARY KEY)",
        [],
    )
    .map_err(db_err)?;

    let mut ordered: Vec<&(&str, &str)> = migrations.iter().collect();
    ordered.sort_by_key(|(name, _)| *name);

    for (name, script) in ordered {
        apply_one(conn, name, script)?;
    }
    debug!("all migrations applied");
    Ok(())
}

/// Run a single migration script in its own transaction and record it.
fn apply_one(conn: &mut Connection, name: &str, script: &str) -> Result<()> {
    let tx = conn.transaction().map_err(db_err)?;

    let already: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM migrations WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    if already != 0 {
        debug!(name, "migration already applied, skipping");
        return Ok(());
    }

    tx.execute_batch(script)
        .map_err(|e| Error::Storage(format!("migration {name}: {e}")))?;
    tx.execute("INSERT INTO migrations (name) VALUES (?1)", [name])
        .map_err(db_err)?;
    tx.commit().map_err(db_err)?;
    debug!(name, "migration applied");
    Ok(())
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_creates_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply(&mut conn, MIGRATIONS).unwrap();

        // Both tables exist afterwards.
        let pairs: i64 = conn
            .query_row("SELECT COUNT(*) FROM pairs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pairs, 0);
        let applied: i64 = conn
            .query_row(
                "SELECT value FROM fsm_meta WHERE name = 'last_applied'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply(&mut conn, MIGRATIONS).unwrap();
        apply(&mut conn, MIGRATIONS).unwrap();

        let recorded: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(recorded, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_scripts_run_in_name_order() {
        // The second script seeds a row into the table the first creates;
        // passing them out of order must not matter.
        let out_of_order = [MIGRATIONS[1], MIGRATIONS[0]];
        let mut conn = Connection::open_in_memory().unwrap();
        apply(&mut conn, &out_of_order).unwrap();
    }

    #[test]
    fn test_failing_script_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        let bad = [("0001_bad.sql", "CREATE TABLE t (x); THIS IS NOT SQL;")];
        assert!(apply(&mut conn, &bad).is_err());

        // The failed script must not be recorded as applied.
        let recorded: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(recorded, 0);
    }
}
