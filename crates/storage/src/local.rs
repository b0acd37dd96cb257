//! The SQLite-backed local store.
//!
//! One write connection (guarded by a mutex, used only by the FSM apply
//! path and restore) plus a small r2d2 pool of read connections for point
//! lookups, the full-table cursor and snapshots. WAL journaling keeps
//! readers and the single writer from blocking each other.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tessera_common::{Error, LogIndex, Result};

use crate::migrate;

/// Name of the on-disk SQLite data file inside the raft directory.
pub const DATA_FILE_NAME: &str = "sqlite3.db";

/// Number of pooled read connections.
const READ_POOL_SIZE: u32 = 8;

/// Rows fetched per batch by [`PairCursor`].
const SCAN_BATCH: usize = 256;

/// One user-visible key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub key: String,
    pub value: String,
}

/// Durable, non-replicated key/value store over the `pairs` table.
///
/// Mutating methods exist in two flavours: the plain [`set`]/[`delete`]
/// contract operations, and the `apply_*` variants used by the FSM which
/// additionally advance the `last_applied` marker inside the same
/// transaction, so a crash can never separate a mutation from its log
/// position.
///
/// [`set`]: LocalStore::set
/// [`delete`]: LocalStore::delete
pub struct LocalStore {
    write: Mutex<Connection>,
    read_pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl LocalStore {
    /// Open (or create) the store inside `dir` and bring the schema up to
    /// date.
    ///
    /// Enables WAL journaling and foreign-key enforcement, then runs the
    /// migration driver. Any failure here is fatal to node startup.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("create {}: {e}", dir.display())))?;
        let path = dir.join(DATA_FILE_NAME);

        let mut write = Connection::open(&path)
            .map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))?;
        configure(&write)?;
        migrate::apply(&mut write, migrate::MIGRATIONS)?;

        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            Ok(())
        });
        let read_pool = Pool::builder()
            .max_size(READ_POOL_SIZE)
            .build(manager)
            .map_err(|e| Error::Storage(format!("read pool: {e}")))?;

        debug!(path = %path.display(), "local store opened");
        Ok(LocalStore {
            write: Mutex::new(write),
            read_pool,
            path,
        })
    }

    /// Path of the SQLite data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the value for `key`.
    ///
    /// The point lookup runs in its own read transaction on a pooled
    /// connection. Fails with [`Error::NotFound`] when no row matches.
    pub fn get(&self, key: &str) -> Result<String> {
        let conn = self.read_conn()?;
        let value: Option<String> = conn
            .query_row("SELECT value FROM pairs WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)?;
        value.ok_or(Error::NotFound)
    }

    /// Create or overwrite `key` with `value`.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.write_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        upsert(&tx, key, value)?;
        tx.commit().map_err(db_err)
    }

    /// Remove `key`.
    ///
    /// Deleting a key that does not exist is not an error; the operation
    /// is idempotent by contract.
    pub fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.write_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        tx.execute("DELETE FROM pairs WHERE key = ?1", [key])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    /// FSM entry point: apply a committed `Set` at log position `index`.
    ///
    /// The upsert and the `last_applied` advance commit atomically.
    pub fn apply_set(&self, key: &str, value: &str, index: LogIndex) -> Result<()> {
        let mut conn = self.write_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        upsert(&tx, key, value)?;
        mark_applied(&tx, index)?;
        tx.commit().map_err(db_err)
    }

    /// FSM entry point: apply a committed `Delete` at log position `index`.
    pub fn apply_delete(&self, key: &str, index: LogIndex) -> Result<()> {
        let mut conn = self.write_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        tx.execute("DELETE FROM pairs WHERE key = ?1", [key])
            .map_err(db_err)?;
        mark_applied(&tx, index)?;
        tx.commit().map_err(db_err)
    }

    /// The log index of the last entry applied to this store, 0 if none.
    ///
    /// Restarts resume applying strictly after this position.
    pub fn last_applied(&self) -> Result<LogIndex> {
        let conn = self.read_conn()?;
        let value: i64 = conn
            .query_row(
                "SELECT value FROM fsm_meta WHERE name = 'last_applied'",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(value as LogIndex)
    }

    /// Lazy cursor over every pair, in key order.
    ///
    /// The cursor holds a read transaction pinned at open time, so it sees
    /// a stable view of the table no matter what the writer does in the
    /// meantime. Finite and non-restartable; dropping it ends the
    /// transaction.
    pub fn scan_all(&self) -> Result<PairCursor> {
        let conn = self.read_conn()?;
        conn.execute_batch("BEGIN").map_err(db_err)?;
        // A WAL read mark is only taken on the first read, so touch the
        // table before handing the cursor out.
        let _: Option<String> = conn
            .query_row("SELECT key FROM pairs LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        Ok(PairCursor {
            conn: Some(conn),
            buf: VecDeque::new(),
            last_key: None,
            done: false,
        })
    }

    /// Delete every row in a single transaction. Used only by restore.
    pub fn truncate_all(&self) -> Result<()> {
        let mut conn = self.write_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        tx.execute("DELETE FROM pairs", []).map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    /// Replace the entire store contents with `pairs`, recording the
    /// snapshot's log position. Used only by FSM restore.
    ///
    /// Truncation, the inserts and the marker all commit atomically; on
    /// any error the previous state is untouched.
    pub fn restore(&self, pairs: &[Pair], index: LogIndex) -> Result<()> {
        let mut conn = self.write_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        tx.execute("DELETE FROM pairs", []).map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO pairs (key, value) VALUES (?1, ?2)")
                .map_err(db_err)?;
            for pair in pairs {
                stmt.execute(params![pair.key, pair.value]).map_err(db_err)?;
            }
        }
        mark_applied(&tx, index)?;
        tx.commit().map_err(db_err)
    }

    /// Begin a snapshot: pin a read transaction now, read the rows later.
    ///
    /// Creating the handle is O(1); serialisation work is deferred until
    /// [`StoreSnapshot::pairs`] is called. Apply traffic keeps flowing
    /// while the handle is alive.
    pub fn begin_snapshot(&self) -> Result<StoreSnapshot> {
        let conn = self.read_conn()?;
        conn.execute_batch("BEGIN").map_err(db_err)?;
        let _: Option<String> = conn
            .query_row("SELECT key FROM pairs LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        Ok(StoreSnapshot { conn: Some(conn) })
    }

    fn read_conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.read_pool
            .get()
            .map_err(|e| Error::Storage(format!("read pool: {e}")))
    }

    fn write_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.write
            .lock()
            .map_err(|_| Error::Storage("write connection poisoned".into()))
    }
}

/// A read transaction pinned over the whole `pairs` table, captured by the
/// FSM when the consensus engine asks for a snapshot.
pub struct StoreSnapshot {
    conn: Option<PooledConnection<SqliteConnectionManager>>,
}

impl StoreSnapshot {
    /// Read every pair as of the moment the snapshot was begun.
    pub fn pairs(&self) -> Result<Vec<Pair>> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| Error::Storage("snapshot already released".into()))?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM pairs ORDER BY key")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Pair {
                    key: row.get(0)?,
                    value: row.get(1)?,
                })
            })
            .map_err(db_err)?;
        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row.map_err(db_err)?);
        }
        Ok(pairs)
    }

    /// End the pinned transaction. Also happens on drop.
    pub fn release(mut self) {
        self.end();
    }

    fn end(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
}

impl Drop for StoreSnapshot {
    fn drop(&mut self) {
        self.end();
    }
}

/// Lazy, finite, non-restartable cursor over `pairs`.
///
/// Rows are fetched in batches within the transaction pinned at open
/// time. Yields `Err` once and stops on storage failure.
pub struct PairCursor {
    conn: Option<PooledConnection<SqliteConnectionManager>>,
    buf: VecDeque<Pair>,
    last_key: Option<String>,
    done: bool,
}

impl PairCursor {
    fn refill(&mut self) -> Result<()> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| Error::Storage("cursor already closed".into()))?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT key, value FROM pairs \
                 WHERE ?1 IS NULL OR key > ?1 \
                 ORDER BY key LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![self.last_key, SCAN_BATCH as i64], |row| {
                Ok(Pair {
                    key: row.get(0)?,
                    value: row.get(1)?,
                })
            })
            .map_err(db_err)?;
        let mut fetched = 0usize;
        for row in rows {
            let pair = row.map_err(db_err)?;
            self.last_key = Some(pair.key.clone());
            self.buf.push_back(pair);
            fetched += 1;
        }
        if fetched < SCAN_BATCH {
            self.done = true;
        }
        Ok(())
    }
}

impl Iterator for PairCursor {
    type Item = Result<Pair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() && !self.done {
            if let Err(e) = self.refill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buf.pop_front().map(Ok)
    }
}

impl Drop for PairCursor {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn upsert(tx: &rusqlite::Transaction<'_>, key: &str, value: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO pairs (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .map_err(db_err)?;
    Ok(())
}

fn mark_applied(tx: &rusqlite::Transaction<'_>, index: LogIndex) -> Result<()> {
    tx.execute(
        "UPDATE fsm_meta SET value = ?1 WHERE name = 'last_applied'",
        [index as i64],
    )
    .map_err(db_err)?;
    Ok(())
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, LocalStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_get_missing_key_is_not_found() {
        let (_dir, store) = open_store();
        assert!(matches!(store.get("absent"), Err(Error::NotFound)));
    }

    #[test]
    fn test_set_then_get() {
        let (_dir, store) = open_store();
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap(), "1");

        // Overwrite in place.
        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap(), "2");
    }

    #[test]
    fn test_empty_value_roundtrips() {
        let (_dir, store) = open_store();
        store.set("a", "").unwrap();
        assert_eq!(store.get("a").unwrap(), "");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = open_store();
        store.set("a", "1").unwrap();
        store.delete("a").unwrap();
        assert!(matches!(store.get("a"), Err(Error::NotFound)));
        // Second delete of the same key succeeds as a no-op.
        store.delete("a").unwrap();
    }

    #[test]
    fn test_apply_advances_marker_atomically() {
        let (_dir, store) = open_store();
        assert_eq!(store.last_applied().unwrap(), 0);
        store.apply_set("a", "1", 7).unwrap();
        assert_eq!(store.last_applied().unwrap(), 7);
        store.apply_delete("a", 8).unwrap();
        assert_eq!(store.last_applied().unwrap(), 8);
        assert!(matches!(store.get("a"), Err(Error::NotFound)));
    }

    #[test]
    fn test_reopen_preserves_state() {
        let dir = TempDir::new().unwrap();
        {
            let store = LocalStore::open(dir.path()).unwrap();
            store.apply_set("k", "v", 3).unwrap();
        }
        let store = LocalStore::open(dir.path()).unwrap();
        assert_eq!(store.get("k").unwrap(), "v");
        assert_eq!(store.last_applied().unwrap(), 3);
    }

    #[test]
    fn test_scan_all_in_key_order() {
        let (_dir, store) = open_store();
        store.set("b", "2").unwrap();
        store.set("a", "1").unwrap();
        store.set("c", "3").unwrap();

        let pairs: Vec<Pair> = store.scan_all().unwrap().map(|p| p.unwrap()).collect();
        let keys: Vec<&str> = pairs.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_scan_sees_stable_view_despite_writer() {
        let (_dir, store) = open_store();
        store.set("a", "1").unwrap();

        let mut cursor = store.scan_all().unwrap();
        // The writer must not block behind the open cursor, and the cursor
        // must not observe the new row.
        store.set("z", "late").unwrap();

        let mut keys = Vec::new();
        for pair in &mut cursor {
            keys.push(pair.unwrap().key);
        }
        assert_eq!(keys, vec!["a"]);
        assert_eq!(store.get("z").unwrap(), "late");
    }

    #[test]
    fn test_scan_spans_multiple_batches() {
        let (_dir, store) = open_store();
        let total = SCAN_BATCH * 2 + 17;
        for i in 0..total {
            store.set(&format!("k{i:05}"), "v").unwrap();
        }
        let count = store.scan_all().unwrap().count();
        assert_eq!(count, total);
    }

    #[test]
    fn test_truncate_all_empties_table() {
        let (_dir, store) = open_store();
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        store.truncate_all().unwrap();
        assert_eq!(store.scan_all().unwrap().count(), 0);
    }

    #[test]
    fn test_restore_replaces_contents() {
        let (_dir, store) = open_store();
        store.apply_set("old", "x", 5).unwrap();

        let pairs = vec![
            Pair {
                key: "a".into(),
                value: "1".into(),
            },
            Pair {
                key: "b".into(),
                value: "2".into(),
            },
        ];
        store.restore(&pairs, 42).unwrap();

        assert!(matches!(store.get("old"), Err(Error::NotFound)));
        assert_eq!(store.get("a").unwrap(), "1");
        assert_eq!(store.get("b").unwrap(), "2");
        assert_eq!(store.last_applied().unwrap(), 42);
    }

    #[test]
    fn test_snapshot_pins_its_view() {
        let (_dir, store) = open_store();
        store.apply_set("a", "1", 1).unwrap();

        let snap = store.begin_snapshot().unwrap();
        // Mutations applied after the handle was created are invisible
        // to it.
        store.apply_set("b", "2", 2).unwrap();

        let pairs = snap.pairs().unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key, "a");
        snap.release();

        assert_eq!(store.get("b").unwrap(), "2");
    }
}
