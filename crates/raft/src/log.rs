//! Durable log and stable store, `raft.db`.
//!
//! Backs the consensus library's `Storage` trait with SQLite: log entries
//! in the `entries` table, hard state / configuration / compaction marker
//! / peer address book in the `meta` table. A small in-memory cache keeps
//! the hot lookups (`first_index`, `last_index`, states) off the disk
//! path; the cache is rebuilt from disk at open.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use prost_old::Message as _;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot, SnapshotMetadata};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use rusqlite::{params, Connection};
use tracing::debug;

use tessera_common::{Error, LogIndex, NodeId, Result, Term};

use crate::snapshots::SnapshotStore;
use crate::transport::proto;

/// Name of the SQLite file holding the raft log and stable store.
pub const LOG_FILE_NAME: &str = "raft.db";

#[derive(Default)]
struct Cached {
    hard_state: HardState,
    conf_state: ConfState,
    truncated_index: LogIndex,
    truncated_term: Term,
    last_index: LogIndex,
    addresses: HashMap<NodeId, String>,
}

struct Inner {
    conn: Mutex<Connection>,
    cache: RwLock<Cached>,
    snapshots: SnapshotStore,
}

/// Durable raft log + stable store, cheap to clone.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<Inner>,
}

impl LogStore {
    /// Open (or create) `raft.db` inside `dir`.
    pub fn open(dir: impl AsRef<Path>, snapshots: SnapshotStore) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("create {}: {e}", dir.display())))?;
        let path = dir.join(LOG_FILE_NAME);
        let conn = Connection::open(&path)
            .map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                 idx  INTEGER PRIMARY KEY,
                 term INTEGER NOT NULL,
                 data BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS meta (
                 name  TEXT PRIMARY KEY,
                 value BLOB NOT NULL
             );",
        )
        .map_err(db_err)?;

        let cache = load_cache(&conn)?;
        debug!(
            path = %path.display(),
            first = cache.truncated_index + 1,
            last = cache.last_index,
            "log store opened"
        );
        Ok(LogStore {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                cache: RwLock::new(cache),
                snapshots,
            }),
        })
    }

    /// Whether this store already holds any log or configuration state.
    ///
    /// Bootstrap must refuse to run on an initialised store.
    pub fn is_initialized(&self) -> bool {
        let cache = self.cache_read();
        cache.last_index > 0
            || cache.truncated_index > 0
            || !cache.conf_state.voters.is_empty()
    }

    /// Append entries, overwriting any existing suffix from the first
    /// appended index on (the leader sends a corrective append after a
    /// divergence).
    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().map_err(db_err)?;
        tx.execute("DELETE FROM entries WHERE idx >= ?1", [first.index as i64])
            .map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare_cached("INSERT INTO entries (idx, term, data) VALUES (?1, ?2, ?3)")
                .map_err(db_err)?;
            for entry in entries {
                stmt.execute(params![
                    entry.index as i64,
                    entry.term as i64,
                    entry.encode_to_vec()
                ])
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;

        let mut cache = self.cache_write();
        cache.last_index = entries.last().map(|e| e.index).unwrap_or(cache.last_index);
        Ok(())
    }

    /// Durably persist the hard state (term, vote, commit).
    pub fn set_hard_state(&self, hs: &HardState) -> Result<()> {
        self.put_meta("hard_state", &hs.encode_to_vec())?;
        self.cache_write().hard_state = hs.clone();
        Ok(())
    }

    /// Advance only the commit index of the hard state.
    pub fn set_commit(&self, commit: LogIndex) -> Result<()> {
        let mut hs = self.cache_read().hard_state.clone();
        if hs.commit >= commit {
            return Ok(());
        }
        hs.commit = commit;
        self.set_hard_state(&hs)
    }

    /// Durably persist the voting configuration.
    pub fn set_conf_state(&self, cs: &ConfState) -> Result<()> {
        self.put_meta("conf_state", &cs.encode_to_vec())?;
        self.cache_write().conf_state = cs.clone();
        Ok(())
    }

    /// Current voting members.
    pub fn voters(&self) -> Vec<NodeId> {
        self.cache_read().conf_state.voters.clone()
    }

    /// Current hard state.
    pub fn hard_state(&self) -> HardState {
        self.cache_read().hard_state.clone()
    }

    /// The full `node_id -> address` book.
    pub fn addresses(&self) -> HashMap<NodeId, String> {
        self.cache_read().addresses.clone()
    }

    /// Record (or update) a peer's network address.
    pub fn set_address(&self, id: NodeId, address: String) -> Result<()> {
        let mut book = self.cache_read().addresses.clone();
        book.insert(id, address);
        self.persist_addresses(book)
    }

    /// Forget a removed peer's address.
    pub fn remove_address(&self, id: NodeId) -> Result<()> {
        let mut book = self.cache_read().addresses.clone();
        book.remove(&id);
        self.persist_addresses(book)
    }

    /// Replace the whole address book (bootstrap, snapshot install).
    pub fn set_addresses(&self, book: HashMap<NodeId, String>) -> Result<()> {
        self.persist_addresses(book)
    }

    /// Drop entries up to and including `up_to` after a snapshot has made
    /// them redundant.
    pub fn compact(&self, up_to: LogIndex) -> Result<()> {
        let term = Storage::term(self, up_to)
            .map_err(|e| Error::Storage(format!("compact to {up_to}: {e}")))?;
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().map_err(db_err)?;
        tx.execute("DELETE FROM entries WHERE idx <= ?1", [up_to as i64])
            .map_err(db_err)?;
        put_meta_tx(&tx, "truncated", &encode_truncated(up_to, term))?;
        tx.commit().map_err(db_err)?;

        let mut cache = self.cache_write();
        cache.truncated_index = up_to;
        cache.truncated_term = term;
        cache.last_index = cache.last_index.max(up_to);
        debug!(up_to, "log compacted");
        Ok(())
    }

    /// Reset the log around an installed snapshot: all entries discarded,
    /// first/last index moved to the snapshot position, configuration and
    /// commit updated.
    pub fn apply_snapshot(&self, index: LogIndex, term: Term, voters: &[NodeId]) -> Result<()> {
        let mut cs = ConfState::default();
        cs.voters = voters.to_vec();
        let mut hs = self.cache_read().hard_state.clone();
        hs.commit = index;
        hs.term = hs.term.max(term);

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().map_err(db_err)?;
        tx.execute("DELETE FROM entries", []).map_err(db_err)?;
        put_meta_tx(&tx, "truncated", &encode_truncated(index, term))?;
        put_meta_tx(&tx, "conf_state", &cs.encode_to_vec())?;
        put_meta_tx(&tx, "hard_state", &hs.encode_to_vec())?;
        tx.commit().map_err(db_err)?;

        let mut cache = self.cache_write();
        cache.truncated_index = index;
        cache.truncated_term = term;
        cache.last_index = index;
        cache.conf_state = cs;
        cache.hard_state = hs;
        debug!(index, term, "log reset to snapshot");
        Ok(())
    }

    fn persist_addresses(&self, book: HashMap<NodeId, String>) -> Result<()> {
        let ordered: Vec<(NodeId, String)> = {
            let mut v: Vec<_> = book.iter().map(|(id, a)| (*id, a.clone())).collect();
            v.sort_by_key(|(id, _)| *id);
            v
        };
        let bytes = serde_json::to_vec(&ordered)
            .map_err(|e| Error::Encoding(format!("address book: {e}")))?;
        self.put_meta("addresses", &bytes)?;
        self.cache_write().addresses = book;
        Ok(())
    }

    fn put_meta(&self, name: &str, value: &[u8]) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO meta (name, value) VALUES (?1, ?2) \
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![name, value],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.inner
            .conn
            .lock()
            .map_err(|_| Error::Storage("log connection poisoned".into()))
    }

    fn cache_read(&self) -> std::sync::RwLockReadGuard<'_, Cached> {
        self.inner.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn cache_write(&self) -> std::sync::RwLockWriteGuard<'_, Cached> {
        self.inner.cache.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let cache = self.cache_read();
        Ok(RaftState::new(
            cache.hard_state.clone(),
            cache.conf_state.clone(),
        ))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let (truncated, last) = {
            let cache = self.cache_read();
            (cache.truncated_index, cache.last_index)
        };
        if low <= truncated {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > last + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let conn = self.conn().map_err(other_err)?;
        let mut stmt = conn
            .prepare_cached("SELECT data FROM entries WHERE idx >= ?1 AND idx < ?2 ORDER BY idx")
            .map_err(|e| other_err(Error::Storage(e.to_string())))?;
        let rows = stmt
            .query_map(params![low as i64, high as i64], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .map_err(|e| other_err(Error::Storage(e.to_string())))?;

        let max_size = max_size.into();
        let mut entries = Vec::new();
        let mut total: u64 = 0;
        for row in rows {
            let data = row.map_err(|e| other_err(Error::Storage(e.to_string())))?;
            let entry = Entry::decode(data.as_slice())
                .map_err(|e| other_err(Error::Malformed(e.to_string())))?;
            total += data.len() as u64;
            if let Some(limit) = max_size {
                if !entries.is_empty() && total > limit {
                    break;
                }
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let (truncated_index, truncated_term, last) = {
            let cache = self.cache_read();
            (cache.truncated_index, cache.truncated_term, cache.last_index)
        };
        if idx == truncated_index {
            return Ok(truncated_term);
        }
        if idx < truncated_index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx > last {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let conn = self.conn().map_err(other_err)?;
        let term: i64 = conn
            .query_row("SELECT term FROM entries WHERE idx = ?1", [idx as i64], |r| {
                r.get(0)
            })
            .map_err(|e| other_err(Error::Storage(e.to_string())))?;
        Ok(term as u64)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.cache_read().truncated_index + 1)
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.cache_read().last_index)
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let latest = self
            .inner
            .snapshots
            .latest()
            .map_err(other_err)?;
        let Some((meta, state)) = latest else {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        };
        if meta.index < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }

        let payload = proto::SnapshotPayload {
            peers: meta
                .peers
                .iter()
                .map(|(id, address)| proto::PeerAddr {
                    id: *id,
                    address: address.clone(),
                })
                .collect(),
            state,
        };
        let mut data = Vec::new();
        prost::Message::encode(&payload, &mut data)
            .map_err(|e| other_err(Error::Encoding(e.to_string())))?;

        let mut snapshot = Snapshot::default();
        let mut md = SnapshotMetadata::default();
        md.index = meta.index;
        md.term = meta.term;
        let mut cs = ConfState::default();
        cs.voters = meta.voters.clone();
        md.conf_state = Some(cs).into();
        snapshot.metadata = Some(md).into();
        snapshot.data = data.into();
        Ok(snapshot)
    }
}

fn load_cache(conn: &Connection) -> Result<Cached> {
    let mut cache = Cached::default();

    if let Some(bytes) = get_meta(conn, "hard_state")? {
        cache.hard_state =
            HardState::decode(bytes.as_slice()).map_err(|e| Error::Malformed(e.to_string()))?;
    }
    if let Some(bytes) = get_meta(conn, "conf_state")? {
        cache.conf_state =
            ConfState::decode(bytes.as_slice()).map_err(|e| Error::Malformed(e.to_string()))?;
    }
    if let Some(bytes) = get_meta(conn, "truncated")? {
        let (index, term) = decode_truncated(&bytes)?;
        cache.truncated_index = index;
        cache.truncated_term = term;
    }
    if let Some(bytes) = get_meta(conn, "addresses")? {
        let ordered: Vec<(NodeId, String)> =
            serde_json::from_slice(&bytes).map_err(|e| Error::Malformed(e.to_string()))?;
        cache.addresses = ordered.into_iter().collect();
    }

    let max_idx: Option<i64> = conn
        .query_row("SELECT MAX(idx) FROM entries", [], |r| r.get(0))
        .map_err(db_err)?;
    cache.last_index = (max_idx.unwrap_or(0) as u64).max(cache.truncated_index);
    Ok(cache)
}

fn get_meta(conn: &Connection, name: &str) -> Result<Option<Vec<u8>>> {
    use rusqlite::OptionalExtension;
    conn.query_row("SELECT value FROM meta WHERE name = ?1", [name], |r| {
        r.get(0)
    })
    .optional()
    .map_err(db_err)
}

fn put_meta_tx(tx: &rusqlite::Transaction<'_>, name: &str, value: &[u8]) -> Result<()> {
    tx.execute(
        "INSERT INTO meta (name, value) VALUES (?1, ?2) \
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, value],
    )
    .map_err(db_err)?;
    Ok(())
}

fn encode_truncated(index: LogIndex, term: Term) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&index.to_be_bytes());
    bytes.extend_from_slice(&term.to_be_bytes());
    bytes
}

fn decode_truncated(bytes: &[u8]) -> Result<(LogIndex, Term)> {
    if bytes.len() != 16 {
        return Err(Error::Malformed("truncated marker".into()));
    }
    let index = u64::from_be_bytes(bytes[..8].try_into().unwrap());
    let term = u64::from_be_bytes(bytes[8..].try_into().unwrap());
    Ok((index, term))
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn other_err(e: Error) -> raft::Error {
    raft::Error::Store(StorageError::Other(Box::new(e)))
}
