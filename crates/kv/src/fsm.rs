//! The deterministic state machine over the local store.
//!
//! Committed log entries decode into commands and dispatch to the SQLite
//! store; the store advances its `last_applied` marker in the same
//! transaction, so each entry takes effect exactly once even across
//! restarts. Apply must stay deterministic: no clocks, no randomness,
//! nothing outside the entry bytes and prior store state.

use std::io::Write;
use std::sync::Arc;

use tracing::debug;

use tessera_common::{Error, LogIndex, Result};
use tessera_protocol::{Command, CommandKind};
use tessera_raft::{Fsm, FsmSnapshot, LogEntry, SnapshotSink};
use tessera_storage::{LocalStore, Pair, StoreSnapshot};

/// FSM interpreting `Set`/`Delete` commands against [`LocalStore`].
pub struct PairsFsm {
    store: Arc<LocalStore>,
}

impl PairsFsm {
    pub fn new(store: Arc<LocalStore>) -> Self {
        PairsFsm { store }
    }
}

impl Fsm for PairsFsm {
    fn apply(&mut self, entry: &LogEntry) -> Result<()> {
        let command = Command::decode(&entry.data)?;
        match command.kind {
            CommandKind::Set => {
                // Decode guarantees a value is present for Set.
                let value = command.value.as_deref().unwrap_or_default();
                debug!(index = entry.index, key = %command.key, "applying set");
                self.store.apply_set(&command.key, value, entry.index)
            }
            CommandKind::Delete => {
                debug!(index = entry.index, key = %command.key, "applying delete");
                self.store.apply_delete(&command.key, entry.index)
            }
        }
    }

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>> {
        // Pin the read transaction now; rows are serialised in persist.
        let snapshot = self.store.begin_snapshot()?;
        Ok(Box::new(PairsSnapshot { snapshot }))
    }

    fn restore(&mut self, last_included: LogIndex, data: &[u8]) -> Result<()> {
        let pairs: Vec<Pair> = serde_json::from_slice(data)
            .map_err(|e| Error::Malformed(format!("snapshot stream: {e}")))?;
        self.store.restore(&pairs, last_included)
    }

    fn last_applied(&self) -> Result<LogIndex> {
        self.store.last_applied()
    }
}

/// Snapshot handle: a pinned read transaction, serialised as a JSON array
/// of `{key, value}` objects when persisted.
struct PairsSnapshot {
    snapshot: StoreSnapshot,
}

impl FsmSnapshot for PairsSnapshot {
    fn persist(self: Box<Self>, mut sink: Box<dyn SnapshotSink>) -> Result<()> {
        let snapshot = self.snapshot;
        let result = snapshot
            .pairs()
            .and_then(|pairs| {
                serde_json::to_vec(&pairs).map_err(|e| Error::Encoding(e.to_string()))
            })
            .and_then(|bytes| {
                sink.write_all(&bytes)
                    .map_err(|e| Error::Storage(e.to_string()))
            });
        match result {
            Ok(()) => {
                snapshot.release();
                sink.close()
            }
            Err(e) => {
                snapshot.release();
                let _ = sink.cancel();
                Err(e)
            }
        }
    }

    fn release(self: Box<Self>) {
        self.snapshot.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn open_fsm() -> (TempDir, Arc<LocalStore>, PairsFsm) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        let fsm = PairsFsm::new(store.clone());
        (dir, store, fsm)
    }

    fn entry(index: u64, command: &Command) -> LogEntry {
        LogEntry {
            index,
            term: 1,
            data: command.encode().unwrap(),
        }
    }

    /// In-memory sink mirroring the file-backed one, for tests.
    struct VecSink {
        buf: Arc<Mutex<Vec<u8>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl Write for VecSink {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.buf.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SnapshotSink for VecSink {
        fn id(&self) -> &str {
            "test"
        }

        fn close(self: Box<Self>) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }

        fn cancel(self: Box<Self>) -> Result<()> {
            self.buf.lock().unwrap().clear();
            Ok(())
        }
    }

    #[test]
    fn test_apply_set_then_delete() {
        let (_dir, store, mut fsm) = open_fsm();

        fsm.apply(&entry(1, &Command::set("a", "1"))).unwrap();
        assert_eq!(store.get("a").unwrap(), "1");

        fsm.apply(&entry(2, &Command::delete("a"))).unwrap();
        assert!(matches!(store.get("a"), Err(Error::NotFound)));
        assert_eq!(store.last_applied().unwrap(), 2);
    }

    #[test]
    fn test_last_writer_wins_by_index() {
        let (_dir, store, mut fsm) = open_fsm();
        fsm.apply(&entry(1, &Command::set("k", "first"))).unwrap();
        fsm.apply(&entry(2, &Command::set("k", "second"))).unwrap();
        assert_eq!(store.get("k").unwrap(), "second");
    }

    #[test]
    fn test_delete_of_missing_key_applies_cleanly() {
        let (_dir, store, mut fsm) = open_fsm();
        fsm.apply(&entry(1, &Command::delete("ghost"))).unwrap();
        assert_eq!(store.last_applied().unwrap(), 1);
    }

    #[test]
    fn test_malformed_entry_does_not_poison_later_ones() {
        let (_dir, store, mut fsm) = open_fsm();

        let err = fsm
            .apply(&LogEntry {
                index: 1,
                term: 1,
                data: br#"{"type":9,"key":"x"}"#.to_vec(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));

        // The next entry still applies.
        fsm.apply(&entry(2, &Command::set("a", "1"))).unwrap();
        assert_eq!(store.get("a").unwrap(), "1");
    }

    #[test]
    fn test_snapshot_persist_restore_roundtrip() {
        let (_dir, _store, mut fsm) = open_fsm();
        fsm.apply(&entry(1, &Command::set("a", "1"))).unwrap();
        fsm.apply(&entry(2, &Command::set("b", "2"))).unwrap();

        let buf = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let capture = fsm.snapshot().unwrap();
        capture
            .persist(Box::new(VecSink {
                buf: buf.clone(),
                closed: closed.clone(),
            }))
            .unwrap();
        assert!(*closed.lock().unwrap());
        let bytes = buf.lock().unwrap().clone();

        // Restore into a completely fresh store.
        let other_dir = TempDir::new().unwrap();
        let other_store = Arc::new(LocalStore::open(other_dir.path()).unwrap());
        let mut other_fsm = PairsFsm::new(other_store.clone());
        other_fsm.restore(2, &bytes).unwrap();

        assert_eq!(other_store.get("a").unwrap(), "1");
        assert_eq!(other_store.get("b").unwrap(), "2");
        assert_eq!(other_store.last_applied().unwrap(), 2);
    }

    #[test]
    fn test_snapshot_stream_is_a_json_pair_array() {
        let (_dir, _store, mut fsm) = open_fsm();
        fsm.apply(&entry(1, &Command::set("k", "v"))).unwrap();

        let buf = Arc::new(Mutex::new(Vec::new()));
        let capture = fsm.snapshot().unwrap();
        capture
            .persist(Box::new(VecSink {
                buf: buf.clone(),
                closed: Arc::new(Mutex::new(false)),
            }))
            .unwrap();

        let bytes = buf.lock().unwrap().clone();
        assert_eq!(bytes, br#"[{"key":"k","value":"v"}]"#);
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let (_dir, store, mut fsm) = open_fsm();
        fsm.apply(&entry(1, &Command::set("keep", "me"))).unwrap();

        let err = fsm.restore(9, b"not json").unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));

        // Previous state is untouched on a failed restore.
        assert_eq!(store.get("keep").unwrap(), "me");
        assert_eq!(store.last_applied().unwrap(), 1);
    }

    #[test]
    fn test_identical_sequences_produce_identical_stores() {
        let commands = vec![
            Command::set("a", "1"),
            Command::set("b", "2"),
            Command::delete("a"),
            Command::set("b", "3"),
            Command::set("c", ""),
        ];

        let mut scans = Vec::new();
        for _ in 0..2 {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(LocalStore::open(dir.path()).unwrap());
            let mut fsm = PairsFsm::new(store.clone());
            for (i, command) in commands.iter().enumerate() {
                fsm.apply(&entry(i as u64 + 1, command)).unwrap();
            }
            let pairs: Vec<Pair> = store.scan_all().unwrap().map(|p| p.unwrap()).collect();
            scans.push(pairs);
        }
        assert_eq!(scans[0], scans[1]);
    }
}
