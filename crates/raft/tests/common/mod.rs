//! Shared helpers for engine integration tests: an in-memory FSM with a
//! tiny text command format, node spawning on ephemeral ports, and
//! polling utilities.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tessera_common::{Error, LogIndex, Result};
use tessera_raft::{EngineConfig, Fsm, FsmSnapshot, LogEntry, RaftHandle, RaftNode, RaftRole, SnapshotSink};

/// State shared between a test and its node's FSM.
#[derive(Default)]
pub struct SharedState {
    map: Mutex<BTreeMap<String, String>>,
    applied: AtomicU64,
}

impl SharedState {
    pub fn get(&self, key: &str) -> Option<String> {
        self.map.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }
}

/// FSM over [`SharedState`] speaking `set <key> <value>` / `del <key>`.
pub struct MemFsm {
    state: Arc<SharedState>,
}

impl MemFsm {
    pub fn new(state: Arc<SharedState>) -> Self {
        MemFsm { state }
    }
}

impl Fsm for MemFsm {
    fn apply(&mut self, entry: &LogEntry) -> Result<()> {
        let text = std::str::from_utf8(&entry.data)
            .map_err(|e| Error::Malformed(e.to_string()))?;
        let mut words = text.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("set"), Some(key), Some(value)) => {
                self.state
                    .map
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), value.to_string());
            }
            (Some("del"), Some(key), None) => {
                self.state.map.lock().unwrap().remove(key);
            }
            _ => return Err(Error::Malformed(format!("unknown command {text:?}"))),
        }
        self.state.applied.store(entry.index, Ordering::SeqCst);
        Ok(())
    }

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>> {
        Ok(Box::new(MemSnapshot {
            map: self.state.map.lock().unwrap().clone(),
        }))
    }

    fn restore(&mut self, last_included: LogIndex, data: &[u8]) -> Result<()> {
        let map: BTreeMap<String, String> =
            serde_json::from_slice(data).map_err(|e| Error::Malformed(e.to_string()))?;
        *self.state.map.lock().unwrap() = map;
        self.state.applied.store(last_included, Ordering::SeqCst);
        Ok(())
    }

    fn last_applied(&self) -> Result<LogIndex> {
        Ok(self.state.applied())
    }
}

struct MemSnapshot {
    map: BTreeMap<String, String>,
}

impl FsmSnapshot for MemSnapshot {
    fn persist(self: Box<Self>, mut sink: Box<dyn SnapshotSink>) -> Result<()> {
        let bytes = serde_json::to_vec(&self.map).map_err(|e| Error::Encoding(e.to_string()))?;
        match sink.write_all(&bytes) {
            Ok(()) => sink.close(),
            Err(e) => {
                let _ = sink.cancel();
                Err(Error::Storage(e.to_string()))
            }
        }
    }

    fn release(self: Box<Self>) {}
}

/// Start a node on an ephemeral port with automatic snapshots disabled
/// (tests trigger them explicitly).
pub async fn start_node(dir: &Path, id: u64, state: Arc<SharedState>) -> RaftHandle {
    let mut config = EngineConfig::new(id, "127.0.0.1:0", dir);
    config.snapshot_threshold = u64::MAX;
    RaftNode::start(config, Box::new(MemFsm::new(state)))
        .await
        .expect("node should start")
}

/// Wait until the node reports `role`, or time out.
pub async fn wait_for_role(handle: &RaftHandle, role: RaftRole, timeout: Duration) -> bool {
    let mut watch = handle.role_watch();
    tokio::time::timeout(timeout, watch.wait_for(|current| *current == role))
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false)
}

/// Poll `condition` every 50ms until it holds, or time out.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
