//! File-backed snapshot store.
//!
//! Finished snapshots live under `snapshots/`, one directory per
//! snapshot named `<term>-<index>`, holding `meta.json` and `state.bin`.
//! A snapshot is written into a `.tmp` directory first and renamed into
//! place on close, so a crash mid-persist never leaves a half snapshot
//! visible. Only the newest *N* snapshots are retained.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tessera_common::{Error, LogIndex, NodeId, Result, Term};

use crate::fsm::SnapshotSink;

/// Name of the snapshot directory inside the raft directory.
pub const SNAPSHOT_DIR_NAME: &str = "snapshots";

/// Metadata stored alongside each snapshot's payload.
///
/// Besides the log position, a snapshot carries the voter set and the
/// address book as of that position, so a node restored from it can reach
/// its peers even when the conf-change entries have been compacted away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Index of the last log entry the snapshot includes.
    pub index: LogIndex,
    /// Term of that entry.
    pub term: Term,
    /// Voting members at `index`.
    pub voters: Vec<NodeId>,
    /// `node_id -> network address` book at `index`.
    pub peers: Vec<(NodeId, String)>,
}

struct Inner {
    dir: PathBuf,
    retain: usize,
}

/// Store of finished snapshots with retain-N garbage collection.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<Inner>,
}

impl SnapshotStore {
    /// Open the store under `parent/snapshots`, keeping `retain`
    /// snapshots. Leftover `.tmp` directories from a crashed persist are
    /// swept away.
    pub fn open(parent: impl Into<PathBuf>, retain: usize) -> Result<Self> {
        let dir = parent.into().join(SNAPSHOT_DIR_NAME);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("create {}: {e}", dir.display())))?;

        for entry in fs::read_dir(&dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                warn!(path = %path.display(), "removing incomplete snapshot");
                let _ = fs::remove_dir_all(&path);
            }
        }

        Ok(SnapshotStore {
            inner: Arc::new(Inner { dir, retain }),
        })
    }

    /// Begin writing a snapshot for `meta`. The returned sink buffers into
    /// a temporary directory; the snapshot becomes visible only after
    /// [`SnapshotSink::close`].
    pub fn create(&self, meta: SnapshotMeta) -> Result<Box<dyn SnapshotSink>> {
        let id = snapshot_id(meta.term, meta.index);
        let final_dir = self.inner.dir.join(&id);
        let tmp_dir = self.inner.dir.join(format!("{id}.tmp"));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir).map_err(io_err)?;
        }
        fs::create_dir_all(&tmp_dir).map_err(io_err)?;

        let meta_json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| Error::Encoding(format!("snapshot meta: {e}")))?;
        fs::write(tmp_dir.join("meta.json"), meta_json).map_err(io_err)?;

        let file = File::create(tmp_dir.join("state.bin")).map_err(io_err)?;
        debug!(id, "snapshot sink opened");
        Ok(Box::new(FileSnapshotSink {
            store: self.clone(),
            id,
            tmp_dir,
            final_dir,
            file: Some(BufWriter::new(file)),
        }))
    }

    /// Store a snapshot received whole from a peer (snapshot install).
    pub fn install(&self, meta: &SnapshotMeta, data: &[u8]) -> Result<()> {
        let mut sink = self.create(meta.clone())?;
        sink.write_all(data).map_err(io_err)?;
        sink.close()
    }

    /// Metadata of all finished snapshots, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotMeta>> {
        let mut metas = Vec::new();
        for entry in fs::read_dir(&self.inner.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if !path.is_dir() || path.extension().is_some_and(|ext| ext == "tmp") {
                continue;
            }
            match read_meta(&path) {
                Ok(meta) => metas.push(meta),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
            }
        }
        metas.sort_by(|a, b| (b.term, b.index).cmp(&(a.term, a.index)));
        Ok(metas)
    }

    /// The newest finished snapshot, with its payload.
    pub fn latest(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>> {
        let metas = self.list()?;
        let Some(meta) = metas.into_iter().next() else {
            return Ok(None);
        };
        let dir = self.inner.dir.join(snapshot_id(meta.term, meta.index));
        let mut data = Vec::new();
        File::open(dir.join("state.bin"))
            .map_err(io_err)?
            .read_to_end(&mut data)
            .map_err(io_err)?;
        Ok(Some((meta, data)))
    }

    /// Delete snapshots beyond the retain count, oldest first.
    pub fn gc(&self) -> Result<()> {
        let metas = self.list()?;
        for meta in metas.iter().skip(self.inner.retain) {
            let dir = self.inner.dir.join(snapshot_id(meta.term, meta.index));
            debug!(path = %dir.display(), "removing retired snapshot");
            let _ = fs::remove_dir_all(&dir);
        }
        Ok(())
    }
}

/// Sink writing one snapshot into a temp directory, renamed on close.
struct FileSnapshotSink {
    store: SnapshotStore,
    id: String,
    tmp_dir: PathBuf,
    final_dir: PathBuf,
    file: Option<BufWriter<File>>,
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(std::io::Error::other("snapshot sink already closed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let writer = self
            .file
            .take()
            .ok_or_else(|| Error::Storage("snapshot sink already closed".into()))?;
        let file = writer
            .into_inner()
            .map_err(|e| Error::Storage(format!("flush snapshot: {e}")))?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        if self.final_dir.exists() {
            fs::remove_dir_all(&self.final_dir).map_err(io_err)?;
        }
        fs::rename(&self.tmp_dir, &self.final_dir).map_err(io_err)?;
        debug!(id = self.id, "snapshot finished");
        self.store.gc()
    }

    fn cancel(mut self: Box<Self>) -> Result<()> {
        self.file.take();
        let _ = fs::remove_dir_all(&self.tmp_dir);
        debug!(id = self.id, "snapshot cancelled");
        Ok(())
    }
}

fn snapshot_id(term: Term, index: LogIndex) -> String {
    format!("{term:020}-{index:020}")
}

fn read_meta(dir: &std::path::Path) -> Result<SnapshotMeta> {
    let bytes = fs::read(dir.join("meta.json")).map_err(io_err)?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Malformed(format!("snapshot meta: {e}")))
}

fn io_err(e: std::io::Error) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(term: Term, index: LogIndex) -> SnapshotMeta {
        SnapshotMeta {
            index,
            term,
            voters: vec![1],
            peers: vec![(1, "127.0.0.1:12000".to_string())],
        }
    }

    #[test]
    fn test_create_close_latest() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path(), 2).unwrap();

        let mut sink = store.create(meta(1, 10)).unwrap();
        sink.write_all(b"payload").unwrap();
        sink.close().unwrap();

        let (got_meta, data) = store.latest().unwrap().unwrap();
        assert_eq!(got_meta, meta(1, 10));
        assert_eq!(data, b"payload");
    }

    #[test]
    fn test_cancelled_sink_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path(), 2).unwrap();

        let mut sink = store.create(meta(1, 10)).unwrap();
        sink.write_all(b"half").unwrap();
        sink.cancel().unwrap();

        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_retain_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path(), 2).unwrap();

        for index in [10u64, 20, 30] {
            let mut sink = store.create(meta(1, index)).unwrap();
            sink.write_all(format!("s{index}").as_bytes()).unwrap();
            sink.close().unwrap();
        }

        let metas = store.list().unwrap();
        let indices: Vec<u64> = metas.iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![30, 20]);
    }

    #[test]
    fn test_latest_prefers_higher_term() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path(), 4).unwrap();

        for (term, index) in [(1u64, 30u64), (2, 20)] {
            let mut sink = store.create(meta(term, index)).unwrap();
            sink.write_all(b"x").unwrap();
            sink.close().unwrap();
        }

        let (latest, _) = store.latest().unwrap().unwrap();
        assert_eq!((latest.term, latest.index), (2, 20));
    }

    #[test]
    fn test_install_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = SnapshotStore::open(dir.path(), 2).unwrap();
            store.install(&meta(3, 99), b"received").unwrap();
        }
        let store = SnapshotStore::open(dir.path(), 2).unwrap();
        let (got, data) = store.latest().unwrap().unwrap();
        assert_eq!(got.index, 99);
        assert_eq!(data, b"received");
    }

    #[test]
    fn test_stale_tmp_dirs_swept_at_open() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join(SNAPSHOT_DIR_NAME).join("junk.tmp");
        fs::create_dir_all(&tmp).unwrap();

        let store = SnapshotStore::open(dir.path(), 2).unwrap();
        assert!(!tmp.exists());
        assert!(store.latest().unwrap().is_none());
    }
}
