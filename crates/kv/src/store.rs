//! The replicated store facade.
//!
//! Mutations are encoded as commands, proposed to the consensus engine
//! and awaited; the result is the FSM's verdict on the proposer's own
//! node. Reads never touch the log — they are served from the local
//! store under one of two policies.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use tessera_common::{Error, Result};
use tessera_protocol::Command;
use tessera_raft::{Engine, RaftRole};
use tessera_storage::LocalStore;

/// Where reads are allowed to be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Serve reads only while this node believes it is the leader.
    ///
    /// This rejects obvious followers but is *not* linearizable: a read
    /// racing a leader change can still return a value the new leader has
    /// already overwritten. Callers needing linearizable reads must use a
    /// lease or read-index mechanism, which this store does not provide.
    LeaderOnly,
    /// Serve reads on any node regardless of role. Values may be stale,
    /// bounded by this node's apply lag behind the leader.
    AllowFollower,
}

/// The user-facing `get`/`set`/`delete` surface over a consensus engine
/// and the node-local store.
pub struct ReplicatedStore<E> {
    local: Arc<LocalStore>,
    engine: Arc<E>,
    policy: ReadPolicy,
    timeout: Duration,
}

impl<E: Engine> ReplicatedStore<E> {
    pub fn new(
        local: Arc<LocalStore>,
        engine: Arc<E>,
        policy: ReadPolicy,
        timeout: Duration,
    ) -> Self {
        ReplicatedStore {
            local,
            engine,
            policy,
            timeout,
        }
    }

    /// Read the value for `key` from the local store.
    ///
    /// Blocks briefly for the point lookup. Fails with
    /// [`Error::NotLeader`] under [`ReadPolicy::LeaderOnly`] on a
    /// non-leader, and with [`Error::NotFound`] when the key is absent.
    pub fn get(&self, key: &str) -> Result<String> {
        match self.policy {
            ReadPolicy::AllowFollower => self.local.get(key),
            ReadPolicy::LeaderOnly => {
                if self.engine.role() == RaftRole::Leader {
                    self.local.get(key)
                } else {
                    Err(self.not_leader())
                }
            }
        }
    }

    /// Replicate `key = value` through the log and wait for it to commit
    /// and apply locally.
    ///
    /// A [`Error::Timeout`] is indeterminate: the entry may still commit
    /// after the deadline.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let payload = Command::set(key, value).encode()?;
        debug!(key, "proposing set");
        self.engine.propose(payload, self.timeout).await
    }

    /// Replicate removal of `key`. Deleting an absent key succeeds.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let payload = Command::delete(key).encode()?;
        debug!(key, "proposing delete");
        self.engine.propose(payload, self.timeout).await
    }

    fn not_leader(&self) -> Error {
        Error::NotLeader {
            leader: self.engine.leader().map(|p| (p.id, p.address)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubEngine;
    use tempfile::TempDir;
    use tessera_raft::Peer;

    fn harness(policy: ReadPolicy) -> (TempDir, Arc<StubEngine>, ReplicatedStore<StubEngine>) {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(LocalStore::open(dir.path()).unwrap());
        let engine = Arc::new(StubEngine::leading(local.clone()));
        let store = ReplicatedStore::new(
            local,
            engine.clone(),
            policy,
            Duration::from_secs(1),
        );
        (dir, engine, store)
    }

    #[tokio::test]
    async fn test_set_get_delete_roundtrip() {
        let (_dir, _engine, store) = harness(ReadPolicy::LeaderOnly);

        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").unwrap(), "1");

        store.delete("a").await.unwrap();
        assert!(matches!(store.get("a"), Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_delete_twice_succeeds() {
        let (_dir, _engine, store) = harness(ReadPolicy::LeaderOnly);
        store.set("a", "1").await.unwrap();
        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_mutation_on_follower_is_rejected() {
        let (_dir, engine, store) = harness(ReadPolicy::LeaderOnly);
        engine.set_role(RaftRole::Follower);
        engine.set_leader(Some(Peer {
            id: 2,
            address: "10.0.0.2:12000".into(),
        }));

        let err = store.set("a", "1").await.unwrap_err();
        match err {
            Error::NotLeader { leader } => {
                assert_eq!(leader, Some((2, "10.0.0.2:12000".to_string())));
            }
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_strong_read_rejected_on_follower() {
        let (_dir, engine, store) = harness(ReadPolicy::LeaderOnly);
        store.set("a", "1").await.unwrap();
        engine.set_role(RaftRole::Follower);

        assert!(matches!(
            store.get("a"),
            Err(Error::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_follower_read_serves_local_state() {
        let (_dir, engine, store) = harness(ReadPolicy::AllowFollower);
        store.set("a", "1").await.unwrap();
        engine.set_role(RaftRole::Follower);

        // Possibly stale, but served.
        assert_eq!(store.get("a").unwrap(), "1");
    }

    #[tokio::test]
    async fn test_get_never_reaches_the_log() {
        let (_dir, engine, store) = harness(ReadPolicy::LeaderOnly);
        store.set("a", "1").await.unwrap();
        let proposals_after_set = engine.proposal_count();

        let _ = store.get("a").unwrap();
        let _ = store.get("missing");
        assert_eq!(engine.proposal_count(), proposals_after_set);
    }
}
