//! A scripted in-process engine so the facade and the cluster lifecycle
//! can be tested without spinning up consensus.
//!
//! Proposals "commit" immediately: the payload is decoded and applied to
//! the local store at the next log index, mimicking what the real engine
//! does for the proposer once an entry commits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera_common::{Error, NodeId, Result};
use tessera_protocol::{Command, CommandKind};
use tessera_raft::{Engine, Peer, RaftRole};
use tessera_storage::LocalStore;

pub(crate) struct StubEngine {
    role: Mutex<RaftRole>,
    leader: Mutex<Option<Peer>>,
    members: Mutex<Vec<Peer>>,
    calls: Mutex<Vec<String>>,
    store: Option<Arc<LocalStore>>,
    next_index: AtomicU64,
    proposals: AtomicU64,
}

impl StubEngine {
    /// A leader whose proposals apply to `store`.
    pub fn leading(store: Arc<LocalStore>) -> Self {
        StubEngine {
            role: Mutex::new(RaftRole::Leader),
            leader: Mutex::new(None),
            members: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            store: Some(store),
            next_index: AtomicU64::new(1),
            proposals: AtomicU64::new(0),
        }
    }

    /// A leader for membership tests; proposals are not expected.
    pub fn leading_without_store() -> Self {
        StubEngine {
            role: Mutex::new(RaftRole::Leader),
            leader: Mutex::new(None),
            members: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            store: None,
            next_index: AtomicU64::new(1),
            proposals: AtomicU64::new(0),
        }
    }

    pub fn set_role(&self, role: RaftRole) {
        *self.role.lock().unwrap() = role;
    }

    pub fn set_leader(&self, leader: Option<Peer>) {
        *self.leader.lock().unwrap() = leader;
    }

    pub fn seed_member(&self, id: NodeId, address: &str) {
        self.members.lock().unwrap().push(Peer {
            id,
            address: address.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn proposal_count(&self) -> u64 {
        self.proposals.load(Ordering::SeqCst)
    }

    fn not_leader(&self) -> Error {
        Error::NotLeader {
            leader: self
                .leader
                .lock()
                .unwrap()
                .clone()
                .map(|p| (p.id, p.address)),
        }
    }
}

impl Engine for StubEngine {
    async fn propose(&self, payload: Vec<u8>, _timeout: Duration) -> Result<()> {
        if *self.role.lock().unwrap() != RaftRole::Leader {
            return Err(self.not_leader());
        }
        self.proposals.fetch_add(1, Ordering::SeqCst);

        let command = Command::decode(&payload)?;
        let Some(store) = &self.store else {
            return Ok(());
        };
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        match command.kind {
            CommandKind::Set => store.apply_set(
                &command.key,
                command.value.as_deref().unwrap_or_default(),
                index,
            ),
            CommandKind::Delete => store.apply_delete(&command.key, index),
        }
    }

    fn role(&self) -> RaftRole {
        *self.role.lock().unwrap()
    }

    fn leader(&self) -> Option<Peer> {
        self.leader.lock().unwrap().clone()
    }

    async fn bootstrap(&self, members: Vec<Peer>) -> Result<()> {
        self.calls.lock().unwrap().push("bootstrap".to_string());
        *self.members.lock().unwrap() = members;
        Ok(())
    }

    async fn add_voter(&self, id: NodeId, address: String, _timeout: Duration) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("add:{id}:{address}"));
        let mut members = self.members.lock().unwrap();
        members.retain(|p| p.id != id);
        members.push(Peer { id, address });
        Ok(())
    }

    async fn remove_server(&self, id: NodeId, _timeout: Duration) -> Result<()> {
        self.calls.lock().unwrap().push(format!("remove:{id}"));
        self.members.lock().unwrap().retain(|p| p.id != id);
        Ok(())
    }

    async fn configuration(&self) -> Result<Vec<Peer>> {
        Ok(self.members.lock().unwrap().clone())
    }
}
