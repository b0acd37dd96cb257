//! The consensus engine: a driver task around `RawNode` plus the cheap
//! cloneable handle the rest of the system talks to.
//!
//! The driver owns the raft state machine and runs a single event loop:
//! a tick interval advances the logical clock, inbound peer messages are
//! stepped in, and mailbox commands (proposals, configuration changes,
//! bootstrap, snapshot triggers) arrive from handles. After every event
//! the loop processes the pending `Ready` state in the canonical order —
//! send, persist, apply, advance — exactly once.
//!
//! Proposals are correlated with their committed entries through an
//! 8-byte proposal id carried in the entry context; the proposer's future
//! resolves when its entry is applied locally, with the FSM's verdict.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use prost_old::Message as _;
use raft::eraftpb::{ConfChange, ConfChangeType, ConfState, Entry, EntryType, Message};
use raft::{RawNode, StateRole, Storage as _};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{debug, error, info, warn};

use tessera_common::{Error, LogIndex, NodeId, Result};

use crate::config::EngineConfig;
use crate::fsm::{Fsm, LogEntry};
use crate::log::LogStore;
use crate::snapshots::{SnapshotMeta, SnapshotStore};
use crate::transport::{proto, PeerClientPool, TransportServer};

/// Entries kept below a fresh snapshot so slightly-lagging followers can
/// still catch up from the log instead of a full snapshot install.
const COMPACT_LAG: u64 = 64;

/// Mailbox capacity for handle commands.
const MAILBOX_CAPACITY: usize = 256;

/// Queue capacity for inbound peer messages.
const INBOUND_CAPACITY: usize = 1024;

/// Observable role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Leader,
    Follower,
    Candidate,
    Shutdown,
}

impl RaftRole {
    /// Lower-case name, as exposed on the status endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            RaftRole::Leader => "leader",
            RaftRole::Follower => "follower",
            RaftRole::Candidate => "candidate",
            RaftRole::Shutdown => "shutdown",
        }
    }
}

/// One member of the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub address: String,
}

/// The narrow contract the replicated store and the cluster lifecycle
/// rely on. Implemented by [`RaftHandle`]; tests substitute a stub.
pub trait Engine: Send + Sync + 'static {
    /// Propose an opaque payload. The future resolves once the entry is
    /// committed and applied locally, with the FSM's result for it.
    fn propose(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Current role of this node.
    fn role(&self) -> RaftRole;

    /// The current leader, when known.
    fn leader(&self) -> Option<Peer>;

    /// Install the initial voter configuration. Must be invoked exactly
    /// once across the cluster's lifetime; fails on a node whose raft
    /// state is no longer empty.
    fn bootstrap(&self, members: Vec<Peer>) -> impl Future<Output = Result<()>> + Send;

    /// Add a voting member, committed through the log.
    fn add_voter(
        &self,
        id: NodeId,
        address: String,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove a member, committed through the log.
    fn remove_server(
        &self,
        id: NodeId,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// The committed cluster configuration.
    fn configuration(&self) -> impl Future<Output = Result<Vec<Peer>>> + Send;
}

enum ChangeRequest {
    AddVoter { id: NodeId, address: String },
    RemoveServer { id: NodeId },
}

enum Mail {
    Propose {
        data: Vec<u8>,
        tx: oneshot::Sender<Result<()>>,
    },
    Change {
        change: ChangeRequest,
        tx: oneshot::Sender<Result<()>>,
    },
    Bootstrap {
        members: Vec<Peer>,
        tx: oneshot::Sender<Result<()>>,
    },
    Configuration {
        tx: oneshot::Sender<Vec<Peer>>,
    },
    TriggerSnapshot {
        tx: oneshot::Sender<Result<()>>,
    },
    SnapshotDone {
        index: LogIndex,
        result: Result<()>,
    },
    Shutdown {
        tx: oneshot::Sender<()>,
    },
}

/// Address carried inside an add-voter configuration change so every
/// node can update its address book when the change applies.
#[derive(Serialize, Deserialize)]
struct ChangeMeta {
    address: String,
}

/// Cheap cloneable handle to a running [`RaftNode`].
#[derive(Clone)]
pub struct RaftHandle {
    node_id: NodeId,
    local_addr: SocketAddr,
    mail_tx: mpsc::Sender<Mail>,
    role_rx: watch::Receiver<RaftRole>,
    leader_rx: watch::Receiver<Option<Peer>>,
}

impl RaftHandle {
    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The transport address actually bound (useful when the configured
    /// port was 0).
    pub fn local_address(&self) -> String {
        self.local_addr.to_string()
    }

    /// Watch channel over this node's role.
    pub fn role_watch(&self) -> watch::Receiver<RaftRole> {
        self.role_rx.clone()
    }

    /// Watch channel over the known leader.
    pub fn leader_watch(&self) -> watch::Receiver<Option<Peer>> {
        self.leader_rx.clone()
    }

    /// Ask the engine to take a snapshot now (it also does so on its own
    /// once enough entries have accumulated). Resolves when the snapshot
    /// has been started, not when it is finished.
    pub async fn trigger_snapshot(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_mail(Mail::TriggerSnapshot { tx }).await?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Stop the engine. Pending proposals resolve with
    /// [`Error::Shutdown`]; the transport stops accepting messages.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_mail(Mail::Shutdown { tx }).await?;
        let _ = rx.await;
        Ok(())
    }

    async fn send_mail(&self, mail: Mail) -> Result<()> {
        self.mail_tx.send(mail).await.map_err(|_| Error::Shutdown)
    }

    async fn await_reply<T>(
        &self,
        rx: oneshot::Receiver<Result<T>>,
        timeout: Duration,
    ) -> Result<T> {
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(Error::Shutdown),
            Ok(Ok(result)) => result,
        }
    }
}

impl Engine for RaftHandle {
    async fn propose(&self, payload: Vec<u8>, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_mail(Mail::Propose { data: payload, tx }).await?;
        self.await_reply(rx, timeout).await
    }

    fn role(&self) -> RaftRole {
        *self.role_rx.borrow()
    }

    fn leader(&self) -> Option<Peer> {
        self.leader_rx.borrow().clone()
    }

    async fn bootstrap(&self, members: Vec<Peer>) -> Result<()> {
        let members = if members.is_empty() {
            vec![Peer {
                id: self.node_id,
                address: self.local_address(),
            }]
        } else {
            members
        };
        let (tx, rx) = oneshot::channel();
        self.send_mail(Mail::Bootstrap { members, tx }).await?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    async fn add_voter(&self, id: NodeId, address: String, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_mail(Mail::Change {
            change: ChangeRequest::AddVoter { id, address },
            tx,
        })
        .await?;
        self.await_reply(rx, timeout).await
    }

    async fn remove_server(&self, id: NodeId, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_mail(Mail::Change {
            change: ChangeRequest::RemoveServer { id },
            tx,
        })
        .await?;
        self.await_reply(rx, timeout).await
    }

    async fn configuration(&self) -> Result<Vec<Peer>> {
        let (tx, rx) = oneshot::channel();
        self.send_mail(Mail::Configuration { tx }).await?;
        rx.await.map_err(|_| Error::Shutdown)
    }
}

/// The consensus engine. Constructed with [`RaftNode::start`], which
/// spawns the driver task and the gRPC transport and returns a handle.
pub struct RaftNode;

impl RaftNode {
    /// Open the durable stores under `config.directory`, bind the
    /// transport, and spawn the event loop.
    pub async fn start(config: EngineConfig, fsm: Box<dyn Fsm>) -> Result<RaftHandle> {
        config
            .validate()
            .map_err(|e| Error::Storage(format!("engine config: {e}")))?;

        let snapshots = SnapshotStore::open(&config.directory, config.retain_snapshots)?;
        let log_store = LogStore::open(&config.directory, snapshots.clone())?;

        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|e| Error::Transport(format!("bind {}: {e}", config.bind_address)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let (msg_tx, msg_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            let service = TransportServer::new(msg_tx).into_service();
            let shutdown = async move {
                let _ = stop_rx.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                .await
            {
                error!(error = %e, "raft transport server failed");
            }
        });

        // Resume applying strictly after what the FSM has already seen; a
        // compacted log can never hand out anything older anyway. Clamp to
        // the persisted commit index: a crash between applying an entry
        // and persisting the hard state leaves the FSM one step ahead,
        // and raft refuses an applied index beyond commit. The re-applied
        // entries are skipped against the FSM's own marker.
        let truncated = log_store.first_index().unwrap_or(1) - 1;
        let commit = log_store.hard_state().commit.max(truncated);
        let applied = fsm.last_applied()?.max(truncated).min(commit);

        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let raft_config = make_raft_config(&config, applied);
        raft_config
            .validate()
            .map_err(|e| Error::Storage(format!("raft config: {e}")))?;
        let raw_node = RawNode::new(&raft_config, log_store.clone(), &logger)
            .map_err(|e| Error::Storage(format!("raft init: {e}")))?;

        let pool = Arc::new(PeerClientPool::new());
        pool.set_peers(log_store.addresses()).await;

        let (mail_tx, mail_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (role_tx, role_rx) = watch::channel(RaftRole::Follower);
        let (leader_tx, leader_rx) = watch::channel(None);

        let driver = Driver {
            config,
            raw_node,
            fsm,
            log_store,
            snapshots,
            pool,
            mail_tx: mail_tx.clone(),
            mail_rx,
            msg_rx,
            role_tx,
            leader_tx,
            stop_tx,
            logger,
            pending: HashMap::new(),
            next_proposal: 0,
            applied,
            was_leader: false,
            snapshot_in_flight: false,
        };
        let node_id = driver.config.node_id;
        info!(node_id, address = %local_addr, "raft node starting");
        tokio::spawn(driver.run());

        Ok(RaftHandle {
            node_id,
            local_addr,
            mail_tx,
            role_rx,
            leader_rx,
        })
    }
}

fn make_raft_config(config: &EngineConfig, applied: LogIndex) -> raft::Config {
    raft::Config {
        id: config.node_id,
        election_tick: config.election_tick,
        heartbeat_tick: config.heartbeat_tick,
        applied,
        ..Default::default()
    }
}

struct Driver {
    config: EngineConfig,
    raw_node: RawNode<LogStore>,
    fsm: Box<dyn Fsm>,
    log_store: LogStore,
    snapshots: SnapshotStore,
    pool: Arc<PeerClientPool>,
    mail_tx: mpsc::Sender<Mail>,
    mail_rx: mpsc::Receiver<Mail>,
    msg_rx: mpsc::Receiver<Message>,
    role_tx: watch::Sender<RaftRole>,
    leader_tx: watch::Sender<Option<Peer>>,
    stop_tx: watch::Sender<bool>,
    logger: slog::Logger,
    pending: HashMap<u64, oneshot::Sender<Result<()>>>,
    next_proposal: u64,
    applied: LogIndex,
    was_leader: bool,
    snapshot_in_flight: bool,
}

impl Driver {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.raw_node.tick();
                }
                maybe_msg = self.msg_rx.recv() => {
                    match maybe_msg {
                        Some(msg) => {
                            if let Err(e) = self.raw_node.step(msg) {
                                debug!(error = %e, "discarding unsteppable message");
                            }
                        }
                        None => {
                            warn!("transport channel closed, stopping node");
                            break;
                        }
                    }
                }
                maybe_mail = self.mail_rx.recv() => {
                    match maybe_mail {
                        None => break,
                        Some(Mail::Shutdown { tx }) => {
                            self.stop();
                            let _ = tx.send(());
                            return;
                        }
                        Some(mail) => self.handle_mail(mail).await,
                    }
                }
            }

            if let Err(e) = self.on_ready().await {
                error!(error = %e, "ready processing failed");
            }
            self.publish_status();
            self.maybe_snapshot();
        }
        self.stop();
    }

    async fn handle_mail(&mut self, mail: Mail) {
        match mail {
            Mail::Propose { data, tx } => {
                if self.raw_node.raft.state != StateRole::Leader {
                    let _ = tx.send(Err(self.not_leader()));
                    return;
                }
                let id = self.next_proposal_id();
                match self.raw_node.propose(id.to_be_bytes().to_vec(), data) {
                    Ok(()) => {
                        self.pending.insert(id, tx);
                    }
                    Err(e) => {
                        let _ = tx.send(Err(map_raft_error(e)));
                    }
                }
            }
            Mail::Change { change, tx } => {
                if self.raw_node.raft.state != StateRole::Leader {
                    let _ = tx.send(Err(self.not_leader()));
                    return;
                }
                let mut cc = ConfChange::default();
                match change {
                    ChangeRequest::AddVoter { id, address } => {
                        cc.set_change_type(ConfChangeType::AddNode);
                        cc.node_id = id;
                        match serde_json::to_vec(&ChangeMeta {
                            address: address.clone(),
                        }) {
                            Ok(meta) => cc.context = meta.into(),
                            Err(e) => {
                                let _ = tx.send(Err(Error::Encoding(e.to_string())));
                                return;
                            }
                        }
                        // Start talking to the new node right away so
                        // replication can begin as soon as the change
                        // commits; the durable book updates on apply.
                        self.pool.set_peer(id, address).await;
                    }
                    ChangeRequest::RemoveServer { id } => {
                        cc.set_change_type(ConfChangeType::RemoveNode);
                        cc.node_id = id;
                    }
                }
                let id = self.next_proposal_id();
                match self.raw_node.propose_conf_change(id.to_be_bytes().to_vec(), cc) {
                    Ok(()) => {
                        self.pending.insert(id, tx);
                    }
                    Err(e) => {
                        let _ = tx.send(Err(map_raft_error(e)));
                    }
                }
            }
            Mail::Bootstrap { members, tx } => {
                let _ = tx.send(self.bootstrap(members).await);
            }
            Mail::Configuration { tx } => {
                let book = self.log_store.addresses();
                let peers = self
                    .log_store
                    .voters()
                    .into_iter()
                    .map(|id| Peer {
                        id,
                        address: book.get(&id).cloned().unwrap_or_default(),
                    })
                    .collect();
                let _ = tx.send(peers);
            }
            Mail::TriggerSnapshot { tx } => {
                let _ = tx.send(self.start_snapshot());
            }
            Mail::SnapshotDone { index, result } => {
                self.snapshot_in_flight = false;
                match result {
                    Ok(()) => {
                        info!(index, "snapshot persisted");
                        self.compact_below(index);
                    }
                    // A failed persist cancels the snapshot but not the
                    // node; another attempt happens on the next trigger.
                    Err(e) => warn!(index, error = %e, "snapshot persist failed"),
                }
            }
            Mail::Shutdown { .. } => unreachable!("handled in the event loop"),
        }
    }

    async fn bootstrap(&mut self, members: Vec<Peer>) -> Result<()> {
        if self.log_store.is_initialized() {
            return Err(Error::Storage(
                "cluster already bootstrapped: raft state is not empty".into(),
            ));
        }
        info!(?members, "bootstrapping cluster");

        let mut cs = ConfState::default();
        cs.voters = members.iter().map(|p| p.id).collect();
        self.log_store.set_conf_state(&cs)?;
        let book: HashMap<NodeId, String> = members
            .into_iter()
            .map(|p| (p.id, p.address))
            .collect();
        self.log_store.set_addresses(book.clone())?;
        self.pool.set_peers(book).await;

        // Rebuild the raft state machine so it picks up the new initial
        // configuration, then stand for election immediately.
        let raft_config = make_raft_config(&self.config, self.applied);
        self.raw_node = RawNode::new(&raft_config, self.log_store.clone(), &self.logger)
            .map_err(|e| Error::Storage(format!("raft init: {e}")))?;
        if let Err(e) = self.raw_node.campaign() {
            debug!(error = %e, "initial campaign refused");
        }
        Ok(())
    }

    async fn on_ready(&mut self) -> Result<()> {
        if !self.raw_node.has_ready() {
            return Ok(());
        }
        let mut ready = self.raw_node.ready();

        if !ready.messages().is_empty() {
            self.send_messages(ready.take_messages());
        }
        if ready.snapshot().get_metadata().index > 0 {
            let snapshot = ready.snapshot().clone();
            self.install_snapshot(snapshot).await?;
        }
        if !ready.entries().is_empty() {
            self.log_store.append(ready.entries())?;
        }
        if let Some(hs) = ready.hs() {
            self.log_store.set_hard_state(hs)?;
        }
        if !ready.persisted_messages().is_empty() {
            self.send_messages(ready.take_persisted_messages());
        }
        self.apply_entries(ready.take_committed_entries())?;

        let mut light = self.raw_node.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.log_store.set_commit(commit)?;
        }
        self.send_messages(light.take_messages());
        self.apply_entries(light.take_committed_entries())?;
        self.raw_node.advance_apply();
        Ok(())
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            match entry.get_entry_type() {
                EntryType::EntryNormal => self.apply_normal(&entry),
                EntryType::EntryConfChange => self.apply_conf_change(&entry)?,
                EntryType::EntryConfChangeV2 => {
                    warn!(index = entry.index, "ignoring unexpected v2 conf change");
                }
            }
            self.applied = entry.index;
        }
        Ok(())
    }

    fn apply_normal(&mut self, entry: &Entry) {
        if entry.data.is_empty() {
            // Leader no-op entry at term start.
            return;
        }
        let already = self.fsm.last_applied().unwrap_or(0);
        if entry.index <= already {
            warn!(
                index = entry.index,
                last_applied = already,
                "skipping entry the state machine already has"
            );
            return;
        }
        let result = self.fsm.apply(&LogEntry {
            index: entry.index,
            term: entry.term,
            data: entry.data.to_vec(),
        });
        if let Err(e) = &result {
            warn!(index = entry.index, error = %e, "state machine rejected entry");
        }
        self.resolve(&entry.context, result);
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<()> {
        let cc = match ConfChange::decode(&entry.data[..]) {
            Ok(cc) => cc,
            Err(e) => {
                self.resolve(&entry.context, Err(Error::Malformed(e.to_string())));
                return Ok(());
            }
        };
        let cs = self
            .raw_node
            .apply_conf_change(&cc)
            .map_err(|e| Error::Storage(format!("conf change: {e}")))?;
        self.log_store.set_conf_state(&cs)?;

        match cc.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                if !cc.context.is_empty() {
                    match serde_json::from_slice::<ChangeMeta>(&cc.context[..]) {
                        Ok(meta) => {
                            self.log_store.set_address(cc.node_id, meta.address.clone())?;
                            let pool = self.pool.clone();
                            let (id, address) = (cc.node_id, meta.address);
                            tokio::spawn(async move { pool.set_peer(id, address).await });
                        }
                        Err(e) => {
                            warn!(node = cc.node_id, error = %e, "conf change without usable address");
                        }
                    }
                }
                info!(node = cc.node_id, "voter added");
            }
            ConfChangeType::RemoveNode => {
                self.log_store.remove_address(cc.node_id)?;
                let pool = self.pool.clone();
                let id = cc.node_id;
                tokio::spawn(async move { pool.remove_peer(id).await });
                info!(node = cc.node_id, "server removed");
            }
        }
        self.resolve(&entry.context, Ok(()));
        Ok(())
    }

    async fn install_snapshot(&mut self, snapshot: raft::eraftpb::Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        let term = snapshot.get_metadata().term;
        let voters = snapshot.get_metadata().get_conf_state().voters.clone();
        let payload = <proto::SnapshotPayload as prost::Message>::decode(&snapshot.data[..])
            .map_err(|e| Error::Malformed(format!("snapshot payload: {e}")))?;

        self.fsm.restore(index, &payload.state)?;
        self.log_store.apply_snapshot(index, term, &voters)?;

        let peers: Vec<(NodeId, String)> = payload
            .peers
            .iter()
            .map(|p| (p.id, p.address.clone()))
            .collect();
        let book: HashMap<NodeId, String> = peers.iter().cloned().collect();
        self.log_store.set_addresses(book.clone())?;
        self.pool.set_peers(book).await;

        // Keep the received snapshot on disk so this node can serve it
        // (and survive a restart) without rebuilding one.
        self.snapshots.install(
            &SnapshotMeta {
                index,
                term,
                voters,
                peers,
            },
            &payload.state,
        )?;

        self.applied = index;
        info!(index, term, "snapshot installed");
        Ok(())
    }

    fn maybe_snapshot(&mut self) {
        if self.snapshot_in_flight {
            return;
        }
        let first = self.log_store.first_index().unwrap_or(1);
        if self.applied + 1 >= first.saturating_add(self.config.snapshot_threshold) {
            if let Err(e) = self.start_snapshot() {
                warn!(error = %e, "failed to start snapshot");
            }
        }
    }

    fn start_snapshot(&mut self) -> Result<()> {
        if self.snapshot_in_flight || self.applied == 0 {
            return Ok(());
        }
        let index = self.applied;
        let term = self
            .log_store
            .term(index)
            .map_err(|e| Error::Storage(format!("term of {index}: {e}")))?;
        let mut peers: Vec<(NodeId, String)> = self.log_store.addresses().into_iter().collect();
        peers.sort_by_key(|(id, _)| *id);
        let meta = SnapshotMeta {
            index,
            term,
            voters: self.log_store.voters(),
            peers,
        };

        // Capturing the state is O(1); the serialisation below runs off
        // the event loop so applies keep flowing meanwhile.
        let capture = self.fsm.snapshot()?;
        let sink = self.snapshots.create(meta)?;
        self.snapshot_in_flight = true;
        let mail = self.mail_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = capture.persist(sink);
            let _ = mail.blocking_send(Mail::SnapshotDone { index, result });
        });
        debug!(index, "snapshot started");
        Ok(())
    }

    fn compact_below(&mut self, snapshot_index: LogIndex) {
        let up_to = snapshot_index.saturating_sub(COMPACT_LAG);
        let first = self.log_store.first_index().unwrap_or(1);
        if up_to < first {
            return;
        }
        if let Err(e) = self.log_store.compact(up_to) {
            warn!(up_to, error = %e, "log compaction failed");
        }
    }

    fn publish_status(&mut self) {
        let role = match self.raw_node.raft.state {
            StateRole::Leader => RaftRole::Leader,
            StateRole::Follower => RaftRole::Follower,
            StateRole::Candidate | StateRole::PreCandidate => RaftRole::Candidate,
        };
        if self.was_leader && role != RaftRole::Leader {
            // Leadership lost: nothing pending can commit under us now.
            self.fail_pending(|| Error::NotLeader { leader: None });
        }
        self.was_leader = role == RaftRole::Leader;
        self.role_tx.send_if_modified(|current| {
            if *current != role {
                *current = role;
                true
            } else {
                false
            }
        });

        let leader = self.leader_peer();
        self.leader_tx.send_if_modified(|current| {
            if *current != leader {
                *current = leader;
                true
            } else {
                false
            }
        });
    }

    fn leader_peer(&self) -> Option<Peer> {
        let id = self.raw_node.raft.leader_id;
        if id == 0 {
            return None;
        }
        Some(Peer {
            id,
            address: self
                .log_store
                .addresses()
                .get(&id)
                .cloned()
                .unwrap_or_default(),
        })
    }

    fn not_leader(&self) -> Error {
        Error::NotLeader {
            leader: self
                .leader_peer()
                .map(|peer| (peer.id, peer.address)),
        }
    }

    fn send_messages(&self, messages: Vec<Message>) {
        for msg in messages {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                let to = msg.to;
                if let Err(e) = pool.send(msg).await {
                    // Best effort: raft retries through its own timers.
                    debug!(peer = to, error = %e, "raft message dropped");
                }
            });
        }
    }

    fn resolve(&mut self, context: &[u8], result: Result<()>) {
        if context.len() != 8 {
            return;
        }
        let id = u64::from_be_bytes(context.try_into().expect("length checked"));
        if let Some(tx) = self.pending.remove(&id) {
            let _ = tx.send(result);
        }
    }

    fn fail_pending(&mut self, make_error: impl Fn() -> Error) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(make_error()));
        }
    }

    fn next_proposal_id(&mut self) -> u64 {
        self.next_proposal += 1;
        self.next_proposal
    }

    fn stop(&mut self) {
        self.fail_pending(|| Error::Shutdown);
        let _ = self.role_tx.send(RaftRole::Shutdown);
        let _ = self.stop_tx.send(true);
        info!(node_id = self.config.node_id, "raft node stopped");
    }
}

fn map_raft_error(e: raft::Error) -> Error {
    match e {
        raft::Error::ProposalDropped => Error::NotLeader { leader: None },
        other => Error::Transport(other.to_string()),
    }
}
