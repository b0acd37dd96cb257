//! Raft consensus engine for the Tessera replicated key-value store.
//!
//! This crate wraps `raft-rs` into the narrow engine contract the rest of
//! the system relies on: propose a payload and await its commit, observe
//! the node's role, change the voting configuration, and feed committed
//! entries into a deterministic state machine through the [`Fsm`] trait.
//!
//! # Architecture
//!
//! A [`node::RaftNode`] task owns the `RawNode` and drives it with a tick
//! interval and a command mailbox; callers hold a cheap, cloneable
//! [`node::RaftHandle`]. Log entries, vote state and the cluster address
//! book live in `raft.db` ([`log::LogStore`]); finished snapshots live
//! under `snapshots/` ([`snapshots::SnapshotStore`]). Messages between
//! nodes travel over gRPC ([`transport`]): each node runs one server and
//! lazily connects one client per peer.

pub mod config;
pub mod fsm;
pub mod log;
pub mod node;
pub mod snapshots;
pub mod transport;

pub use config::EngineConfig;
pub use fsm::{Fsm, FsmSnapshot, LogEntry, SnapshotSink};
pub use node::{Engine, Peer, RaftHandle, RaftNode, RaftRole};
