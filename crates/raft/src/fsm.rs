//! The state-machine contract between the consensus engine and the
//! application.
//!
//! The engine invokes [`Fsm::apply`] exactly once per committed entry, in
//! strict index order, on a single thread. [`Fsm::snapshot`] may run its
//! serialisation concurrently with later applies; [`Fsm::restore`] is only
//! called while the apply loop is idle (snapshot install / catch-up).
//!
//! Determinism rules: `apply` must not consult wall-clock time, random
//! sources, the environment, or anything outside the local store. Its
//! outcome may depend only on the entry bytes and prior store state.

use std::io::Write;

use tessera_common::{LogIndex, Result, Term};

/// A committed log entry handed to the FSM.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Position in the replicated log; total order across the cluster.
    pub index: LogIndex,
    /// Term under which the entry was appended.
    pub term: Term,
    /// The opaque command payload.
    pub data: Vec<u8>,
}

/// Destination for a snapshot's serialised bytes.
///
/// A sink is either driven to completion with [`close`] or abandoned with
/// [`cancel`]; a cancelled snapshot never becomes visible to the engine.
///
/// [`close`]: SnapshotSink::close
/// [`cancel`]: SnapshotSink::cancel
pub trait SnapshotSink: Write + Send {
    /// Identifier of the snapshot being written.
    fn id(&self) -> &str;

    /// Finish the snapshot and make it durable.
    fn close(self: Box<Self>) -> Result<()>;

    /// Abandon the snapshot, discarding anything written so far.
    fn cancel(self: Box<Self>) -> Result<()>;
}

/// A point-in-time capture of the FSM state, cheap to create.
///
/// Creating the handle must be O(1) — typically pinning a read
/// transaction — with all serialisation deferred to [`persist`].
///
/// [`persist`]: FsmSnapshot::persist
pub trait FsmSnapshot: Send {
    /// Stream the captured state into `sink`, then close it.
    ///
    /// On any error the implementation must cancel the sink and roll its
    /// own resources back. A failed persist cancels the snapshot but does
    /// not fail the node; the engine retries later.
    fn persist(self: Box<Self>, sink: Box<dyn SnapshotSink>) -> Result<()>;

    /// Drop the capture without persisting it.
    fn release(self: Box<Self>);
}

/// Deterministic state machine fed by the replicated log.
pub trait Fsm: Send + 'static {
    /// Apply one committed entry.
    ///
    /// Errors are entry-level: they resolve that entry's proposal future
    /// (e.g. [`tessera_common::Error::Malformed`] for an undecodable
    /// payload) and must not poison later entries. Never panic on bad
    /// input.
    fn apply(&mut self, entry: &LogEntry) -> Result<()>;

    /// Capture the current state for log compaction or follower catch-up.
    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>>;

    /// Replace the entire state with a snapshot taken at `last_included`.
    ///
    /// On any decoding or storage error the previous state must remain
    /// intact; the engine will discard this node's state and retry.
    fn restore(&mut self, last_included: LogIndex, data: &[u8]) -> Result<()>;

    /// The log index of the last entry this FSM has applied, 0 if none.
    ///
    /// Consulted once at startup so replay resumes strictly after it.
    fn last_applied(&self) -> Result<LogIndex>;
}
