//! Error types for the Tessera replicated key-value store.
//!
//! One enum covers every error kind the core surfaces to callers. Uses
//! `thiserror` for ergonomic error handling.

use thiserror::Error;

use crate::types::NodeId;

/// Common error type for Tessera operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Mutation (or strong read) attempted on a non-leader node.
    ///
    /// Retryable by redirecting to the current leader, whose identity and
    /// address are included when known.
    #[error("not leader{}", match .leader {
        Some((id, addr)) => format!(": current leader is node {id} at {addr}"),
        None => String::new(),
    })]
    NotLeader {
        /// The current leader's id and network address, if known.
        leader: Option<(NodeId, String)>,
    },

    /// The proposal did not commit within the configured window.
    ///
    /// Indeterminate: the entry may still commit later. Callers must not
    /// assume the mutation was dropped.
    #[error("proposal timed out")]
    Timeout,

    /// RPC-layer failure talking to a peer; retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Requested key is absent (reads only).
    #[error("key not found")]
    NotFound,

    /// Local store I/O or consistency error; fatal to the operation, not
    /// the process.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization failure on the way into the log; indicates a bug or
    /// an incompatible peer.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A committed log entry failed to decode. Returned on that entry's
    /// future; later entries are unaffected.
    #[error("malformed log entry: {0}")]
    Malformed(String),

    /// The node is shutting down; in-flight operations fail with this.
    #[error("node is shutting down")]
    Shutdown,
}

impl Error {
    /// Whether the caller may reasonably retry the operation (possibly
    /// against a different node).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotLeader { .. } | Error::Transport(_))
    }
}

/// Convenience alias for `Result` with the Tessera [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
