//! Common type aliases used throughout Tessera.
//!
//! Using type aliases provides semantic clarity and makes it easier to
//! change the underlying types in the future if needed.

/// Unique identifier for a node in the cluster.
///
/// Each node has a cluster-unique `NodeId` assigned at startup. Node IDs
/// must be greater than 0 and are used for Raft voting, leadership and
/// membership tracking.
pub type NodeId = u64;

/// Raft term number.
///
/// Terms act as a logical clock: each term begins with an election and at
/// most one leader can be elected per term. Stale information is detected
/// by comparing term numbers.
pub type Term = u64;

/// Index into the replicated log.
///
/// Log indices start at 1 and increase monotonically; together with the
/// term they uniquely identify a log entry.
pub type LogIndex = u64;
