//! Command wire format for the Tessera replicated log.
//!
//! Every mutation travels through the consensus log as an encoded
//! [`Command`]. Reads never do: a `Get` has no wire representation at all.
//! The encoding is canonical JSON with a fixed field order so that every
//! node (and every binary version) produces identical bytes for the same
//! command, and old logs and snapshots stay decodable after restart.

pub mod command;

pub use command::{Command, CommandKind};
