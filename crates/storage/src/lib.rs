//! Embedded SQLite store backing each Tessera node.
//!
//! Every node materialises its copy of the replicated map in a single
//! `pairs(key PRIMARY KEY, value)` table inside `sqlite3.db`. The store
//! runs in WAL mode so that the apply thread (single writer) never blocks
//! concurrent readers: facade point lookups, the full-table cursor and
//! the snapshot transaction all use a pooled read connection.
//!
//! Mutations arrive exclusively through the deterministic FSM (or a
//! snapshot restore); nothing else writes to `pairs`.

pub mod local;
pub mod migrate;

pub use local::{LocalStore, Pair, PairCursor, StoreSnapshot};
