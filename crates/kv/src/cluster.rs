//! Cluster lifecycle: bootstrap, join, remove.
//!
//! Join handles the two operational accidents around identity reuse: a
//! node restarting under a new address (its stale id lingers in the
//! configuration) and an address being reused by a new id (the stale
//! entry holds the address). A member matching on both id and address is
//! already in; matching on only one of them is removed before the voter
//! is added.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use tessera_common::{NodeId, Result};
use tessera_raft::{Engine, Peer};

/// Membership operations over a consensus engine handle. Join and remove
/// must run on the current leader; the frontend routes them there.
pub struct Cluster<E> {
    engine: Arc<E>,
    timeout: Duration,
}

impl<E: Engine> Cluster<E> {
    pub fn new(engine: Arc<E>, timeout: Duration) -> Self {
        Cluster { engine, timeout }
    }

    /// Install the initial voter configuration.
    ///
    /// With an empty `nodes` list the engine bootstraps a single-voter
    /// cluster of just this node; otherwise the list is installed
    /// verbatim. Must be called on exactly one node, once per cluster
    /// lifetime; a node with existing raft state refuses.
    pub async fn bootstrap(&self, nodes: Vec<Peer>) -> Result<()> {
        self.engine.bootstrap(nodes).await
    }

    /// Add the node `id` at `address` to the voting configuration.
    ///
    /// Idempotent when the exact member is already present. A member
    /// sharing only the id or only the address is removed first.
    pub async fn join(&self, id: NodeId, address: &str) -> Result<()> {
        info!(id, address, "join requested");
        let configuration = self.engine.configuration().await?;

        for server in &configuration {
            if server.id != id && server.address != address {
                continue;
            }
            if server.id == id && server.address == address {
                debug!(id, address, "node already a member, ignoring join");
                return Ok(());
            }
            // Stale twin: same id under another address, or another id
            // holding this address. It has to go before the add.
            info!(
                stale_id = server.id,
                stale_address = %server.address,
                "removing conflicting member before join"
            );
            self.engine.remove_server(server.id, self.timeout).await?;
        }

        self.engine.add_voter(id, address.to_string(), self.timeout).await?;
        info!(id, address, "node joined");
        Ok(())
    }

    /// Remove the node `id` from the voting configuration.
    pub async fn remove_node(&self, id: NodeId) -> Result<()> {
        info!(id, "remove requested");
        self.engine.remove_server(id, self.timeout).await
    }

    /// The committed membership.
    pub async fn configuration(&self) -> Result<Vec<Peer>> {
        self.engine.configuration().await
    }
}
