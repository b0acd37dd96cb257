//! `tesserad` — one node of the Tessera replicated key-value store.
//!
//! Wires the pieces together in dependency order: local SQLite store →
//! deterministic FSM → consensus engine → replicated store facade →
//! HTTP frontend. Without `--join`, the node bootstraps a single-voter
//! cluster (a no-op with a warning if the raft state already exists);
//! with `--join`, it registers itself with the leader's HTTP endpoint.

mod http;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tessera_kv::{Cluster, PairsFsm, ReadPolicy, ReplicatedStore};
use tessera_raft::{EngineConfig, RaftNode};
use tessera_storage::LocalStore;

#[derive(Parser, Debug)]
#[command(name = "tesserad", about = "Tessera replicated key-value store node")]
struct Cli {
    /// The cluster-unique ID of this node.
    #[arg(short = 'i', long = "id")]
    node_id: u64,

    /// Address to listen on for HTTP connections.
    #[arg(short = 'H', long = "http-address", default_value = "127.0.0.1:11000")]
    http_address: String,

    /// Address to listen on for Raft RPC.
    #[arg(short = 'r', long = "raft-address", default_value = "127.0.0.1:12000")]
    raft_address: String,

    /// HTTP address of the cluster leader to join.
    #[arg(short = 'j', long = "join-address")]
    join_address: Option<String>,

    /// Directory holding the raft log, snapshots and the SQLite store.
    #[arg(short = 'd', long = "raft-directory")]
    raft_directory: PathBuf,

    /// Number of snapshots to keep.
    #[arg(long = "retain-snapshots", default_value_t = 2)]
    retain_snapshots: usize,

    /// Maximum seconds to wait for a proposal to commit.
    #[arg(long = "raft-timeout-secs", default_value_t = 10)]
    raft_timeout_secs: u64,

    /// Serve reads on followers too (possibly stale).
    #[arg(long = "allow-follower-reads", default_value_t = false)]
    allow_follower_reads: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!(
        node_id = cli.node_id,
        directory = %cli.raft_directory.display(),
        "node starting"
    );

    let local = Arc::new(LocalStore::open(&cli.raft_directory).context("open local store")?);
    let fsm = PairsFsm::new(local.clone());

    let mut engine_config = EngineConfig::new(
        cli.node_id,
        cli.raft_address.clone(),
        cli.raft_directory.clone(),
    );
    engine_config.retain_snapshots = cli.retain_snapshots;
    let handle = RaftNode::start(engine_config, Box::new(fsm))
        .await
        .context("start consensus engine")?;

    let engine = Arc::new(handle.clone());
    let timeout = Duration::from_secs(cli.raft_timeout_secs);
    let cluster = Cluster::new(engine.clone(), timeout);
    let policy = if cli.allow_follower_reads {
        ReadPolicy::AllowFollower
    } else {
        ReadPolicy::LeaderOnly
    };
    let store = ReplicatedStore::new(local, engine, policy, timeout);

    match &cli.join_address {
        None => {
            // First boot creates the cluster; later boots find the raft
            // state populated and carry on as an existing member.
            if let Err(e) = cluster.bootstrap(vec![]).await {
                warn!(error = %e, "bootstrap skipped");
            }
        }
        Some(leader_http) => {
            join_cluster(leader_http, cli.node_id, &handle.local_address())
                .await
                .context("join cluster")?;
        }
    }

    let http_address: SocketAddr = cli
        .http_address
        .parse()
        .with_context(|| format!("invalid http address {}", cli.http_address))?;
    let state = Arc::new(http::AppState {
        node_id: cli.node_id,
        store,
        cluster,
        handle: handle.clone(),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let frontend = tokio::spawn(http::serve(http_address, state, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("listen for interrupt")?;
    info!("interrupt received, shutting down");

    // Stop taking requests, then stop the engine (which flushes its
    // log); the local store closes when the last reference drops.
    let _ = shutdown_tx.send(true);
    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "engine shutdown reported an error");
    }
    frontend.await.context("join http task")??;
    info!("node exited");
    Ok(())
}

/// Register this node with the current leader over its HTTP endpoint.
async fn join_cluster(leader_http: &str, id: u64, raft_address: &str) -> anyhow::Result<()> {
    let url = format!("http://{leader_http}/join");
    info!(%url, id, raft_address, "requesting to join cluster");
    let response = reqwest::Client::new()
        .post(&url)
        .json(&serde_json::json!({ "id": id, "address": raft_address }))
        .send()
        .await
        .with_context(|| format!("post {url}"))?;
    if !response.status().is_success() {
        anyhow::bail!("join request to {url} failed with status {}", response.status());
    }
    info!("joined cluster");
    Ok(())
}
