//! # cohort-sim
//!
//! why: run a small cohort in one process to watch elections, replication and membership
//! relations: drives cohort-core over LocalNetwork, optionally persists through cohort-storage
//! what: cli parsing, cluster bootstrap, client requests with leader redirects, status dump

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use cohort_core::lodge::KvOp;
use cohort_core::{
    Command, Ledger, LocalNetwork, MemLodge, Node, NodeError, NodeHandle, NodeStatus, PeerRecord,
    RaftConfig, RoleKind, VecLedger,
};
use cohort_storage::FileLedger;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Command-line arguments for the simulator.
#[derive(Parser, Debug)]
#[command(name = "cohort-sim", version, about = "In-process consensus cohort simulator")]
struct Cli {
    /// Number of voting nodes to start with
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// Client writes to issue once a leader is up
    #[arg(short, long, default_value_t = 5)]
    requests: usize,

    /// JSON file with RaftConfig overrides
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep each node's ledger under this directory instead of in memory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Start one extra provisional node and let the leader admit it
    #[arg(long)]
    join: bool,

    /// Cut the first leader off, write through its successor, then heal
    #[arg(long)]
    isolate: bool,

    /// How long to let the cluster settle before the final report (ms)
    #[arg(long, default_value_t = 1_000)]
    settle_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.nodes == 0 {
        bail!("--nodes must be at least 1");
    }

    let config = match &cli.config {
        Some(path) => RaftConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RaftConfig::default(),
    };
    info!(?config, "starting simulation");

    let statuses = match cli.data_dir.clone() {
        Some(root) => {
            simulate(&cli, &config, move |id| {
                FileLedger::open(root.join(id)).with_context(|| format!("opening ledger for {id}"))
            })
            .await?
        }
        None => simulate(&cli, &config, |_| Ok(VecLedger::new())).await?,
    };

    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

async fn simulate<L, F>(cli: &Cli, config: &RaftConfig, open: F) -> Result<Vec<NodeStatus>>
where
    L: Ledger + 'static,
    F: Fn(&str) -> Result<L>,
{
    let network = LocalNetwork::new();
    let ids: Vec<String> = (1..=cli.nodes).map(|n| format!("n{n}")).collect();
    let members: Vec<PeerRecord> = ids.iter().map(PeerRecord::voting).collect();

    let mut handles = Vec::with_capacity(ids.len() + 1);
    for id in &ids {
        handles.push(spawn(&network, id, members.clone(), open(id)?, config)?);
    }

    let leader = wait_for_leader(&handles, config).await?;
    info!(leader = %leader.id(), "leader elected");

    for n in 0..cli.requests {
        let committed = store(&network, &leader, set(&format!("key{n}"), &format!("value{n}"))).await?;
        info!(request = n, committed, "write acknowledged");
    }

    if cli.isolate {
        network.isolate(leader.id());
        let rest: Vec<NodeHandle> = handles.iter().filter(|h| h.id() != leader.id()).cloned().collect();
        let successor = wait_for_leader(&rest, config).await?;
        info!(old = %leader.id(), new = %successor.id(), "leadership moved");
        let committed = store(&network, &successor, set("during-partition", "yes")).await?;
        info!(committed, "write during partition");
        network.heal(leader.id());
    }

    if cli.join {
        let id = format!("n{}", cli.nodes + 1);
        info!(node = %id, "joining new node");
        handles.push(spawn(&network, &id, members.clone(), open(&id)?, config)?);
    }

    tokio::time::sleep(Duration::from_millis(cli.settle_ms)).await;

    let mut statuses = Vec::with_capacity(handles.len());
    for handle in &handles {
        statuses.push(handle.status().await?);
    }
    for handle in &handles {
        if let Err(err) = handle.shutdown().await {
            warn!(node = %handle.id(), error = %err, "shutdown failed");
        }
    }
    Ok(statuses)
}

fn spawn<L: Ledger + 'static>(
    network: &LocalNetwork,
    id: &str,
    members: Vec<PeerRecord>,
    ledger: L,
    config: &RaftConfig,
) -> Result<NodeHandle> {
    let node = Node::new(
        id,
        config.clone(),
        members,
        ledger,
        MemLodge::new(),
        network.transport(id),
    )?;
    let (handle, _task) = node.spawn();
    network.register(handle.clone());
    Ok(handle)
}

fn set(key: &str, value: &str) -> Command {
    KvOp::Set {
        key: key.into(),
        value: value.into(),
    }
    .to_command()
}

/// Poll until exactly one of `handles` reports itself leader.
async fn wait_for_leader(handles: &[NodeHandle], config: &RaftConfig) -> Result<NodeHandle> {
    let poll = Duration::from_millis(config.heartbeat_interval);
    let rounds = 20 * config.election_timeout_max / config.heartbeat_interval;
    for _ in 0..rounds {
        for handle in handles {
            if handle.status().await?.role == RoleKind::Leader {
                return Ok(handle.clone());
            }
        }
        tokio::time::sleep(poll).await;
    }
    bail!("no leader elected among {} nodes", handles.len())
}

/// Send a write, following leader redirects a few times.
async fn store(network: &LocalNetwork, first: &NodeHandle, command: Command) -> Result<bool> {
    let mut target = first.clone();
    for _ in 0..5 {
        match target.store(command.clone()).await {
            Err(NodeError::NotLeader {
                leader_id: Some(leader),
            }) => {
                info!(from = %target.id(), to = %leader, "redirected");
                target = network
                    .handle(&leader)
                    .with_context(|| format!("leader {leader} is not on the network"))?;
            }
            Err(NodeError::NotLeader { leader_id: None }) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            other => return Ok(other?),
        }
    }
    bail!("gave up on write after repeated redirects")
}
