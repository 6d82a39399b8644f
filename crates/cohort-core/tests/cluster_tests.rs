//! # cluster tests
//!
//! why: check that nodes running their own loops agree, converge and admit newcomers
//! relations: tests cohort-core through LocalNetwork and NodeHandle
//! what: election safety, replication, redirects, divergent logs, isolation, joining

use cohort_core::lodge::KvOp;
use cohort_core::{
    Command, HardState, Ledger, LocalNetwork, LogEntry, MemLodge, Node, NodeError, NodeHandle,
    NodeStatus, PeerRecord, RaftConfig, RoleKind, Term, VecLedger,
};
use std::time::Duration;

fn set(key: &str, value: &str) -> Command {
    KvOp::Set {
        key: key.into(),
        value: value.into(),
    }
    .to_command()
}

fn ledger_with_terms(terms: &[Term]) -> VecLedger {
    let entries = terms
        .iter()
        .enumerate()
        .map(|(i, term)| LogEntry::new(*term, i as u64 + 1, set(&format!("old{}", i + 1), "v")))
        .collect();
    let mut ledger = VecLedger::from_entries(entries).unwrap();
    ledger
        .save_hard_state(&HardState {
            current_term: terms.last().copied().unwrap_or(0),
            voted_for: None,
        })
        .unwrap();
    ledger
}

/// Logs go through the test writer; set RUST_LOG to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn spawn(network: &LocalNetwork, id: &str, voting: &[&str], ledger: VecLedger) -> NodeHandle {
    init_tracing();
    let members = voting.iter().map(|p| PeerRecord::voting(*p)).collect();
    let node = Node::new(
        id,
        RaftConfig::default(),
        members,
        ledger,
        MemLodge::new(),
        network.transport(id),
    )
    .unwrap();
    let (handle, _task) = node.spawn();
    network.register(handle.clone());
    handle
}

fn three_nodes(network: &LocalNetwork) -> Vec<NodeHandle> {
    let ids = ["a", "b", "c"];
    ids.iter()
        .map(|id| spawn(network, id, &ids, VecLedger::new()))
        .collect()
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

async fn statuses(handles: &[NodeHandle]) -> Vec<NodeStatus> {
    let mut out = Vec::new();
    for handle in handles {
        out.push(handle.status().await.unwrap());
    }
    out
}

/// The single leader among `handles`; panics when there is none or several.
async fn leader(handles: &[NodeHandle]) -> NodeHandle {
    let leaders: Vec<_> = statuses(handles)
        .await
        .into_iter()
        .filter(|s| s.role == RoleKind::Leader)
        .collect();
    assert_eq!(leaders.len(), 1, "expected exactly one leader: {:?}", leaders);
    handles
        .iter()
        .find(|h| *h.id() == leaders[0].id)
        .cloned()
        .unwrap()
}

// =============================================================================
// SECTION 1: ELECTION TESTS
// =============================================================================

mod election {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn three_nodes_elect_exactly_one_leader() {
        let network = LocalNetwork::new();
        let handles = three_nodes(&network);

        settle(2_000).await;

        let leader = leader(&handles).await;
        let all = statuses(&handles).await;
        let term = all.iter().find(|s| s.id == *leader.id()).unwrap().term;
        for status in &all {
            assert_eq!(status.term, term);
            assert_eq!(status.leader_id.as_deref(), Some(leader.id().as_str()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_leader_is_replaced() {
        let network = LocalNetwork::new();
        let handles = three_nodes(&network);
        settle(2_000).await;
        let old = leader(&handles).await;

        network.isolate(old.id());
        settle(2_000).await;

        let rest: Vec<_> = handles.iter().filter(|h| h.id() != old.id()).cloned().collect();
        let new = leader(&rest).await;
        assert_ne!(new.id(), old.id());
    }
}

// =============================================================================
// SECTION 2: REPLICATION TESTS
// =============================================================================

mod replication {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stored_command_reaches_every_lodge() {
        let network = LocalNetwork::new();
        let handles = three_nodes(&network);
        settle(2_000).await;
        let leader = leader(&handles).await;

        assert!(leader.store(set("color", "blue")).await.unwrap());
        settle(500).await;

        for status in statuses(&handles).await {
            assert_eq!(status.lodge["color"], "blue", "node {}", status.id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn follower_redirects_to_the_leader() {
        let network = LocalNetwork::new();
        let handles = three_nodes(&network);
        settle(2_000).await;
        let leader = leader(&handles).await;
        let follower = handles.iter().find(|h| h.id() != leader.id()).unwrap();

        let err = follower.store(set("k", "v")).await.unwrap_err();

        match err {
            NodeError::NotLeader { leader_id } => assert_eq!(leader_id.as_ref(), Some(leader.id())),
            other => panic!("expected a redirect, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn divergent_follower_converges_on_the_leader_log() {
        let network = LocalNetwork::new();
        let ids = ["a", "b", "c"];
        let handles = vec![
            spawn(&network, "a", &ids, ledger_with_terms(&[1, 1, 2, 2, 2])),
            spawn(&network, "b", &ids, ledger_with_terms(&[1, 1, 1, 1])),
            spawn(&network, "c", &ids, ledger_with_terms(&[1, 1, 2, 2, 2])),
        ];

        settle(3_000).await;

        let leader = leader(&handles).await;
        assert_ne!(leader.id(), "b");
        let all = statuses(&handles).await;
        let reference = all.iter().find(|s| s.id == *leader.id()).unwrap().log.clone();
        for status in &all {
            assert_eq!(status.log, reference, "node {}", status.id);
            assert_eq!(status.commit_index, reference.len() as u64);
        }
        assert_eq!(reference[2].term, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_follower_catches_up_after_healing() {
        let network = LocalNetwork::new();
        let handles = three_nodes(&network);
        settle(2_000).await;
        let first = leader(&handles).await;
        let lagging = handles.iter().find(|h| h.id() != first.id()).unwrap().clone();

        network.isolate(lagging.id());
        for n in 0..3 {
            assert!(first.store(set(&format!("k{n}"), "v")).await.unwrap());
        }
        network.heal(lagging.id());
        settle(3_000).await;

        let now = leader(&handles).await;
        let reference = now.status().await.unwrap();
        let caught_up = lagging.status().await.unwrap();
        assert_eq!(caught_up.log, reference.log);
        assert_eq!(caught_up.lodge["k2"], "v");
    }
}

// =============================================================================
// SECTION 3: MEMBERSHIP TESTS
// =============================================================================

mod membership {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn joining_node_is_admitted_into_the_cohort() {
        let network = LocalNetwork::new();
        let mut handles = three_nodes(&network);
        settle(2_000).await;

        // d only knows the existing voters and starts provisional
        handles.push(spawn(&network, "d", &["a", "b", "c"], VecLedger::new()));
        settle(2_000).await;

        for status in statuses(&handles).await {
            assert!(status.cohort.contains(&"d".to_string()), "node {}", status.id);
        }
        let leader = leader(&handles).await;
        assert!(leader.store(set("after", "join")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn shut_down_voter_is_removed() {
        let network = LocalNetwork::new();
        let handles = three_nodes(&network);
        settle(2_000).await;
        let leader = leader(&handles).await;
        let leaving = handles.iter().find(|h| h.id() != leader.id()).unwrap().clone();

        leaving.shutdown().await.unwrap();
        settle(1_000).await;

        let status = leader.status().await.unwrap();
        assert!(!status.quorum.iter().any(|r| r.peer == *leaving.id()));
        assert_eq!(status.cohort.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn provisional_seeds_never_lead_side_by_side() {
        let network = LocalNetwork::new();
        let handles: Vec<NodeHandle> = [("a", "b"), ("b", "a")]
            .into_iter()
            .map(|(id, seed)| {
                init_tracing();
                let node = Node::new(
                    id,
                    RaftConfig::default(),
                    vec![PeerRecord::provisional(seed)],
                    VecLedger::new(),
                    MemLodge::new(),
                    network.transport(id),
                )
                .unwrap();
                let (handle, _task) = node.spawn();
                network.register(handle.clone());
                handle
            })
            .collect();

        // long enough for each to sweep the other out of its table
        network.isolate("a");
        network.isolate("b");
        settle(1_000).await;
        network.heal("a");
        network.heal("b");
        settle(5_000).await;

        for status in statuses(&handles).await {
            assert_ne!(status.role, RoleKind::Leader, "node {} took the lead", status.id);
            assert!(status.cohort.is_empty());
        }
        for handle in &handles {
            let err = handle.store(set("k", handle.id())).await.unwrap_err();
            assert!(matches!(err, NodeError::NotLeader { .. }));
        }
    }
}
