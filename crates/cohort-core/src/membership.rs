//! # membership
//!
//! why: track who is in the cluster and whose acknowledgements count toward a majority
//! relations: applied as a lodge for quorum commands by node.rs, consulted by every role
//! what: PeerRecord, Membership (quorum/cohort views, weighted majority, presence and liveness)

use crate::error::ApplyError;
use crate::lodge::Lodge;
use crate::log::{Command, LogEntry};
use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One row of the peer table, as carried by `Command::QuorumChange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer: PeerId,
    pub provisional: bool,
    pub vote_weight: u64,
}

impl PeerRecord {
    /// A voting member with weight 1.
    pub fn voting(peer: impl Into<PeerId>) -> Self {
        Self {
            peer: peer.into(),
            provisional: false,
            vote_weight: 1,
        }
    }

    /// A known peer that does not vote yet.
    pub fn provisional(peer: impl Into<PeerId>) -> Self {
        Self {
            peer: peer.into(),
            provisional: true,
            vote_weight: 1,
        }
    }

    /// The `QuorumChange` command that installs this record.
    pub fn to_command(&self) -> Command {
        Command::QuorumChange {
            peer: self.peer.clone(),
            provisional: self.provisional,
            vote_weight: self.vote_weight,
        }
    }
}

#[derive(Debug, Clone)]
struct PeerState {
    provisional: bool,
    vote_weight: u64,
    credit: u32,
}

/// What a presence announcement did to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    /// Unknown peer, now tracked as provisional.
    Added,
    /// Known peer, liveness credit restored.
    Refreshed,
    /// Provisional peer left and was dropped.
    Dropped,
    /// A voting member left; only a replicated `QuorumLeave` may remove it.
    DepartingVoter,
    /// Announcement about ourselves or an unknown departing peer.
    Ignored,
}

/// The node's peer table.
///
/// `quorum` is every known peer (the replication targets); `cohort` is the
/// voting subset. Majority decisions only count cohort weight.
#[derive(Debug, Clone)]
pub struct Membership {
    local: PeerId,
    peers: BTreeMap<PeerId, PeerState>,
    /// Peers the node was configured with; always announced to, never swept.
    seeds: BTreeSet<PeerId>,
    liveness_credits: u32,
}

impl Membership {
    /// Seed the table; the local node is added as provisional when missing.
    pub fn new(local: impl Into<PeerId>, records: Vec<PeerRecord>, liveness_credits: u32) -> Self {
        let local = local.into();
        let seeds = records
            .iter()
            .filter(|record| record.peer != local)
            .map(|record| record.peer.clone())
            .collect();
        let mut membership = Self {
            local,
            peers: BTreeMap::new(),
            seeds,
            liveness_credits,
        };
        for record in records {
            membership.upsert(record);
        }
        if !membership.peers.contains_key(&membership.local) {
            let local = PeerRecord::provisional(membership.local.clone());
            membership.upsert(local);
        }
        membership
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn quorum(&self) -> impl Iterator<Item = &PeerId> + '_ {
        self.peers.keys()
    }

    pub fn quorum_size(&self) -> usize {
        self.peers.len()
    }

    pub fn in_quorum(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn cohort(&self) -> impl Iterator<Item = &PeerId> + '_ {
        self.peers
            .iter()
            .filter(|(_, state)| !state.provisional)
            .map(|(peer, _)| peer)
    }

    pub fn cohort_size(&self) -> usize {
        self.cohort().count()
    }

    pub fn in_cohort(&self, peer: &str) -> bool {
        self.peers.get(peer).map_or(false, |s| !s.provisional)
    }

    pub fn record(&self, peer: &str) -> Option<PeerRecord> {
        self.peers.get(peer).map(|state| PeerRecord {
            peer: peer.to_string(),
            provisional: state.provisional,
            vote_weight: state.vote_weight,
        })
    }

    pub fn records(&self) -> Vec<PeerRecord> {
        self.peers
            .keys()
            .filter_map(|peer| self.record(peer))
            .collect()
    }

    /// Weight a peer's vote carries; 0 for provisional or unknown peers.
    pub fn weight_of(&self, peer: &str) -> u64 {
        match self.peers.get(peer) {
            Some(state) if !state.provisional => state.vote_weight,
            _ => 0,
        }
    }

    /// Sum of the voting weights.
    pub fn total_weight(&self) -> u64 {
        self.peers
            .values()
            .filter(|s| !s.provisional)
            .map(|s| s.vote_weight)
            .sum()
    }

    /// Whether the local node plus `acks` outweigh half the cohort.
    ///
    /// Only cohort weight counts, the local node's included. With an empty
    /// cohort the local node alone is a majority, so a bootstrap node can
    /// commit its own promotion.
    pub fn is_majority<'a>(&self, acks: impl IntoIterator<Item = &'a PeerId>) -> bool {
        let total = self.total_weight();
        if total == 0 {
            return true;
        }
        let voters: BTreeSet<&PeerId> = acks.into_iter().filter(|p| **p != self.local).collect();
        let tally: u64 = self.weight_of(&self.local) + voters.iter().map(|p| self.weight_of(p)).sum::<u64>();
        2 * tally > total
    }

    /// Voting members campaign. A provisional node only does so as the
    /// bootstrap node: empty cohort and no configured peers.
    pub fn may_campaign(&self) -> bool {
        self.in_cohort(&self.local) || (self.cohort_size() == 0 && self.seeds.is_empty())
    }

    /// Everyone a presence announcement goes to: known peers plus the
    /// configured seeds, even those swept from the table.
    pub fn presence_targets(&self) -> Vec<PeerId> {
        let known: BTreeSet<&PeerId> = self.peers.keys().chain(self.seeds.iter()).collect();
        known
            .into_iter()
            .filter(|peer| **peer != self.local)
            .cloned()
            .collect()
    }

    /// Restore a peer's liveness credit after hearing from it.
    pub fn refresh(&mut self, peer: &str) {
        let credits = self.liveness_credits;
        if let Some(state) = self.peers.get_mut(peer) {
            state.credit = credits;
        }
    }

    /// Fold a presence announcement into the table.
    pub fn observe(&mut self, peer: &str, joining: bool) -> Presence {
        if peer == self.local {
            return Presence::Ignored;
        }
        let provisional = self.peers.get(peer).map(|state| state.provisional);
        match (provisional, joining) {
            (None, true) => {
                self.upsert(PeerRecord::provisional(peer));
                Presence::Added
            }
            (Some(_), true) => {
                self.refresh(peer);
                Presence::Refreshed
            }
            (Some(true), false) => {
                self.peers.remove(peer);
                Presence::Dropped
            }
            (Some(false), false) => Presence::DepartingVoter,
            (None, false) => Presence::Ignored,
        }
    }

    /// Spend one credit from every peer; provisional peers that run out are
    /// dropped and returned. Voting members are never dropped here.
    pub fn sweep(&mut self) -> Vec<PeerId> {
        let mut dropped = Vec::new();
        for (peer, state) in self.peers.iter_mut() {
            if *peer == self.local {
                continue;
            }
            state.credit = state.credit.saturating_sub(1);
            if state.credit == 0 && state.provisional {
                dropped.push(peer.clone());
            }
        }
        for peer in &dropped {
            tracing::debug!(peer = %peer, "dropping silent provisional peer");
            self.peers.remove(peer);
        }
        dropped
    }

    fn upsert(&mut self, record: PeerRecord) {
        let credit = self.liveness_credits;
        let state = self.peers.entry(record.peer).or_insert(PeerState {
            provisional: record.provisional,
            vote_weight: record.vote_weight,
            credit,
        });
        state.provisional = record.provisional;
        state.vote_weight = record.vote_weight;
    }
}

impl Lodge for Membership {
    fn execute(&mut self, entry: &LogEntry) -> Result<(), ApplyError> {
        match &entry.command {
            Command::QuorumChange {
                peer,
                provisional,
                vote_weight,
            } => {
                tracing::info!(peer = %peer, provisional, vote_weight, "membership change");
                self.upsert(PeerRecord {
                    peer: peer.clone(),
                    provisional: *provisional,
                    vote_weight: *vote_weight,
                });
                Ok(())
            }
            Command::QuorumLeave { peer } => {
                if self.peers.remove(peer).is_none() {
                    return Err(ApplyError::UnknownPeer(peer.clone()));
                }
                tracing::info!(peer = %peer, "peer left the cohort");
                Ok(())
            }
            other => Err(ApplyError::Malformed(format!(
                "membership cannot apply {:?}",
                other
            ))),
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self.records()).unwrap_or(serde_json::Value::Null)
    }
}
