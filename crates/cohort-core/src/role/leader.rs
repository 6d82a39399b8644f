use super::{answer_vote, stale_reply, RoleBehavior, RoleKind, Transition};
use crate::error::{ApplyError, NodeError, RpcError};
use crate::lodge::Lodge;
use crate::log::{Command, Ledger, LogEntry, LogPosition};
use crate::membership::PeerRecord;
use crate::message::{
    AppendEntries, AppendEntriesReply, Context, RequestVote, Rpc, RpcReply, StoreReply, VoteReply,
};
use crate::node::Core;
use crate::work::Work;
use crate::{Index, PeerId};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

/// Outcome of one replication cycle.
#[derive(Debug)]
pub struct Tick {
    /// Commit index once the cycle finished
    pub commit_index: Index,
    /// Peers whose append succeeded
    pub acked: Vec<PeerId>,
    /// Entries that failed to apply while committing
    pub failures: Vec<(Index, ApplyError)>,
    pub transition: Transition,
}

/// Replicating role.
#[derive(Debug, Default)]
pub struct Leader {
    next_index: HashMap<PeerId, Index>,
    /// Peers with an add_cohort proposal already queued
    admitting: HashSet<PeerId>,
    deadline: Option<Instant>,
}

impl Leader {
    /// Next index the leader will send to `peer`.
    pub fn next_index(&self, peer: &str) -> Option<Index> {
        self.next_index.get(peer).copied()
    }

    /// One replication cycle: send every quorum peer its pending suffix,
    /// adjust progress from the replies, then commit on a weighted majority.
    ///
    /// Only an entry of the current term is committed by counting; earlier
    /// entries follow along with it.
    pub async fn heart_beat<L: Ledger, S: Lodge>(
        &mut self,
        core: &mut Core<L, S>,
        ctx: &Context,
    ) -> Result<Tick, NodeError> {
        self.deadline = Some(Instant::now() + core.config.heartbeat());
        let term = core.current_term;
        let last = core.ledger.len();

        let peers: Vec<PeerId> = core
            .membership
            .quorum()
            .filter(|peer| **peer != core.id)
            .cloned()
            .collect();
        // progress of peers that left the quorum is forgotten
        self.next_index.retain(|peer, _| core.membership.in_quorum(peer));
        let mut batch = Vec::with_capacity(peers.len());
        for peer in peers {
            let next = (*self.next_index.entry(peer.clone()).or_insert(last + 1)).clamp(1, last + 1);
            let request = AppendEntries {
                term,
                leader_id: core.id.clone(),
                prev_log: core
                    .ledger
                    .get(next - 1)
                    .map(LogEntry::position)
                    .unwrap_or_default(),
                entries: core.ledger.entries_from(next),
                leader_commit: core.commit_index,
            };
            batch.push((peer, request));
        }

        let caller = core.caller();
        let calls = batch.into_iter().map(|(peer, request)| {
            let caller = caller.clone();
            let ctx = ctx.clone();
            async move {
                let result = caller.call(&ctx, &peer, Rpc::AppendEntries(request)).await;
                (peer, result)
            }
        });
        let results = join_all(calls).await;

        let mut acked = Vec::new();
        for (peer, result) in results {
            match result {
                Ok(RpcReply::AppendEntries(reply)) => {
                    core.membership.refresh(&peer);
                    if reply.term > term {
                        tracing::info!(peer = %peer, term = reply.term, "newer term seen, stepping down");
                        core.observe_term(reply.term)?;
                        return Ok(Tick {
                            commit_index: core.commit_index,
                            acked,
                            failures: Vec::new(),
                            transition: Transition::Follower,
                        });
                    }
                    if reply.success {
                        self.next_index.insert(peer.clone(), last + 1);
                        if !core.membership.in_cohort(&peer) {
                            self.admit(core, &peer);
                        }
                        acked.push(peer);
                    } else if let Some(conflict) = reply.conflict {
                        self.back_off(&core.ledger, &peer, conflict);
                    }
                }
                Ok(other) => tracing::warn!(peer = %peer, reply = ?other, "unexpected reply to append entries"),
                Err(RpcError::Timeout { .. }) => {
                    tracing::debug!(peer = %peer, "append entries timed out, resending next cycle")
                }
                Err(err) => tracing::warn!(peer = %peer, error = %err, "append entries failed"),
            }
        }

        let mut failures = Vec::new();
        if last > core.commit_index
            && core.ledger.term_at(last) == term
            && core.membership.is_majority(acked.iter())
        {
            failures = core.commit_to(last);
        }
        self.admitting.retain(|peer| !core.membership.in_cohort(peer));

        let transition = if core.membership.in_quorum(&core.id) {
            Transition::Stay
        } else {
            tracing::info!("removed from the quorum, stepping down");
            Transition::Follower
        };
        Ok(Tick {
            commit_index: core.commit_index,
            acked,
            failures,
            transition,
        })
    }

    /// Append a client command and run a replication cycle for it.
    ///
    /// `committed` in the reply says whether a majority took it in this cycle;
    /// an apply failure of this very entry is handed back as `Failed`.
    pub async fn on_request_store<L: Ledger, S: Lodge>(
        &mut self,
        core: &mut Core<L, S>,
        ctx: &Context,
        command: Command,
    ) -> Result<(StoreReply, Transition), NodeError> {
        let index = core.append_new(command, false)?;
        tracing::debug!(index, term = core.current_term, "stored client command");
        let tick = self.heart_beat(core, ctx).await?;
        let failed = tick
            .failures
            .into_iter()
            .find(|(failed_index, _)| *failed_index == index);
        let reply = match failed {
            Some((_, err)) => StoreReply::Failed(err),
            None => StoreReply::Stored {
                index,
                committed: index <= tick.commit_index,
            },
        };
        Ok((reply, tick.transition))
    }

    /// Queue an add_cohort proposal for a provisional peer that caught up.
    fn admit<L: Ledger, S: Lodge>(&mut self, core: &mut Core<L, S>, peer: &PeerId) {
        if !self.admitting.insert(peer.clone()) {
            return;
        }
        let vote_weight = core.membership.record(peer).map_or(1, |r| r.vote_weight);
        let record = PeerRecord {
            peer: peer.clone(),
            provisional: false,
            vote_weight,
        };
        let work = Work {
            command: record.to_command(),
            reason: "add_cohort",
        };
        match core.work.push(work) {
            Ok(()) => tracing::info!(peer = %peer, "peer caught up, proposing it for the cohort"),
            Err(err) => {
                tracing::warn!(peer = %peer, error = %err, "cannot queue cohort admission");
                self.admitting.remove(peer);
            }
        }
    }

    /// Move `peer`'s next index back after a failed consistency check.
    ///
    /// `conflict` is the follower's `(term, index)` at or before the probe.
    fn back_off<L: Ledger>(&mut self, ledger: &L, peer: &PeerId, conflict: LogPosition) {
        let old = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(ledger.len() + 1);
        let target = if conflict.index == 0 {
            1
        } else {
            match ledger.get(conflict.index) {
                Some(entry) if entry.term == conflict.term => conflict.index + 1,
                Some(entry) if entry.term > conflict.term => {
                    ledger.find_term_start(conflict.term).index + 1
                }
                Some(entry) => ledger.find_term_start(entry.term).index + 1,
                None => ledger.len() + 1,
            }
        };
        let next = target.min(old.saturating_sub(1)).max(1);
        tracing::debug!(peer = %peer, old, next, ?conflict, "backing off");
        self.next_index.insert(peer.clone(), next);
    }
}

impl RoleBehavior for Leader {
    fn kind(&self) -> RoleKind {
        RoleKind::Leader
    }

    /// Reset progress, then append the term's barrier entry. A provisional
    /// leader uses the barrier to promote itself into the cohort.
    fn start<L: Ledger, S: Lodge>(&mut self, core: &mut Core<L, S>) {
        let next = core.ledger.len() + 1;
        self.next_index = core
            .membership
            .quorum()
            .filter(|peer| **peer != core.id)
            .map(|peer| (peer.clone(), next))
            .collect();
        self.admitting.clear();
        core.leader_id = Some(core.id.clone());

        let barrier = if core.membership.in_cohort(&core.id) {
            Command::Noop
        } else {
            let vote_weight = core.membership.record(&core.id).map_or(1, |r| r.vote_weight);
            PeerRecord {
                peer: core.id.clone(),
                provisional: false,
                vote_weight,
            }
            .to_command()
        };
        if let Err(err) = core.append_new(barrier, true) {
            tracing::error!(error = %err, "cannot append leader barrier");
        }
        tracing::info!(term = core.current_term, "became leader");
        self.deadline = Some(Instant::now());
    }

    fn stop(&mut self) {
        self.deadline = None;
        self.next_index.clear();
        self.admitting.clear();
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn on_append_entries<L: Ledger, S: Lodge>(
        &mut self,
        core: &mut Core<L, S>,
        request: &AppendEntries,
    ) -> Result<(AppendEntriesReply, Transition), NodeError> {
        if request.term <= core.current_term {
            if request.term == core.current_term {
                tracing::warn!(other = %request.leader_id, term = request.term, "second leader in the same term");
            }
            return Ok((stale_reply(core), Transition::Stay));
        }
        core.observe_term(request.term)?;
        core.leader_id = Some(request.leader_id.clone());
        tracing::info!(leader = %request.leader_id, term = request.term, "newer leader, stepping down");
        let reply = core.accept_entries(request)?;
        Ok((reply, Transition::Follower))
    }

    fn on_request_vote<L: Ledger, S: Lodge>(
        &mut self,
        core: &mut Core<L, S>,
        request: &RequestVote,
    ) -> Result<(VoteReply, Transition), NodeError> {
        let (reply, newer) = answer_vote(core, request)?;
        let next = if newer { Transition::Follower } else { Transition::Stay };
        Ok((reply, next))
    }
}
