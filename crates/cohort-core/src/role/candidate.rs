use super::{admit_leader, answer_vote, stale_reply, RoleBehavior, RoleKind, Transition};
use crate::error::NodeError;
use crate::lodge::Lodge;
use crate::log::Ledger;
use crate::message::{AppendEntries, AppendEntriesReply, Context, RequestVote, Rpc, RpcReply, VoteReply};
use crate::node::Core;
use crate::PeerId;
use futures::future::join_all;
use tokio::time::Instant;

/// Campaigning role. Runs one election round each time its timer fires.
#[derive(Debug, Default)]
pub struct Candidate {
    deadline: Option<Instant>,
    rounds: u32,
}

impl Candidate {
    /// Elections this candidate has run since it started.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// One election round: new term, self vote, then ask the cohort.
    ///
    /// Wins on a weighted majority of granted votes, steps down on any reply
    /// carrying a newer term, otherwise re-arms with a fresh random timeout.
    pub(crate) async fn campaign<L: Ledger, S: Lodge>(
        &mut self,
        core: &mut Core<L, S>,
        ctx: &Context,
    ) -> Result<Transition, NodeError> {
        self.rounds += 1;
        self.deadline = Some(Instant::now() + core.config.election_timeout());
        core.persist(core.current_term + 1, Some(core.id.clone()))?;
        core.leader_id = None;

        let term = core.current_term;
        let request = RequestVote {
            term,
            candidate_id: core.id.clone(),
            last_log: core.ledger.last_position(),
        };
        let voters: Vec<PeerId> = core
            .membership
            .cohort()
            .filter(|peer| **peer != core.id)
            .cloned()
            .collect();
        tracing::info!(term, voters = voters.len(), round = self.rounds, "requesting votes");

        let caller = core.caller();
        let ballots = voters.into_iter().map(|peer| {
            let caller = caller.clone();
            let ctx = ctx.clone();
            let rpc = Rpc::RequestVote(request.clone());
            async move {
                let result = caller.call(&ctx, &peer, rpc).await;
                (peer, result)
            }
        });
        let results = join_all(ballots).await;

        let mut granted = Vec::new();
        for (peer, result) in results {
            match result {
                Ok(RpcReply::RequestVote(reply)) => {
                    core.membership.refresh(&peer);
                    if reply.term > term {
                        tracing::info!(peer = %peer, term = reply.term, "newer term seen, abandoning election");
                        core.observe_term(reply.term)?;
                        return Ok(Transition::Follower);
                    }
                    if reply.granted {
                        granted.push(peer);
                    }
                }
                Ok(other) => tracing::warn!(peer = %peer, reply = ?other, "unexpected reply to vote request"),
                Err(err) => tracing::debug!(peer = %peer, error = %err, "vote request failed"),
            }
        }

        if core.membership.is_majority(granted.iter()) {
            tracing::info!(term, votes = granted.len() + 1, "won election");
            return Ok(Transition::Leader);
        }
        tracing::info!(term, votes = granted.len() + 1, "election lost, retrying after timeout");
        // fresh randomised wait so competing candidates spread out
        self.deadline = Some(Instant::now() + core.config.election_timeout());
        Ok(Transition::Stay)
    }
}

impl RoleBehavior for Candidate {
    fn kind(&self) -> RoleKind {
        RoleKind::Candidate
    }

    /// The first round runs as soon as the node gets to it.
    fn start<L: Ledger, S: Lodge>(&mut self, _core: &mut Core<L, S>) {
        self.deadline = Some(Instant::now());
    }

    fn stop(&mut self) {
        self.deadline = None;
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn on_append_entries<L: Ledger, S: Lodge>(
        &mut self,
        core: &mut Core<L, S>,
        request: &AppendEntries,
    ) -> Result<(AppendEntriesReply, Transition), NodeError> {
        if !admit_leader(core, request)? {
            return Ok((stale_reply(core), Transition::Stay));
        }
        tracing::info!(leader = %request.leader_id, term = request.term, "leader found, stepping down");
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
