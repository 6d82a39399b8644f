use super::{admit_leader, answer_vote, stale_reply, RoleBehavior, RoleKind, Transition};
use crate::error::NodeError;
use crate::lodge::Lodge;
use crate::log::Ledger;
use crate::message::{AppendEntries, AppendEntriesReply, RequestVote, VoteReply};
use crate::node::Core;
use tokio::time::Instant;

/// Passive role: follows a leader, and campaigns once it goes quiet.
#[derive(Debug, Default)]
pub struct Follower {
    deadline: Option<Instant>,
}

impl Follower {
    fn arm<L: Ledger, S: Lodge>(&mut self, core: &Core<L, S>) {
        self.deadline = Some(Instant::now() + core.config.election_timeout());
    }

    /// Election timeout fired.
    ///
    /// Nodes outside the cohort stay put unless the cohort is empty.
    pub(crate) fn on_timer<L: Ledger, S: Lodge>(&mut self, core: &mut Core<L, S>) -> Transition {
        if core.membership.may_campaign() {
            tracing::info!(term = core.current_term, "election timeout, campaigning");
            return Transition::Candidate;
        }
        tracing::debug!("election timeout while provisional, waiting for admission");
        self.arm(core);
        Transition::Stay
    }
}

impl RoleBehavior for Follower {
    fn kind(&self) -> RoleKind {
        RoleKind::Follower
    }

    fn start<L: Ledger, S: Lodge>(&mut self, core: &mut Core<L, S>) {
        self.arm(core);
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
        self.arm(core);
        let reply = core.accept_entries(request)?;
        Ok((reply, Transition::Stay))
    }

    fn on_request_vote<L: Ledger, S: Lodge>(
        &mut self,
        core: &mut Core<L, S>,
        request: &RequestVote,
    ) -> Result<(VoteReply, Transition), NodeError> {
        let (reply, _) = answer_vote(core, request)?;
        if reply.granted {
            self.arm(core);
        }
        Ok((reply, Transition::Stay))
    }
}
