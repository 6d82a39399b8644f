//! # role
//!
//! why: define the raft role state machine and the transitions between roles
//! relations: driven by node.rs, operates on the shared Core it is handed
//! what: RoleKind, Transition, the RoleBehavior trait, the Role enum and the shared rpc paths

mod candidate;
mod follower;
mod leader;

pub use candidate::Candidate;
pub use follower::Follower;
pub use leader::{Leader, Tick};

use crate::error::NodeError;
use crate::lodge::Lodge;
use crate::log::Ledger;
use crate::message::{AppendEntries, AppendEntriesReply, RequestVote, VoteReply};
use crate::node::Core;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// The three possible roles a node can be in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    /// Passive - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional - requesting votes to become leader
    Candidate,
    /// Active - replicates the log, sends heartbeats
    Leader,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Follower => "follower",
            RoleKind::Candidate => "candidate",
            RoleKind::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// What a handler asks the node to do with its role afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Stay,
    Follower,
    Candidate,
    Leader,
}

impl Transition {
    pub fn target(&self) -> Option<RoleKind> {
        match self {
            Transition::Stay => None,
            Transition::Follower => Some(RoleKind::Follower),
            Transition::Candidate => Some(RoleKind::Candidate),
            Transition::Leader => Some(RoleKind::Leader),
        }
    }
}

/// Behaviour every role supplies. Handlers never swap the role themselves;
/// they return a [`Transition`] and the node performs it.
pub(crate) trait RoleBehavior {
    fn kind(&self) -> RoleKind;

    /// Arm timers and do the role's entry work.
    fn start<L: Ledger, S: Lodge>(&mut self, core: &mut Core<L, S>);

    /// Disarm timers. Must be safe to call more than once.
    fn stop(&mut self);

    /// When the role next wants `on_timer`, if at all.
    fn deadline(&self) -> Option<Instant>;

    fn on_append_entries<L: Ledger, S: Lodge>(
        &mut self,
        core: &mut Core<L, S>,
        request: &AppendEntries,
    ) -> Result<(AppendEntriesReply, Transition), NodeError>;

    fn on_request_vote<L: Ledger, S: Lodge>(
        &mut self,
        core: &mut Core<L, S>,
        request: &RequestVote,
    ) -> Result<(VoteReply, Transition), NodeError>;
}

/// The node's current role, carrying that role's private state.
#[derive(Debug)]
pub enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Default for Role {
    fn default() -> Self {
        Role::Follower(Follower::default())
    }
}

impl Role {
    /// Fresh, not yet started, role of the given kind.
    pub fn of(kind: RoleKind) -> Self {
        match kind {
            RoleKind::Follower => Role::Follower(Follower::default()),
            RoleKind::Candidate => Role::Candidate(Candidate::default()),
            RoleKind::Leader => Role::Leader(Leader::default()),
        }
    }
}

impl RoleBehavior for Role {
    fn kind(&self) -> RoleKind {
        match self {
            Role::Follower(r) => r.kind(),
            Role::Candidate(r) => r.kind(),
            Role::Leader(r) => r.kind(),
        }
    }

    fn start<L: Ledger, S: Lodge>(&mut self, core: &mut Core<L, S>) {
        match self {
            Role::Follower(r) => r.start(core),
            Role::Candidate(r) => r.start(core),
            Role::Leader(r) => r.start(core),
        }
    }

    fn stop(&mut self) {
        match self {
            Role::Follower(r) => r.stop(),
            Role::Candidate(r) => r.stop(),
            Role::Leader(r) => r.stop(),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self {
            Role::Follower(r) => r.deadline(),
            Role::Candidate(r) => r.deadline(),
            Role::Leader(r) => r.deadline(),
        }
    }

    fn on_append_entries<L: Ledger, S: Lodge>(
        &mut self,
        core: &mut Core<L, S>,
        request: &AppendEntries,
    ) -> Result<(AppendEntriesReply, Transition), NodeError> {
        match self {
            Role::Follower(r) => r.on_append_entries(core, request),
            Role::Candidate(r) => r.on_append_entries(core, request),
            Role::Leader(r) => r.on_append_entries(core, request),
        }
    }

    fn on_request_vote<L: Ledger, S: Lodge>(
        &mut self,
        core: &mut Core<L, S>,
        request: &RequestVote,
    ) -> Result<(VoteReply, Transition), NodeError> {
        match self {
            Role::Follower(r) => r.on_request_vote(core, request),
            Role::Candidate(r) => r.on_request_vote(core, request),
            Role::Leader(r) => r.on_request_vote(core, request),
        }
    }
}

/// Reject a stale leader, otherwise adopt its term and remember it.
///
/// Returns `false` when the request's term is behind ours.
fn admit_leader<L: Ledger, S: Lodge>(
    core: &mut Core<L, S>,
    request: &AppendEntries,
) -> Result<bool, NodeError> {
    if request.term < core.current_term {
        tracing::debug!(
            term = request.term,
            current = core.current_term,
            leader = %request.leader_id,
            "rejecting stale append entries"
        );
        return Ok(false);
    }
    core.observe_term(request.term)?;
    core.leader_id = Some(request.leader_id.clone());
    core.membership.refresh(&request.leader_id);
    Ok(true)
}

/// Failure reply for a request from an older term.
fn stale_reply<L: Ledger, S: Lodge>(core: &Core<L, S>) -> AppendEntriesReply {
    AppendEntriesReply {
        term: core.current_term,
        success: false,
        conflict: None,
    }
}

/// Vote handling shared by all roles.
///
/// Returns the reply and whether the request moved us to a newer term.
fn answer_vote<L: Ledger, S: Lodge>(
    core: &mut Core<L, S>,
    request: &RequestVote,
) -> Result<(VoteReply, bool), NodeError> {
    let newer = core.observe_term(request.term)?;
    let reply = core.grant_vote(request)?;
    Ok((reply, newer))
}
