//! # node
//!
//! why: own the consensus state of one peer and drive its role from rpcs and timers
//! relations: hands Core to role/, talks to peers through transport.rs, applies via lodge.rs
//! what: Core, Node (handlers, transitions, supervisor loop), NodeHandle, NodeStatus

use crate::config::RaftConfig;
use crate::error::{ApplyError, LedgerError, NodeError, RpcError};
use crate::lodge::Lodge;
use crate::log::{Command, HardState, Ledger, LogEntry, LogPosition};
use crate::membership::{Membership, PeerRecord, Presence};
use crate::message::{
    AppendEntries, AppendEntriesReply, Announce, Context, RequestStore, RequestVote, Rpc, RpcReply,
    StoreReply, VoteReply,
};
use crate::role::{Role, RoleBehavior, RoleKind, Transition};
use crate::transport::{Caller, Transport};
use crate::work::{Work, WorkQueue};
use crate::{Index, PeerId, Term};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

/// Depth of a node's inbound mailbox.
const MAILBOX_DEPTH: usize = 256;

/// State shared by every role: persistent term and vote, volatile commit
/// progress, the ledger, the lodge and the peer table.
pub struct Core<L: Ledger, S: Lodge> {
    pub(crate) id: PeerId,
    pub(crate) config: RaftConfig,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<PeerId>,
    pub(crate) leader_id: Option<PeerId>,
    pub(crate) commit_index: Index,
    pub(crate) last_applied: Index,
    pub(crate) ledger: L,
    pub(crate) lodge: S,
    pub(crate) membership: Membership,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) work: WorkQueue,
}

impl<L: Ledger, S: Lodge> Core<L, S> {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&PeerId> {
        self.voted_for.as_ref()
    }

    pub fn leader_id(&self) -> Option<&PeerId> {
        self.leader_id.as_ref()
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// `(term, index)` of the last applied entry.
    pub fn last_applied(&self) -> LogPosition {
        LogPosition::new(self.ledger.term_at(self.last_applied), self.last_applied)
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn lodge(&self) -> &S {
        &self.lodge
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn quorum(&self) -> impl Iterator<Item = &PeerId> + '_ {
        self.membership.quorum()
    }

    pub fn quorum_size(&self) -> usize {
        self.membership.quorum_size()
    }

    pub fn in_quorum(&self, peer: &str) -> bool {
        self.membership.in_quorum(peer)
    }

    pub fn cohort(&self) -> impl Iterator<Item = &PeerId> + '_ {
        self.membership.cohort()
    }

    pub fn cohort_size(&self) -> usize {
        self.membership.cohort_size()
    }

    pub fn in_cohort(&self, peer: &str) -> bool {
        self.membership.in_cohort(peer)
    }

    pub fn queued_work(&self) -> usize {
        self.work.len()
    }

    /// The outbound call primitive, bounded by the configured rpc timeout.
    /// Cloned into each concurrent request of a round.
    pub(crate) fn caller(&self) -> Caller {
        Caller::new(Arc::clone(&self.transport), self.config.rpc_deadline())
    }

    /// Make `term` and `voted_for` durable, then adopt them. On error the
    /// in-memory state is left untouched.
    pub(crate) fn persist(&mut self, term: Term, voted_for: Option<PeerId>) -> Result<(), LedgerError> {
        let state = HardState {
            current_term: term,
            voted_for,
        };
        self.ledger.save_hard_state(&state)?;
        self.current_term = state.current_term;
        self.voted_for = state.voted_for;
        Ok(())
    }

    /// Adopt `term` if it is newer, forgetting vote and leader.
    ///
    /// Returns whether the term changed.
    pub(crate) fn observe_term(&mut self, term: Term) -> Result<bool, LedgerError> {
        if term <= self.current_term {
            return Ok(false);
        }
        tracing::debug!(from = self.current_term, to = term, "adopting newer term");
        self.persist(term, None)?;
        self.leader_id = None;
        Ok(true)
    }

    /// Append a command of the current term at the tail.
    pub(crate) fn append_new(&mut self, command: Command, internal: bool) -> Result<Index, LedgerError> {
        let index = self.ledger.len() + 1;
        let term = self.current_term;
        let entry = if internal {
            LogEntry::internal(term, index, command)
        } else {
            LogEntry::new(term, index, command)
        };
        self.ledger.append(entry)?;
        Ok(index)
    }

    /// Vote for the candidate when the term matches, the vote is free and
    /// its log is at least as up to date as ours. The caller has already
    /// adopted any newer term.
    pub(crate) fn grant_vote(&mut self, request: &RequestVote) -> Result<VoteReply, LedgerError> {
        let up_to_date = request.last_log.is_up_to_date_with(&self.ledger.last_position());
        let free = self
            .voted_for
            .as_ref()
            .map_or(true, |voted| *voted == request.candidate_id);
        let granted = request.term == self.current_term && free && up_to_date;
        if granted && self.voted_for.is_none() {
            self.persist(self.current_term, Some(request.candidate_id.clone()))?;
        }
        tracing::debug!(
            candidate = %request.candidate_id,
            term = request.term,
            granted,
            up_to_date,
            "vote requested"
        );
        Ok(VoteReply {
            term: self.current_term,
            granted,
        })
    }

    /// Log-consistency check and merge for an AppendEntries from the
    /// current leader. Terms are settled by the caller.
    pub(crate) fn accept_entries(&mut self, request: &AppendEntries) -> Result<AppendEntriesReply, NodeError> {
        let prev = request.prev_log;
        if prev.index > 0 && self.ledger.term_at(prev.index) != prev.term {
            let conflict = match self.ledger.get(prev.index) {
                Some(entry) => entry.position(),
                None => self.ledger.last_position(),
            };
            tracing::debug!(?prev, ?conflict, "log mismatch");
            return Ok(AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict: Some(conflict),
            });
        }

        // entries we already hold are left alone, the rest replaces our suffix
        let held = request
            .entries
            .iter()
            .take_while(|entry| self.ledger.term_at(entry.index) == entry.term)
            .count();
        let fresh = &request.entries[held..];
        if let Some(first) = fresh.first() {
            if first.index <= self.commit_index {
                tracing::error!(
                    index = first.index,
                    commit = self.commit_index,
                    "refusing to overwrite committed entries"
                );
                return Ok(AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                    conflict: None,
                });
            }
            self.ledger.replace(first.index, fresh.to_vec())?;
        }

        let covered = prev.index + request.entries.len() as Index;
        for (index, err) in self.commit_to(request.leader_commit.min(covered)) {
            tracing::warn!(index, error = %err, "committed entry failed to apply");
        }
        Ok(AppendEntriesReply {
            term: self.current_term,
            success: true,
            conflict: None,
        })
    }

    /// Raise the commit index to `index` (bounded by the ledger) and apply
    /// everything newly committed, in order.
    ///
    /// A failing entry still counts as applied; its error is returned.
    pub(crate) fn commit_to(&mut self, index: Index) -> Vec<(Index, ApplyError)> {
        let target = index.min(self.ledger.len());
        if target <= self.commit_index {
            return Vec::new();
        }
        self.commit_index = target;

        let mut failures = Vec::new();
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            if let Err(err) = self.apply(next) {
                tracing::error!(index = next, error = %err, "apply failed");
                failures.push((next, err));
            }
        }
        tracing::debug!(commit = self.commit_index, "committed");
        failures
    }

    /// Hand the entry at `index` to its lodge: membership for quorum
    /// commands, the application lodge otherwise. `last_applied` moves to
    /// `index` whether or not the entry applied cleanly.
    pub(crate) fn apply(&mut self, index: Index) -> Result<(), ApplyError> {
        self.last_applied = index;
        let Some(entry) = self.ledger.get(index) else {
            return Ok(());
        };
        if entry.command.is_quorum() {
            self.membership.apply(entry)
        } else {
            self.lodge.apply(entry)
        }
    }
}

/// Snapshot of a node for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: PeerId,
    pub role: RoleKind,
    pub term: Term,
    pub leader_id: Option<PeerId>,
    pub commit_index: Index,
    pub last_applied: LogPosition,
    /// `(term, index)` of every entry
    pub log: Vec<LogPosition>,
    pub quorum: Vec<PeerRecord>,
    pub cohort: Vec<PeerId>,
    pub lodge: serde_json::Value,
}

/// What arrives in a node's mailbox.
pub(crate) enum Inbound {
    Rpc {
        ctx: Context,
        request: Rpc,
        reply: oneshot::Sender<Result<RpcReply, RpcError>>,
    },
    Status(oneshot::Sender<NodeStatus>),
    Shutdown,
}

/// A consensus node: shared core plus the active role.
pub struct Node<L: Ledger, S: Lodge> {
    core: Core<L, S>,
    role: Role,
}

impl<L: Ledger, S: Lodge> Node<L, S> {
    /// Build a follower from its seed membership, restoring term and vote
    /// from the ledger.
    pub fn new(
        id: impl Into<PeerId>,
        config: RaftConfig,
        members: Vec<PeerRecord>,
        ledger: L,
        lodge: S,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let id = id.into();
        let hard = ledger.load_hard_state()?;
        let membership = Membership::new(id.clone(), members, config.liveness_credits);
        let work = WorkQueue::new(config.work_queue_capacity);
        let mut node = Self {
            core: Core {
                id,
                config,
                current_term: hard.current_term,
                voted_for: hard.voted_for,
                leader_id: None,
                commit_index: 0,
                last_applied: 0,
                ledger,
                lodge,
                membership,
                transport,
                work,
            },
            role: Role::default(),
        };
        node.role.start(&mut node.core);
        tracing::info!(node = %node.core.id, term = node.core.current_term, "node created");
        Ok(node)
    }

    pub fn id(&self) -> &PeerId {
        &self.core.id
    }

    pub fn role(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn core(&self) -> &Core<L, S> {
        &self.core
    }

    pub fn term(&self) -> Term {
        self.core.current_term
    }

    pub fn commit_index(&self) -> Index {
        self.core.commit_index
    }

    /// Next index the leader would send to `peer`; `None` off-leader.
    pub fn next_index(&self, peer: &str) -> Option<Index> {
        match &self.role {
            Role::Leader(leader) => leader.next_index(peer),
            _ => None,
        }
    }

    /// When the active role's timer is due.
    pub fn deadline(&self) -> Option<Instant> {
        self.role.deadline()
    }

    pub fn status(&self) -> NodeStatus {
        let core = &self.core;
        NodeStatus {
            id: core.id.clone(),
            role: self.role.kind(),
            term: core.current_term,
            leader_id: core.leader_id.clone(),
            commit_index: core.commit_index,
            last_applied: core.last_applied(),
            log: (1..=core.ledger.len())
                .filter_map(|index| core.ledger.get(index))
                .map(LogEntry::position)
                .collect(),
            quorum: core.membership.records(),
            cohort: core.membership.cohort().cloned().collect(),
            lodge: core.lodge.snapshot(),
        }
    }

    /// Stop the old role, install the new one and start it.
    fn transition(&mut self, transition: Transition) {
        let Some(kind) = transition.target() else {
            return;
        };
        let from = self.role.kind();
        self.role.stop();
        self.role = Role::of(kind);
        self.role.start(&mut self.core);
        tracing::info!(node = %self.core.id, %from, to = %kind, term = self.core.current_term, "role change");
    }

    pub fn on_append_entries(
        &mut self,
        ctx: &Context,
        request: AppendEntries,
    ) -> Result<AppendEntriesReply, NodeError> {
        let _span = ctx.span("appent").entered();
        let (reply, transition) = self.role.on_append_entries(&mut self.core, &request)?;
        self.transition(transition);
        Ok(reply)
    }

    pub fn on_request_vote(&mut self, ctx: &Context, request: RequestVote) -> Result<VoteReply, NodeError> {
        let _span = ctx.span("reqvot").entered();
        let (reply, transition) = self.role.on_request_vote(&mut self.core, &request)?;
        self.transition(transition);
        Ok(reply)
    }

    /// Client command. Only the leader stores; others point at the leader.
    pub async fn on_request_store(&mut self, ctx: &Context, command: Command) -> Result<StoreReply, NodeError> {
        let Role::Leader(leader) = &mut self.role else {
            return Ok(StoreReply::NotLeader {
                leader_id: self.core.leader_id.clone(),
            });
        };
        let (reply, transition) = leader
            .on_request_store(&mut self.core, ctx, command)
            .instrument(ctx.span("reqsto"))
            .await?;
        self.transition(transition);
        Ok(reply)
    }

    /// Presence announcement from a peer.
    pub fn on_presence(&mut self, ctx: &Context, announce: Announce) {
        let _span = ctx.span("brdcst").entered();
        let peer = announce.peer;
        match self.core.membership.observe(&peer, announce.joining) {
            Presence::Added => tracing::info!(peer = %peer, "new peer, tracking as provisional"),
            Presence::Dropped => tracing::info!(peer = %peer, "provisional peer left"),
            Presence::DepartingVoter if self.role.kind() == RoleKind::Leader => {
                let work = Work {
                    command: Command::QuorumLeave { peer: peer.clone() },
                    reason: "leave",
                };
                match self.core.work.push(work) {
                    Ok(()) => tracing::info!(peer = %peer, "voter leaving, proposing its removal"),
                    Err(err) => tracing::warn!(peer = %peer, error = %err, "cannot queue removal"),
                }
            }
            Presence::DepartingVoter => {
                tracing::debug!(peer = %peer, "voter leaving, the leader will remove it")
            }
            Presence::Refreshed | Presence::Ignored => {}
        }
    }

    /// The active role's timer fired.
    pub async fn on_timer(&mut self, ctx: &Context) -> Result<(), NodeError> {
        let transition = match &mut self.role {
            Role::Follower(follower) => follower.on_timer(&mut self.core),
            Role::Candidate(candidate) => candidate.campaign(&mut self.core, ctx).await?,
            Role::Leader(leader) => leader.heart_beat(&mut self.core, ctx).await?.transition,
        };
        self.transition(transition);
        Ok(())
    }

    /// Start an election right away, whatever the current role.
    ///
    /// A node that may not campaign (provisional, not the bootstrap node)
    /// stays where it is.
    pub async fn campaign(&mut self, ctx: &Context) -> Result<(), NodeError> {
        if !self.core.membership.may_campaign() {
            tracing::debug!(node = %self.core.id, "not eligible to campaign");
            return Ok(());
        }
        if self.role.kind() != RoleKind::Candidate {
            self.transition(Transition::Candidate);
        }
        self.on_timer(ctx).await
    }

    /// Propose everything in the work queue, then replicate once.
    ///
    /// Off-leader the queue is discarded. Returns how many were proposed.
    pub async fn drain_work(&mut self, ctx: &Context) -> Result<usize, NodeError> {
        if self.core.work.is_empty() {
            return Ok(0);
        }
        let items = self.core.work.drain();
        let Role::Leader(leader) = &mut self.role else {
            tracing::debug!(dropped = items.len(), "not leading, dropping queued proposals");
            return Ok(0);
        };
        let count = items.len();
        for work in items {
            let index = self.core.append_new(work.command, true)?;
            tracing::info!(index, reason = work.reason, "proposing");
        }
        let tick = leader.heart_beat(&mut self.core, ctx).await?;
        self.transition(tick.transition);
        Ok(count)
    }

    /// Spend a liveness credit from every peer, dropping silent provisional ones.
    pub fn sweep(&mut self) -> Vec<PeerId> {
        self.core.membership.sweep()
    }

    /// Route an inbound request to its handler by mode.
    pub async fn handle(&mut self, ctx: &Context, request: Rpc) -> Result<RpcReply, RpcError> {
        let outcome = match request {
            Rpc::AppendEntries(req) => self.on_append_entries(ctx, req).map(RpcReply::AppendEntries),
            Rpc::RequestVote(req) => self.on_request_vote(ctx, req).map(RpcReply::RequestVote),
            Rpc::RequestStore(RequestStore { command }) => self
                .on_request_store(ctx, command)
                .await
                .map(RpcReply::RequestStore),
            Rpc::Presence(announce) => {
                self.on_presence(ctx, announce);
                Ok(RpcReply::Ack)
            }
        };
        outcome.map_err(|err| {
            tracing::warn!(node = %self.core.id, error = %err, "request failed");
            RpcError::Remote(err.to_string())
        })
    }

    /// Announce to every other known peer without waiting for answers.
    fn announce(&self, ctx: &Context, joining: bool) {
        let calls = self.presence_calls(ctx, joining);
        tokio::spawn(async move {
            join_all(calls).await;
        });
    }

    fn presence_calls(
        &self,
        ctx: &Context,
        joining: bool,
    ) -> Vec<impl std::future::Future<Output = ()> + Send + 'static> {
        let caller = self.core.caller();
        let me = self.core.id.clone();
        self.core
            .membership
            .presence_targets()
            .into_iter()
            .map(|peer| {
                let caller = caller.clone();
                let ctx = ctx.clone();
                let rpc = Rpc::Presence(Announce {
                    peer: me.clone(),
                    joining,
                });
                async move {
                    if let Err(err) = caller.call(&ctx, &peer, rpc).await {
                        tracing::debug!(peer = %peer, error = %err, "presence not delivered");
                    }
                }
            })
            .collect()
    }

    async fn dispatch(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Rpc { ctx, request, reply } => {
                let result = self.handle(&ctx, request).await;
                // the caller may have given up already
                let _ = reply.send(result);
            }
            Inbound::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Inbound::Shutdown => {}
        }
    }

    /// Supervisor loop: one event at a time from the mailbox, the role's
    /// timer or the presence interval, draining queued proposals in between.
    ///
    /// Returns the node once a shutdown arrives or every handle is gone.
    async fn run(mut self, mut inbox: mpsc::Receiver<Inbound>) -> Self {
        let mut presence = tokio::time::interval(self.core.config.presence());
        presence.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(node = %self.core.id, "node running");

        loop {
            let ctx = Context::new(self.core.id.clone());
            if let Err(err) = self.drain_work(&ctx).await {
                tracing::error!(node = %self.core.id, error = %err, "cannot propose queued work");
            }
            let deadline = self.role.deadline();
            let wake = deadline.unwrap_or_else(|| Instant::now() + self.core.config.presence());

            tokio::select! {
                inbound = inbox.recv() => match inbound {
                    Some(Inbound::Shutdown) | None => break,
                    Some(inbound) => self.dispatch(inbound).await,
                },
                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    if let Err(err) = self.on_timer(&ctx).await {
                        tracing::error!(node = %self.core.id, role = %self.role.kind(), error = %err, "timer handling failed");
                    }
                }
                _ = presence.tick() => {
                    self.announce(&ctx, true);
                    for peer in self.sweep() {
                        tracing::info!(node = %self.core.id, peer = %peer, "dropped silent peer");
                    }
                }
            }
        }

        let farewell = Context::new(self.core.id.clone());
        join_all(self.presence_calls(&farewell, false)).await;
        self.role.stop();
        tracing::info!(node = %self.core.id, "node stopped");
        self
    }
}

impl<L: Ledger + 'static, S: Lodge + 'static> Node<L, S> {
    /// Run the node on its own task.
    pub fn spawn(self) -> (NodeHandle, JoinHandle<Self>) {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let handle = NodeHandle {
            id: self.core.id.clone(),
            tx,
        };
        (handle, tokio::spawn(self.run(rx)))
    }
}

/// Cloneable address of a running node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: PeerId,
    tx: mpsc::Sender<Inbound>,
}

impl NodeHandle {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Deliver one request and wait for the node's answer.
    pub async fn call(&self, ctx: Context, request: Rpc) -> Result<RpcReply, RpcError> {
        let (reply, answer) = oneshot::channel();
        self.tx
            .send(Inbound::Rpc { ctx, request, reply })
            .await
            .map_err(|_| RpcError::Unreachable(self.id.clone()))?;
        answer
            .await
            .map_err(|_| RpcError::Unreachable(self.id.clone()))?
    }

    /// Propose a client command. `Ok(true)` once it is committed.
    pub async fn store(&self, command: Command) -> Result<bool, NodeError> {
        let ctx = Context::new(format!("client@{}", self.id));
        let request = Rpc::RequestStore(RequestStore { command });
        match self.call(ctx, request).await? {
            RpcReply::RequestStore(StoreReply::Stored { committed, .. }) => Ok(committed),
            RpcReply::RequestStore(StoreReply::NotLeader { leader_id }) => {
                Err(NodeError::NotLeader { leader_id })
            }
            RpcReply::RequestStore(StoreReply::Failed(err)) => Err(NodeError::Apply(err)),
            other => Err(RpcError::BadPayload(format!("unexpected store reply {:?}", other)).into()),
        }
    }

    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        let (reply, answer) = oneshot::channel();
        self.tx
            .send(Inbound::Status(reply))
            .await
            .map_err(|_| NodeError::Shutdown)?;
        answer.await.map_err(|_| NodeError::Shutdown)
    }

    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.tx
            .send(Inbound::Shutdown)
            .await
            .map_err(|_| NodeError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lodge::MemLodge;
    use crate::log::VecLedger;
    use async_trait::async_trait;

    /// Transport for a node that never talks to anyone.
    struct Silent;

    #[async_trait]
    impl Transport for Silent {
        async fn call(&self, _: &Context, peer: &PeerId, _: Rpc) -> Result<RpcReply, RpcError> {
            Err(RpcError::Unreachable(peer.clone()))
        }
    }

    fn follower(id: &str, members: &[&str]) -> Node<VecLedger, MemLodge> {
        Node::new(
            id,
            RaftConfig::default(),
            members.iter().map(|p| PeerRecord::voting(*p)).collect(),
            VecLedger::new(),
            MemLodge::new(),
            Arc::new(Silent),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn new_node_starts_as_follower() {
        let node = follower("a", &["a", "b", "c"]);
        assert_eq!(node.role(), RoleKind::Follower);
        assert_eq!(node.term(), 0);
        assert_eq!(node.core().voted_for(), None);
        assert!(node.deadline().is_some());
    }

    #[tokio::test]
    async fn term_and_vote_survive_in_the_ledger() {
        let mut ledger = VecLedger::new();
        ledger
            .save_hard_state(&HardState {
                current_term: 7,
                voted_for: Some("b".into()),
            })
            .unwrap();
        let node = Node::new(
            "a",
            RaftConfig::default(),
            vec![],
            ledger,
            MemLodge::new(),
            Arc::new(Silent),
        )
        .unwrap();

        assert_eq!(node.term(), 7);
        assert_eq!(node.core().voted_for().map(String::as_str), Some("b"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = RaftConfig {
            heartbeat_interval: 1_000,
            ..RaftConfig::default()
        };
        let result = Node::new("a", config, vec![], VecLedger::new(), MemLodge::new(), Arc::new(Silent));
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[tokio::test]
    async fn lone_node_elects_itself_and_joins_the_cohort() {
        let mut node = follower("solo", &[]);
        let ctx = Context::new("test");

        node.campaign(&ctx).await.unwrap();
        assert_eq!(node.role(), RoleKind::Leader);
        assert_eq!(node.term(), 1);

        // the barrier promoting ourselves commits on the first heartbeat
        node.on_timer(&ctx).await.unwrap();
        assert_eq!(node.commit_index(), 1);
        let core = node.core();
        assert!(core.in_cohort("solo"));
        assert!(core.in_quorum("solo"));
        assert_eq!((core.quorum_size(), core.cohort_size()), (1, 1));
        assert_eq!(core.last_applied(), LogPosition::new(1, 1));
    }

    /// Ledger whose hard-state writes fail once `broken` is set.
    #[derive(Default)]
    struct BrokenDisk {
        inner: VecLedger,
        broken: bool,
    }

    impl Ledger for BrokenDisk {
        fn len(&self) -> Index {
            self.inner.len()
        }

        fn get(&self, index: Index) -> Option<&LogEntry> {
            self.inner.get(index)
        }

        fn append(&mut self, entry: LogEntry) -> Result<(), LedgerError> {
            self.inner.append(entry)
        }

        fn replace(&mut self, start: Index, entries: Vec<LogEntry>) -> Result<(), LedgerError> {
            self.inner.replace(start, entries)
        }

        fn entries_from(&self, start: Index) -> Vec<LogEntry> {
            self.inner.entries_from(start)
        }

        fn save_hard_state(&mut self, state: &HardState) -> Result<(), LedgerError> {
            if self.broken {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            self.inner.save_hard_state(state)
        }

        fn load_hard_state(&self) -> Result<HardState, LedgerError> {
            self.inner.load_hard_state()
        }
    }

    fn on_broken_disk(id: &str, members: &[&str]) -> Node<BrokenDisk, MemLodge> {
        let mut node = Node::new(
            id,
            RaftConfig::default(),
            members.iter().map(|p| PeerRecord::voting(*p)).collect(),
            BrokenDisk::default(),
            MemLodge::new(),
            Arc::new(Silent),
        )
        .unwrap();
        node.core.ledger.broken = true;
        node
    }

    #[tokio::test]
    async fn failed_persist_leaves_term_and_vote_alone() {
        let mut node = on_broken_disk("a", &["a", "b", "c"]);
        let ctx = Context::new("test");

        assert!(matches!(node.campaign(&ctx).await, Err(NodeError::Ledger(_))));
        assert_eq!(node.term(), 0);
        assert_eq!(node.core().voted_for(), None);

        let request = RequestVote {
            term: 4,
            candidate_id: "b".into(),
            last_log: LogPosition::default(),
        };
        assert!(node.on_request_vote(&ctx, request).is_err());
        assert_eq!(node.term(), 0);
        assert_eq!(node.core().voted_for(), None);
    }

    #[tokio::test]
    async fn provisional_node_does_not_campaign_against_a_cohort() {
        let mut node = follower("x", &["a", "b", "c"]);

        node.campaign(&Context::new("test")).await.unwrap();

        assert_eq!(node.role(), RoleKind::Follower);
        assert_eq!(node.term(), 0);
    }

    #[tokio::test]
    async fn follower_refuses_client_commands() {
        let mut node = follower("a", &["a", "b", "c"]);
        let ctx = Context::new("test");

        let reply = node.on_request_store(&ctx, Command::Noop).await.unwrap();
        assert_eq!(reply, StoreReply::NotLeader { leader_id: None });
    }

    #[tokio::test]
    async fn status_lists_log_positions() {
        let mut node = follower("solo", &[]);
        let ctx = Context::new("test");
        node.campaign(&ctx).await.unwrap();

        let status = node.status();
        assert_eq!(status.role, RoleKind::Leader);
        assert_eq!(status.log, vec![LogPosition::new(1, 1)]);
        assert_eq!(status.leader_id.as_deref(), Some("solo"));
    }
}
