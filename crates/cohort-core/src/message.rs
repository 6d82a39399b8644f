//! # message
//!
//! why: define every rpc a node sends or answers, and the context threaded through them
//! relations: built by role/ handlers, carried by transport.rs, dispatched by node.rs
//! what: RpcMode, request/reply structs, the Rpc/RpcReply envelopes, Context

use crate::error::{ApplyError, RpcError};
use crate::log::{Command, LogEntry, LogPosition};
use crate::{Index, PeerId, Term};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Wire name of an rpc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMode {
    AppendEntries,
    RequestVote,
    RequestStore,
    Presence,
}

impl RpcMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcMode::AppendEntries => "appent",
            RpcMode::RequestVote => "reqvot",
            RpcMode::RequestStore => "reqsto",
            RpcMode::Presence => "brdcst",
        }
    }
}

impl fmt::Display for RpcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RpcMode {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "appent" => Ok(RpcMode::AppendEntries),
            "reqvot" => Ok(RpcMode::RequestVote),
            "reqsto" => Ok(RpcMode::RequestStore),
            "brdcst" => Ok(RpcMode::Presence),
            other => Err(RpcError::UnknownMode(other.to_string())),
        }
    }
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: PeerId,
    pub prev_log: LogPosition,
    pub entries: Vec<LogEntry>,
    pub leader_commit: Index,
}

/// Response to AppendEntries
///
/// On a failed consistency check `conflict` carries the receiver's
/// `(term, index)` so the leader can back off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    pub conflict: Option<LogPosition>,
}

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: PeerId,
    pub last_log: LogPosition,
}

/// Response to a vote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReply {
    pub term: Term,
    pub granted: bool,
}

/// Client request to append a command to the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStore {
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreReply {
    /// The entry was appended at `index`; `committed` tells whether a
    /// majority acknowledged it within the replication cycle.
    Stored { index: Index, committed: bool },
    NotLeader { leader_id: Option<PeerId> },
    /// Applying the committed entry failed.
    Failed(ApplyError),
}

/// Presence announcement: a peer joining or leaving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub peer: PeerId,
    pub joining: bool,
}

/// Every request a node answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rpc {
    AppendEntries(AppendEntries),
    RequestVote(RequestVote),
    RequestStore(RequestStore),
    Presence(Announce),
}

/// Every answer a node gives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReply {
    AppendEntries(AppendEntriesReply),
    RequestVote(VoteReply),
    RequestStore(StoreReply),
    Ack,
}

impl Rpc {
    pub fn mode(&self) -> RpcMode {
        match self {
            Rpc::AppendEntries(_) => RpcMode::AppendEntries,
            Rpc::RequestVote(_) => RpcMode::RequestVote,
            Rpc::RequestStore(_) => RpcMode::RequestStore,
            Rpc::Presence(_) => RpcMode::Presence,
        }
    }

    /// Split into the `(mode, data)` pair an external transport carries.
    pub fn into_parts(self) -> Result<(RpcMode, serde_json::Value), RpcError> {
        let mode = self.mode();
        let data = match self {
            Rpc::AppendEntries(req) => serde_json::to_value(req),
            Rpc::RequestVote(req) => serde_json::to_value(req),
            Rpc::RequestStore(req) => serde_json::to_value(req),
            Rpc::Presence(req) => serde_json::to_value(req),
        }
        .map_err(|e| RpcError::BadPayload(e.to_string()))?;
        Ok((mode, data))
    }

    /// Rebuild a request from its wire form, rejecting unknown modes.
    pub fn from_parts(mode: &str, data: serde_json::Value) -> Result<Self, RpcError> {
        let bad = |e: serde_json::Error| RpcError::BadPayload(e.to_string());
        Ok(match mode.parse::<RpcMode>()? {
            RpcMode::AppendEntries => Rpc::AppendEntries(serde_json::from_value(data).map_err(bad)?),
            RpcMode::RequestVote => Rpc::RequestVote(serde_json::from_value(data).map_err(bad)?),
            RpcMode::RequestStore => Rpc::RequestStore(serde_json::from_value(data).map_err(bad)?),
            RpcMode::Presence => Rpc::Presence(serde_json::from_value(data).map_err(bad)?),
        })
    }
}

/// Explicit per-request context, passed into every handler.
///
/// Replaces ambient tracing state: each handler opens its own span from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub trace_id: u64,
    pub origin: PeerId,
}

impl Context {
    /// Fresh trace started by `origin`.
    pub fn new(origin: impl Into<PeerId>) -> Self {
        Self {
            trace_id: rand::random(),
            origin: origin.into(),
        }
    }

    /// Same trace, forwarded by another node.
    pub fn relay(&self, origin: impl Into<PeerId>) -> Self {
        Self {
            trace_id: self.trace_id,
            origin: origin.into(),
        }
    }

    pub fn span(&self, op: &'static str) -> tracing::Span {
        tracing::debug_span!(
            "rpc",
            op,
            trace = self.trace_id,
            origin = %self.origin
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_round_trip_their_wire_names() {
        for mode in [
            RpcMode::AppendEntries,
            RpcMode::RequestVote,
            RpcMode::RequestStore,
            RpcMode::Presence,
        ] {
            assert_eq!(mode.as_str().parse::<RpcMode>().unwrap(), mode);
        }
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = Rpc::from_parts("gossip", serde_json::json!({})).unwrap_err();
        assert_eq!(err, RpcError::UnknownMode("gossip".into()));
    }

    #[test]
    fn parts_rebuild_vote_request() {
        let rpc = Rpc::RequestVote(RequestVote {
            term: 4,
            candidate_id: "b".into(),
            last_log: LogPosition::new(3, 7),
        });
        let (mode, data) = rpc.clone().into_parts().unwrap();

        assert_eq!(mode.as_str(), "reqvot");
        assert_eq!(Rpc::from_parts(mode.as_str(), data).unwrap(), rpc);
    }

    #[test]
    fn bad_payload_for_known_mode() {
        let err = Rpc::from_parts("appent", serde_json::json!({"term": "x"})).unwrap_err();
        assert!(matches!(err, RpcError::BadPayload(_)));
    }

    #[test]
    fn relay_keeps_trace_id() {
        let ctx = Context::new("a");
        let relayed = ctx.relay("b");
        assert_eq!(relayed.trace_id, ctx.trace_id);
        assert_eq!(relayed.origin, "b");
    }
}
