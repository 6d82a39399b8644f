//! # error
//!
//! why: give every failure in the node a typed home so callers can tell soft from hard
//! relations: returned by log.rs, lodge.rs, transport.rs, config.rs and node.rs
//! what: LedgerError, ApplyError, RpcError, ConfigError and the umbrella NodeError

use crate::{Index, PeerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of the ledger (in-memory or durable).
#[derive(Debug, Error)]
pub enum LedgerError {
    /// An entry was offered at the wrong position.
    #[error("entry index {got} is not contiguous, expected {expected}")]
    NonContiguous { expected: Index, got: Index },

    /// A replace started outside `1..=len+1`.
    #[error("replace start {start} is outside the ledger (len {len})")]
    OutOfRange { start: Index, len: Index },

    #[error("ledger io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger codec failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failures while executing a committed command.
///
/// Serializable so a leader can hand it back to the client that proposed
/// the entry.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyError {
    /// The payload could not be decoded into a known operation.
    #[error("malformed command: {0}")]
    Malformed(String),

    /// A membership change referenced a peer that is not in the table.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// Failures of a single outbound call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// No answer within the configured rpc timeout. Soft: retried next tick.
    #[error("rpc {mode} to {peer} timed out")]
    Timeout { peer: PeerId, mode: &'static str },

    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("unknown rpc mode [{0}]")]
    UnknownMode(String),

    #[error("bad rpc payload: {0}")]
    BadPayload(String),

    /// The remote side answered with an error of its own.
    #[error("remote failure: {0}")]
    Remote(String),
}

/// Rejected configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Everything a node operation can surface to its caller.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Store requests are only served by the leader.
    #[error("not the leader (leader is {leader_id:?})")]
    NotLeader { leader_id: Option<PeerId> },

    #[error("work queue is full ({capacity} items)")]
    QueueFull { capacity: usize },

    /// The node's supervisor loop has exited.
    #[error("node has shut down")]
    Shutdown,
}
