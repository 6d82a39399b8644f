//! # cohort-core
//!
//! why: implement a raft-style replicated-log consensus node with dynamic membership
//! relations: used by cohort-storage for the durable ledger, cohort-sim for the local cluster
//! what: ledger and lodge traits, membership, role state machine, node supervisor, transport

pub mod config;
pub mod error;
pub mod local;
pub mod lodge;
pub mod log;
pub mod membership;
pub mod message;
pub mod node;
pub mod role;
pub mod transport;
pub mod work;

/// Leadership epoch.
pub type Term = u64;

/// 1-based position in the ledger; 0 means "before the first entry".
pub type Index = u64;

/// Name a peer is addressed by on the transport.
pub type PeerId = String;

pub use config::RaftConfig;
pub use error::{ApplyError, ConfigError, LedgerError, NodeError, RpcError};
pub use local::{LocalNetwork, LocalTransport};
pub use lodge::{Lodge, MemLodge};
pub use log::{Command, HardState, Ledger, LogEntry, LogPosition, VecLedger};
pub use membership::{Membership, PeerRecord};
pub use message::{Context, Rpc, RpcMode, RpcReply, StoreReply};
pub use node::{Node, NodeHandle, NodeStatus};
pub use role::{RoleKind, Transition};
pub use transport::{Caller, Transport};
pub use work::{Work, WorkQueue};
