//! # local
//!
//! why: run a whole cluster inside one process, for tests and the simulator
//! relations: implements transport.rs on top of NodeHandle mailboxes from node.rs
//! what: LocalNetwork (hub with isolation), LocalTransport (one node's view of it)

use crate::error::RpcError;
use crate::message::{Context, Rpc, RpcReply};
use crate::node::NodeHandle;
use crate::transport::Transport;
use crate::PeerId;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Hub {
    nodes: HashMap<PeerId, NodeHandle>,
    isolated: HashSet<PeerId>,
}

/// Shared registry of running nodes.
///
/// An isolated node neither sends nor receives; calls crossing the cut
/// never complete, so the caller's rpc timeout decides.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport for the node called `local`.
    pub fn transport(&self, local: impl Into<PeerId>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            local: local.into(),
            network: self.clone(),
        })
    }

    pub fn register(&self, handle: NodeHandle) {
        tracing::debug!(peer = %handle.id(), "registered on local network");
        self.hub().nodes.insert(handle.id().clone(), handle);
    }

    pub fn unregister(&self, peer: &str) {
        self.hub().nodes.remove(peer);
    }

    pub fn handle(&self, peer: &str) -> Option<NodeHandle> {
        self.hub().nodes.get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.hub().nodes.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Cut `peer` off from everyone.
    pub fn isolate(&self, peer: &str) {
        tracing::info!(peer, "isolating");
        self.hub().isolated.insert(peer.to_string());
    }

    pub fn heal(&self, peer: &str) {
        tracing::info!(peer, "healing");
        self.hub().isolated.remove(peer);
    }

    pub fn is_isolated(&self, peer: &str) -> bool {
        self.hub().isolated.contains(peer)
    }
}

/// One node's endpoint on a [`LocalNetwork`].
pub struct LocalTransport {
    local: PeerId,
    network: LocalNetwork,
}

enum Route {
    Deliver(NodeHandle),
    Cut,
    Missing,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, ctx: &Context, peer: &PeerId, request: Rpc) -> Result<RpcReply, RpcError> {
        let route = {
            let hub = self.network.hub();
            if hub.isolated.contains(&self.local) || hub.isolated.contains(peer) {
                Route::Cut
            } else {
                match hub.nodes.get(peer) {
                    Some(handle) => Route::Deliver(handle.clone()),
                    None => Route::Missing,
                }
            }
        };
        match route {
            Route::Deliver(handle) => handle.call(ctx.relay(self.local.clone()), request).await,
            Route::Cut => std::future::pending().await,
            Route::Missing => Err(RpcError::Unreachable(peer.clone())),
        }
    }
}
