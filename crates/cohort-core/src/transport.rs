//! # transport
//!
//! why: abstract the point-to-point rpc layer the node talks through
//! relations: implemented by local.rs (in-process) or a host network; used via Caller by role/
//! what: Transport trait, Caller (the single outbound call primitive with its timeout)

use crate::error::RpcError;
use crate::message::{Context, Rpc, RpcReply};
use crate::PeerId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Point-to-point async request/response to a named peer.
///
/// Implementations do not need their own deadline; [`Caller`] bounds every
/// call with the configured rpc timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, ctx: &Context, peer: &PeerId, request: Rpc) -> Result<RpcReply, RpcError>;
}

/// Cheap handle for issuing calls, cloned into each concurrent request.
#[derive(Clone)]
pub struct Caller {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl Caller {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// One call; expiry of the timeout is reported as `RpcError::Timeout`.
    pub async fn call(&self, ctx: &Context, peer: &PeerId, request: Rpc) -> Result<RpcReply, RpcError> {
        let mode = request.mode().as_str();
        match tokio::time::timeout(self.timeout, self.transport.call(ctx, peer, request)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                peer: peer.clone(),
                mode,
            }),
        }
    }
}
