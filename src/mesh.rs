//! Fully-connected mesh overlay.
//!
//! Membership is transitive: whenever an approval completes in either
//! direction, the hook fetches the counterparty's neighbor list and
//! requests approval from every member we have not met yet. At steady
//! state every approved pair of nodes is mutually connected.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::addr::NodeAddress;
use crate::config::NodeConfig;
use crate::handle::{ResponseOutcome, ResponseResult, SendResult};
use crate::logger::{LogLevel, Logger, TracingLogger};
use crate::node::{parse_neighbor_list, Message, NetworkStats, NodeError, NodeRuntime};
use crate::overlay::{JoinOutcome, Overlay};
use crate::wire::FrameKind;

pub(crate) struct MeshOverlay {
    /// Every peer we have ever been approved with, so the update loop
    /// can re-knit the mesh after drops.
    known: Mutex<HashSet<NodeAddress>>,
}

impl MeshOverlay {
    pub(crate) fn new() -> Self {
        Self {
            known: Mutex::new(HashSet::new()),
        }
    }

    async fn remember(&self, peer: NodeAddress) {
        self.known.lock().await.insert(peer);
    }

    /// Fetch `peer`'s neighbor list and request approval from every
    /// member that is not us.
    async fn absorb_neighbors(&self, node: &Arc<NodeRuntime>, peer: NodeAddress) {
        let request = node.send_request(peer, FrameKind::Neighbors, String::new(), false);
        let (outcome, response) = request.completed().await;
        if outcome != ResponseOutcome::Success {
            node.log.debug(format_args!(
                "neighbor fetch from {peer} failed: {outcome:?}"
            ));
            return;
        }
        let Some(response) = response else { return };

        for addr in parse_neighbor_list(&response.payload) {
            if node.is_self(addr) {
                continue;
            }
            if node.get_approval(addr).await {
                self.remember(addr).await;
            }
        }
    }
}

#[async_trait]
impl Overlay for MeshOverlay {
    fn network_type(&self) -> &'static str {
        "mesh"
    }

    async fn join(&self, node: &Arc<NodeRuntime>, seeds: &[NodeAddress]) -> JoinOutcome {
        let mut admitted = false;
        for seed in seeds {
            if node.is_self(*seed) {
                continue;
            }
            if node.get_approval(*seed).await {
                self.remember(*seed).await;
                admitted = true;
            }
        }
        if admitted {
            JoinOutcome::ConnectionSuccessful
        } else {
            JoinOutcome::NewNetworkCreated
        }
    }

    async fn on_approval_granted(&self, node: &Arc<NodeRuntime>, peer: NodeAddress) {
        self.remember(peer).await;
        self.absorb_neighbors(node, peer).await;
    }

    async fn on_approval_request_granted(&self, node: &Arc<NodeRuntime>, peer: NodeAddress) {
        self.remember(peer).await;
        self.absorb_neighbors(node, peer).await;
    }

    async fn on_system_message(&self, _node: &Arc<NodeRuntime>, message: Message) {
        // The mesh overlay has no system traffic of its own.
        debug!(peer = %message.sender, "ignoring system message on mesh overlay");
    }

    async fn update_network(&self, node: &Arc<NodeRuntime>) {
        let mut targets: HashSet<NodeAddress> = node.initial_seeds().into_iter().collect();
        targets.extend(self.known.lock().await.iter().copied());

        for addr in targets {
            if node.is_self(addr) {
                continue;
            }
            if node.outbound.get_approved(addr).await.is_none() {
                node.log
                    .debug(format_args!("reconnecting to {addr}"));
                node.get_approval(addr).await;
            }
        }
    }
}

/// A node participating in a fully-connected mesh overlay.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use overnet::{LogLevel, MeshNode, TracingLogger};
///
/// # async fn run() -> Result<(), overnet::NodeError> {
/// let node = MeshNode::new(Arc::new(TracingLogger), LogLevel::Info);
/// node.on_message(|msg| println!("got {} from {}", msg.payload, msg.sender));
/// let outcome = node.connect(5001, &[]).await?;
/// println!("joined: {outcome:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MeshNode {
    runtime: Arc<NodeRuntime>,
}

impl MeshNode {
    /// Build a mesh node with default timing.
    pub fn new(logger: Arc<dyn Logger>, level: LogLevel) -> Self {
        Self::with_config(logger, level, NodeConfig::default())
    }

    /// Build a mesh node with explicit timing knobs.
    pub fn with_config(logger: Arc<dyn Logger>, level: LogLevel, config: NodeConfig) -> Self {
        let overlay = Arc::new(MeshOverlay::new());
        Self {
            runtime: NodeRuntime::new(logger, level, config, overlay),
        }
    }

    /// Build a mesh node that logs through `tracing`.
    pub fn with_tracing(level: LogLevel) -> Self {
        Self::new(Arc::new(TracingLogger), level)
    }

    /// Bind `listen_port` (0 picks an ephemeral port) and join the
    /// network through `seeds`. Binding failure is the only error.
    pub async fn connect(
        &self,
        listen_port: u16,
        seeds: &[NodeAddress],
    ) -> Result<JoinOutcome, NodeError> {
        NodeRuntime::connect(&self.runtime, listen_port, seeds).await
    }

    /// Leave the network and stop every background task.
    pub async fn disconnect(&self) {
        self.runtime.disconnect().await;
    }

    /// The address this node advertises to peers.
    pub fn local_address(&self) -> NodeAddress {
        self.runtime.local_address()
    }

    /// Currently approved neighbors.
    pub async fn neighbors(&self) -> Vec<NodeAddress> {
        self.runtime.neighbors().await
    }

    /// Ask `addr` for its approved neighbors. The response payload
    /// parses with [`parse_neighbor_list`].
    pub fn remote_neighbors(&self, addr: NodeAddress) -> ResponseResult {
        self.runtime
            .send_request(addr, FrameKind::Neighbors, String::new(), false)
    }

    /// Send a user payload with no reply expected.
    pub fn send_message(&self, dst: NodeAddress, payload: impl Into<String>) -> SendResult {
        self.runtime
            .send_frame(dst, FrameKind::User, payload.into(), true)
    }

    /// Send a user payload and correlate the peer's reply.
    pub fn send_message_await_response(
        &self,
        dst: NodeAddress,
        payload: impl Into<String>,
    ) -> ResponseResult {
        self.runtime
            .send_request(dst, FrameKind::User, payload.into(), true)
    }

    /// Reply to a received message, echoing its id.
    pub fn send_response(&self, message: &Message, payload: impl Into<String>) -> SendResult {
        self.runtime.send_reply(
            message.sender,
            FrameKind::User,
            message.message_id,
            payload.into(),
            true,
        )
    }

    /// Register the callback invoked for every received user message.
    /// Replaces any previously registered callback.
    pub fn on_message(&self, callback: impl Fn(Message) + Send + Sync + 'static) {
        self.runtime.register_callback(Arc::new(callback));
    }

    /// Diagnostic counters.
    pub async fn stats(&self) -> NetworkStats {
        self.runtime.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_declares_its_overlay_tag() {
        assert_eq!(MeshOverlay::new().network_type(), "mesh");
    }
}
