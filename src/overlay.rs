//! Overlay strategy seam.
//!
//! The node runtime is topology-agnostic: everything specific to mesh or
//! Chord behavior hangs off this trait. Hooks receive the runtime so they
//! can issue RPCs through the same send plane as user traffic; the
//! runtime guarantees that `on_approval_granted`,
//! `on_approval_request_granted`, and `update_network` run on tasks
//! disjoint from the dispatcher, so a hook may synchronously await a
//! round-trip without stalling frame delivery.

use std::sync::Arc;

use async_trait::async_trait;

use crate::addr::NodeAddress;
use crate::node::{Message, NodeRuntime};

/// How joining the network concluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// At least one seed admitted us.
    ConnectionSuccessful,
    /// No seed was reachable (or none matched our overlay type); this
    /// node now anchors a fresh network.
    NewNetworkCreated,
}

#[async_trait]
pub(crate) trait Overlay: Send + Sync + 'static {
    /// Tag exchanged during the approval handshake; admission requires
    /// both sides to declare the same tag.
    fn network_type(&self) -> &'static str;

    /// Called once from `connect`, after the listener and core tasks are
    /// up and before `join`. Overlays spawn their own tasks here.
    async fn on_start(&self, _node: &Arc<NodeRuntime>) {}

    /// Drive the admission path against the supplied seeds.
    async fn join(&self, node: &Arc<NodeRuntime>, seeds: &[NodeAddress]) -> JoinOutcome;

    /// We granted membership to `peer`.
    async fn on_approval_granted(&self, node: &Arc<NodeRuntime>, peer: NodeAddress);

    /// `peer` granted membership to us.
    async fn on_approval_request_granted(&self, node: &Arc<NodeRuntime>, peer: NodeAddress);

    /// A `System` frame arrived for the overlay.
    async fn on_system_message(&self, node: &Arc<NodeRuntime>, message: Message);

    /// Periodic maintenance; runs every `update_frequency`.
    async fn update_network(&self, node: &Arc<NodeRuntime>);
}
