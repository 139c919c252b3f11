//! Chord-style ring overlay.
//!
//! Each node draws a random 31-bit identifier and maintains a successor,
//! a predecessor, and a 31-entry finger table where entry `i` points at
//! the node responsible for `(id + 2^i) mod 2^31`. Lookups resolve in
//! O(log N) hops by repeatedly asking the closest preceding finger, and
//! the ring is kept converged by the classic stabilize / notify /
//! fix_fingers cycle driven from the periodic update task.
//!
//! Ring maintenance RPCs ride the ordinary `System` message plane:
//!
//! | request                | response                      |
//! |------------------------|-------------------------------|
//! | `successor`            | `ip:port` or empty            |
//! | `predecessor`          | `ip:port` or empty            |
//! | `id`                   | decimal identifier            |
//! | `findsuccessor|<id>`   | `ip:port|id` or empty         |
//! | `notify` (no response) | —                             |
//!
//! An empty `findsuccessor` response means the callee has no successor
//! yet; the caller then treats the callee itself as the successor.
//!
//! Incoming `findsuccessor` and `notify` work runs on a dedicated task:
//! both issue further RPCs, and RPCs only complete while the dispatcher
//! is free to deliver responses.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace};

use crate::addr::NodeAddress;
use crate::config::NodeConfig;
use crate::handle::{
    ResponseOutcome, ResponseResult, SendOutcome, SendResult,
};
use crate::logger::{LogLevel, Logger, TracingLogger};
use crate::node::{Message, NetworkStats, NodeError, NodeRuntime};
use crate::overlay::{JoinOutcome, Overlay};
use crate::wire::FrameKind;

/// Identifier space is 31 bits; one finger per bit.
pub(crate) const FINGER_COUNT: usize = 31;
const ID_MODULUS: u64 = 1 << 31;

/// A ring member: its address and identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingPeer {
    pub addr: NodeAddress,
    pub id: u32,
}

impl RingPeer {
    fn to_payload(self) -> String {
        format!("{}|{}", self.addr, self.id)
    }

    fn from_payload(payload: &str) -> Option<Self> {
        let (addr, id) = payload.split_once('|')?;
        Some(Self {
            addr: NodeAddress::parse_literal(addr)?,
            id: id.parse().ok()?,
        })
    }
}

/// Modular interval test over the 31-bit identifier circle: is `x`
/// strictly inside `(min, max)`? An unset bound makes the interval
/// unbounded and everything passes.
pub(crate) fn between(min: Option<u32>, max: Option<u32>, x: u32) -> bool {
    let (Some(min), Some(max)) = (min, max) else {
        return true;
    };
    if min < max {
        min < x && x < max
    } else {
        // Wrapped interval, e.g. (2^31 - 5, 3).
        x > min || x < max
    }
}

#[derive(Debug, Default)]
struct RingState {
    successor: Option<RingPeer>,
    predecessor: Option<RingPeer>,
}

/// Work items served by the chord system task.
#[derive(Debug)]
enum SystemJob {
    FindSuccessor {
        target: u32,
        reply_to: NodeAddress,
        message_id: u64,
    },
    Notify {
        peer: NodeAddress,
    },
}

/// Shared chord state plus the ring algorithms. Split out of the
/// overlay so the system task and the public `ChordNode` can both hold
/// it.
pub(crate) struct ChordCore {
    id: u32,
    ring: Mutex<RingState>,
    fingers: Mutex<[Option<RingPeer>; FINGER_COUNT]>,
    jobs_tx: mpsc::UnboundedSender<SystemJob>,
}

impl ChordCore {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) async fn successor(&self) -> Option<RingPeer> {
        self.ring.lock().await.successor
    }

    pub(crate) async fn predecessor(&self) -> Option<RingPeer> {
        self.ring.lock().await.predecessor
    }

    pub(crate) async fn fingers(&self) -> Vec<Option<RingPeer>> {
        self.fingers.lock().await.to_vec()
    }

    fn self_peer(&self, node: &NodeRuntime) -> RingPeer {
        RingPeer {
            addr: node.local_address(),
            id: self.id,
        }
    }

    /// Ask `addr` for its identifier.
    async fn remote_id(&self, node: &Arc<NodeRuntime>, addr: NodeAddress) -> Option<u32> {
        let request = node.send_request(addr, FrameKind::System, "id".to_string(), false);
        let (outcome, response) = request.completed().await;
        if outcome != ResponseOutcome::Success {
            return None;
        }
        response?.payload.parse().ok()
    }

    /// Highest finger whose id lies strictly between us and `target`.
    async fn closest_preceding_finger(&self, target: u32) -> Option<RingPeer> {
        let fingers = self.fingers.lock().await;
        fingers
            .iter()
            .rev()
            .flatten()
            .find(|peer| between(Some(self.id), Some(target), peer.id))
            .copied()
    }

    /// Resolve the node responsible for `target`.
    ///
    /// `None` means the lookup failed this cycle (a hop was
    /// unreachable); callers leave their state unchanged and retry
    /// later.
    pub(crate) async fn find_successor(
        &self,
        node: &Arc<NodeRuntime>,
        target: u32,
    ) -> Option<RingPeer> {
        let successor = self.successor().await;
        let Some(succ) = successor else {
            // No ring yet: this node is responsible for everything.
            return Some(self.self_peer(node));
        };

        if target == succ.id || between(Some(self.id), Some(succ.id), target) {
            return Some(succ);
        }

        let next_hop = self.closest_preceding_finger(target).await.unwrap_or(succ);
        let request = node.send_request(
            next_hop.addr,
            FrameKind::System,
            format!("findsuccessor|{target}"),
            false,
        );
        let (outcome, response) = request.completed().await;
        if outcome != ResponseOutcome::Success {
            trace!(target, hop = %next_hop.addr, "findsuccessor hop failed");
            return None;
        }
        let payload = response?.payload;
        if payload.is_empty() {
            // The callee has no successor yet; it is the successor.
            return Some(next_hop);
        }
        RingPeer::from_payload(&payload)
    }

    /// Correct our successor pointer using the successor's predecessor,
    /// then offer ourselves to the successor via `notify`.
    async fn stabilize(&self, node: &Arc<NodeRuntime>) {
        let (successor, predecessor) = {
            let ring = self.ring.lock().await;
            (ring.successor, ring.predecessor)
        };

        let succ = match successor {
            Some(succ) => succ,
            None => {
                // Young ring: a predecessor already learned about us
                // through notify, so closing the circle through it is
                // always order-preserving.
                if let Some(pred) = predecessor {
                    if !node.is_self(pred.addr) {
                        self.ring.lock().await.successor = Some(pred);
                        node.send_frame(
                            pred.addr,
                            FrameKind::System,
                            "notify".to_string(),
                            false,
                        );
                    }
                }
                return;
            }
        };

        let request =
            node.send_request(succ.addr, FrameKind::System, "predecessor".to_string(), false);
        let (outcome, response) = request.completed().await;
        if outcome == ResponseOutcome::Success {
            if let Some(response) = response {
                if let Some(candidate) = NodeAddress::parse_literal(&response.payload) {
                    if !node.is_self(candidate) && candidate != succ.addr {
                        if let Some(candidate_id) = self.remote_id(node, candidate).await {
                            if between(Some(self.id), Some(succ.id), candidate_id) {
                                self.ring.lock().await.successor = Some(RingPeer {
                                    addr: candidate,
                                    id: candidate_id,
                                });
                                debug!(successor = %candidate, id = candidate_id, "successor updated");
                            }
                        }
                    }
                }
            }
        }

        if let Some(current) = self.successor().await {
            node.send_frame(current.addr, FrameKind::System, "notify".to_string(), false);
        }
    }

    /// A peer offered itself as our predecessor.
    async fn handle_notify(&self, node: &Arc<NodeRuntime>, peer: NodeAddress) {
        let Some(peer_id) = self.remote_id(node, peer).await else {
            return;
        };
        let mut ring = self.ring.lock().await;
        let adopt = match ring.predecessor {
            None => true,
            Some(pred) => between(Some(pred.id), Some(self.id), peer_id),
        };
        if adopt {
            ring.predecessor = Some(RingPeer { addr: peer, id: peer_id });
            debug!(predecessor = %peer, id = peer_id, "predecessor updated");
        }
    }

    /// Refresh every finger table entry; failed lookups keep the old
    /// entry for this cycle.
    async fn fix_fingers(&self, node: &Arc<NodeRuntime>) {
        for i in 0..FINGER_COUNT {
            let target = ((u64::from(self.id) + (1u64 << i)) % ID_MODULUS) as u32;
            if let Some(peer) = self.find_successor(node, target).await {
                self.fingers.lock().await[i] = Some(peer);
            }
        }
    }
}

pub(crate) struct ChordOverlay {
    core: Arc<ChordCore>,
    jobs_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SystemJob>>>,
}

impl ChordOverlay {
    pub(crate) fn with_identifier(id: u32) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        Self {
            core: Arc::new(ChordCore {
                id: id % (ID_MODULUS as u32),
                ring: Mutex::new(RingState::default()),
                fingers: Mutex::new([None; FINGER_COUNT]),
                jobs_tx,
            }),
            jobs_rx: std::sync::Mutex::new(Some(jobs_rx)),
        }
    }

    pub(crate) fn new() -> Self {
        // Positive 31-bit identifier, stable for the node's lifetime.
        Self::with_identifier(rand::thread_rng().gen_range(1..ID_MODULUS as u32))
    }

    pub(crate) fn core(&self) -> Arc<ChordCore> {
        self.core.clone()
    }
}

#[async_trait]
impl Overlay for ChordOverlay {
    fn network_type(&self) -> &'static str {
        "chord"
    }

    async fn on_start(&self, node: &Arc<NodeRuntime>) {
        let rx = self
            .jobs_rx
            .lock()
            .expect("jobs rx lock poisoned")
            .take()
            .expect("chord overlay started twice");
        tokio::spawn(system_job_loop(
            node.clone(),
            self.core.clone(),
            node.shutdown_signal(),
            rx,
        ));
    }

    async fn join(&self, node: &Arc<NodeRuntime>, seeds: &[NodeAddress]) -> JoinOutcome {
        for seed in seeds {
            let seed = *seed;
            if node.is_self(seed) {
                continue;
            }
            if !node.get_approval(seed).await {
                continue;
            }

            // Admitted; now locate our place on the ring.
            let request = node.send_request(
                seed,
                FrameKind::System,
                format!("findsuccessor|{}", self.core.id),
                false,
            );
            let (outcome, response) = request.completed().await;
            if outcome == ResponseOutcome::Success {
                if let Some(response) = response {
                    if response.payload.is_empty() {
                        // The seed is alone; it becomes our successor
                        // once we know its identifier.
                        if let Some(seed_id) = self.core.remote_id(node, seed).await {
                            self.core.ring.lock().await.successor =
                                Some(RingPeer { addr: seed, id: seed_id });
                        }
                    } else if let Some(peer) = RingPeer::from_payload(&response.payload) {
                        self.core.ring.lock().await.successor = Some(peer);
                    }
                }
            }
            node.log.info(format_args!(
                "joined ring through {seed} (successor: {:?})",
                self.core.successor().await
            ));
            return JoinOutcome::ConnectionSuccessful;
        }
        JoinOutcome::NewNetworkCreated
    }

    async fn on_approval_granted(&self, _node: &Arc<NodeRuntime>, peer: NodeAddress) {
        // Ring membership is driven by the joiner; nothing to do on the
        // grantor side.
        trace!(peer = %peer, "admitted peer to the ring");
    }

    async fn on_approval_request_granted(&self, _node: &Arc<NodeRuntime>, peer: NodeAddress) {
        trace!(peer = %peer, "admitted to the ring");
    }

    async fn on_system_message(&self, node: &Arc<NodeRuntime>, message: Message) {
        let payload = message.payload.as_str();
        if message.awaiting_response {
            match payload {
                "successor" => {
                    let reply = match self.core.successor().await {
                        Some(peer) => peer.addr.to_string(),
                        None => String::new(),
                    };
                    node.send_reply(
                        message.sender,
                        FrameKind::System,
                        message.message_id,
                        reply,
                        false,
                    );
                }
                "predecessor" => {
                    let reply = match self.core.predecessor().await {
                        Some(peer) => peer.addr.to_string(),
                        None => String::new(),
                    };
                    node.send_reply(
                        message.sender,
                        FrameKind::System,
                        message.message_id,
                        reply,
                        false,
                    );
                }
                "id" => {
                    node.send_reply(
                        message.sender,
                        FrameKind::System,
                        message.message_id,
                        self.core.id.to_string(),
                        false,
                    );
                }
                _ => {
                    if let Some(raw) = payload.strip_prefix("findsuccessor|") {
                        if let Ok(target) = raw.parse::<u32>() {
                            let _ = self.core.jobs_tx.send(SystemJob::FindSuccessor {
                                target,
                                reply_to: message.sender,
                                message_id: message.message_id,
                            });
                            return;
                        }
                    }
                    // Unknown request: answer with the empty payload so
                    // the remote waiter is not left hanging.
                    debug!(peer = %message.sender, payload, "unknown system request");
                    node.send_reply(
                        message.sender,
                        FrameKind::System,
                        message.message_id,
                        String::new(),
                        false,
                    );
                }
            }
        } else if payload == "notify" {
            let _ = self.core.jobs_tx.send(SystemJob::Notify {
                peer: message.sender,
            });
        } else {
            debug!(peer = %message.sender, payload, "unknown system message");
        }
    }

    async fn update_network(&self, node: &Arc<NodeRuntime>) {
        self.core.stabilize(node).await;
        self.core.fix_fingers(node).await;
    }
}

/// Serves `findsuccessor` requests and `notify` offers on a task of
/// their own: both block on further RPCs and must never run where they
/// would stall frame dispatch.
async fn system_job_loop(
    node: Arc<NodeRuntime>,
    core: Arc<ChordCore>,
    mut stop: watch::Receiver<bool>,
    mut rx: mpsc::UnboundedReceiver<SystemJob>,
) {
    let stopped = async move {
        while !*stop.borrow() {
            if stop.changed().await.is_err() {
                break;
            }
        }
    };
    tokio::pin!(stopped);

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            job = rx.recv() => match job {
                Some(SystemJob::FindSuccessor { target, reply_to, message_id }) => {
                    let reply = if core.successor().await.is_none() {
                        // No successor yet: empty reply, the caller
                        // adopts us directly.
                        String::new()
                    } else {
                        match core.find_successor(&node, target).await {
                            Some(peer) => peer.to_payload(),
                            None => String::new(),
                        }
                    };
                    node.send_reply(reply_to, FrameKind::System, message_id, reply, false);
                }
                Some(SystemJob::Notify { peer }) => {
                    core.handle_notify(&node, peer).await;
                }
                None => break,
            },
        }
    }
}

/// A node participating in a Chord ring overlay.
///
/// Beyond the messaging surface shared with [`crate::MeshNode`], a chord
/// node exposes its ring state (identifier, successor, predecessor,
/// finger table) and key-addressed messaging: [`ChordNode::send_chord_message`]
/// routes a payload to whichever node owns the key.
#[derive(Clone)]
pub struct ChordNode {
    runtime: Arc<NodeRuntime>,
    core: Arc<ChordCore>,
}

impl ChordNode {
    /// Build a chord node with a random identifier and default timing.
    pub fn new(logger: Arc<dyn Logger>, level: LogLevel) -> Self {
        Self::with_config(logger, level, NodeConfig::default())
    }

    /// Build a chord node with explicit timing knobs.
    pub fn with_config(logger: Arc<dyn Logger>, level: LogLevel, config: NodeConfig) -> Self {
        Self::assemble(logger, level, config, ChordOverlay::new())
    }

    /// Build a chord node with a fixed identifier. Useful for tests and
    /// for deployments that derive identifiers externally.
    pub fn with_identifier(
        logger: Arc<dyn Logger>,
        level: LogLevel,
        config: NodeConfig,
        id: u32,
    ) -> Self {
        Self::assemble(logger, level, config, ChordOverlay::with_identifier(id))
    }

    /// Build a chord node that logs through `tracing`.
    pub fn with_tracing(level: LogLevel) -> Self {
        Self::new(Arc::new(TracingLogger), level)
    }

    fn assemble(
        logger: Arc<dyn Logger>,
        level: LogLevel,
        config: NodeConfig,
        overlay: ChordOverlay,
    ) -> Self {
        let core = overlay.core();
        Self {
            runtime: NodeRuntime::new(logger, level, config, Arc::new(overlay)),
            core,
        }
    }

    /// Bind `listen_port` (0 picks an ephemeral port) and join the ring
    /// through `seeds`. Binding failure is the only error.
    pub async fn connect(
        &self,
        listen_port: u16,
        seeds: &[NodeAddress],
    ) -> Result<JoinOutcome, NodeError> {
        NodeRuntime::connect(&self.runtime, listen_port, seeds).await
    }

    /// Leave the ring and stop every background task.
    pub async fn disconnect(&self) {
        self.runtime.disconnect().await;
    }

    /// This node's 31-bit ring identifier.
    pub fn id(&self) -> u32 {
        self.core.id()
    }

    /// The address this node advertises to peers.
    pub fn local_address(&self) -> NodeAddress {
        self.runtime.local_address()
    }

    /// Current successor on the ring, if one is known.
    pub async fn successor(&self) -> Option<NodeAddress> {
        self.core.successor().await.map(|peer| peer.addr)
    }

    /// Current predecessor on the ring, if one is known.
    pub async fn predecessor(&self) -> Option<NodeAddress> {
        self.core.predecessor().await.map(|peer| peer.addr)
    }

    /// Snapshot of the finger table; entry `i` is the node responsible
    /// for `(id + 2^i) mod 2^31`.
    pub async fn fingers(&self) -> Vec<Option<RingPeer>> {
        self.core.fingers().await
    }

    /// Resolve the ring member responsible for `key`. `None` means a
    /// lookup hop was unreachable this attempt.
    pub async fn lookup(&self, key: u32) -> Option<RingPeer> {
        self.core
            .find_successor(&self.runtime, key % (ID_MODULUS as u32))
            .await
    }

    /// Currently approved neighbors.
    pub async fn neighbors(&self) -> Vec<NodeAddress> {
        self.runtime.neighbors().await
    }

    /// Ask `addr` for its approved neighbors.
    pub fn remote_neighbors(&self, addr: NodeAddress) -> ResponseResult {
        self.runtime
            .send_request(addr, FrameKind::Neighbors, String::new(), false)
    }

    /// Send a user payload to a specific node, no reply expected.
    ///
    /// Ring traffic is not approval-gated: any reachable ring member is
    /// a valid destination, matching how key-routed messages travel.
    pub fn send_message(&self, dst: NodeAddress, payload: impl Into<String>) -> SendResult {
        self.runtime
            .send_frame(dst, FrameKind::User, payload.into(), false)
    }

    /// Send a user payload to a specific node and correlate the reply.
    pub fn send_message_await_response(
        &self,
        dst: NodeAddress,
        payload: impl Into<String>,
    ) -> ResponseResult {
        self.runtime
            .send_request(dst, FrameKind::User, payload.into(), false)
    }

    /// Reply to a received message, echoing its id.
    pub fn send_response(&self, message: &Message, payload: impl Into<String>) -> SendResult {
        self.runtime.send_reply(
            message.sender,
            FrameKind::User,
            message.message_id,
            payload.into(),
            false,
        )
    }

    /// Route a user payload to the node that owns `key`.
    ///
    /// Fails with [`SendOutcome::SelfFailure`] when the lookup resolves
    /// to this node, and with [`SendOutcome::ConnectionFailure`] when
    /// the lookup itself fails.
    pub async fn send_chord_message(&self, key: u32, payload: impl Into<String>) -> SendResult {
        match self.resolve_owner(key).await {
            Owner::Unreachable => SendResult::already_completed(SendOutcome::ConnectionFailure),
            Owner::Myself => SendResult::already_completed(SendOutcome::SelfFailure),
            Owner::Peer(addr) => {
                self.runtime
                    .send_frame(addr, FrameKind::User, payload.into(), false)
            }
        }
    }

    /// Route a user payload to the node that owns `key` and correlate
    /// the reply.
    pub async fn send_chord_message_await_response(
        &self,
        key: u32,
        payload: impl Into<String>,
    ) -> ResponseResult {
        match self.resolve_owner(key).await {
            Owner::Unreachable => ResponseResult::already_failed(SendOutcome::ConnectionFailure),
            Owner::Myself => ResponseResult::already_failed(SendOutcome::SelfFailure),
            Owner::Peer(addr) => {
                self.runtime
                    .send_request(addr, FrameKind::User, payload.into(), false)
            }
        }
    }

    async fn resolve_owner(&self, key: u32) -> Owner {
        let key = key % (ID_MODULUS as u32);
        match self.core.find_successor(&self.runtime, key).await {
            None => Owner::Unreachable,
            Some(owner) if self.runtime.is_self(owner.addr) || owner.id == self.core.id() => {
                Owner::Myself
            }
            Some(owner) => Owner::Peer(owner.addr),
        }
    }

    /// Register the callback invoked for every received user message.
    pub fn on_message(&self, callback: impl Fn(Message) + Send + Sync + 'static) {
        self.runtime.register_callback(Arc::new(callback));
    }

    /// Diagnostic counters.
    pub async fn stats(&self) -> NetworkStats {
        self.runtime.stats().await
    }
}

enum Owner {
    Myself,
    Peer(NodeAddress),
    Unreachable,
}
