//! The node runtime: listener, framed readers, dispatcher, send plane,
//! and the periodic liveness/maintenance tasks.
//!
//! Task layout per connected node:
//!
//! ```text
//!  accept ──► reader (one per inbound conn) ──► dispatcher ──┬─► pending waiters
//!                                                            ├─► approval queue ──► approval task ──► overlay hooks
//!                                                            ├─► overlay system handler
//!                                                            └─► user events task ──► on_message callback
//!  user / overlay ──► send queue ──► sender task ──► writer task (per request)
//!  ping task  (every ping_frequency)
//!  update task (every update_frequency) ──► overlay.update_network
//! ```
//!
//! The dispatcher is single-threaded so frames from one peer are handled
//! in arrival order. Approval hooks and overlay maintenance run on their
//! own tasks because they issue RPCs that need the dispatcher alive to
//! complete; running them inline would deadlock the node on itself.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};

use crate::addr::{self, NodeAddress};
use crate::config::NodeConfig;
use crate::handle::{
    response_handle, send_handle, ResponseCompleter, ResponseOutcome, ResponseResult,
    SendCompleter, SendOutcome, SendResult,
};
use crate::logger::{LogLevel, Logger, NodeLogger};
use crate::overlay::{JoinOutcome, Overlay};
use crate::peers::{InboundPeer, InboundTable, OutboundTable};
use crate::pending::PendingResponses;
use crate::wire::{decode_frame, encode_frame, Frame, FrameKind};

/// Approval handshake payload sent back when admission succeeds.
const APPROVAL_GRANTED: &str = "approved";
/// Approval handshake payload sent back when admission is refused.
const APPROVAL_REFUSED: &str = "failure";

/// Fatal node errors. Everything else in the library degrades to a
/// failed handle or a retried maintenance cycle.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("node is already connected")]
    AlreadyConnected,
}

/// A received frame as surfaced to the application and the overlays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Who sent it: the IP observed on the stream paired with the
    /// listening port the sender declared in the frame.
    pub sender: NodeAddress,
    pub payload: String,
    pub message_id: u64,
    /// The sender expects a reply carrying this message id.
    pub awaiting_response: bool,
    /// This message is itself a reply to one of our requests.
    pub in_response_to: bool,
}

/// Point-in-time counters for diagnostics.
#[derive(Clone, Copy, Debug, Default)]
pub struct NetworkStats {
    pub approved_neighbors: usize,
    pub outbound_connections: usize,
    pub inbound_connections: usize,
    pub pending_responses: usize,
    pub frames_sent: u64,
    pub frames_received: u64,
}

/// Parse a `Neighbors` response payload (`ip:port;ip:port;…;` or `;`).
pub fn parse_neighbor_list(payload: &str) -> Vec<NodeAddress> {
    payload
        .split(';')
        .filter(|entry| !entry.is_empty())
        .filter_map(NodeAddress::parse_literal)
        .collect()
}

pub(crate) fn format_neighbor_list(addrs: &[NodeAddress]) -> String {
    if addrs.is_empty() {
        return ";".to_string();
    }
    let mut out = String::new();
    for addr in addrs {
        out.push_str(&addr.to_string());
        out.push(';');
    }
    out
}

/// Which side of the handshake an approval event came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ApprovalRole {
    /// We admitted the peer.
    Grantor,
    /// The peer admitted us.
    Requester,
}

#[derive(Debug)]
struct ApprovalEvent {
    role: ApprovalRole,
    peer: NodeAddress,
}

/// How a queued send completes back to its caller.
enum SendCompletion {
    Plain(SendCompleter),
    AwaitResponse {
        completer: ResponseCompleter,
        rx: oneshot::Receiver<Message>,
    },
}

impl SendCompletion {
    fn fail(&self, outcome: SendOutcome) {
        match self {
            SendCompletion::Plain(completer) => completer.complete(outcome),
            SendCompletion::AwaitResponse { completer, .. } => completer.fail_send(outcome),
        }
    }
}

/// One queued outbound frame plus its completion plumbing.
struct SendRequest {
    dst: NodeAddress,
    frame: Frame,
    needs_approved: bool,
    completion: SendCompletion,
}

type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Shared state of one node. Public node types (`MeshNode`,
/// `ChordNode`) wrap this in an `Arc` and delegate.
pub(crate) struct NodeRuntime {
    pub(crate) log: NodeLogger,
    pub(crate) cfg: NodeConfig,
    overlay: Arc<dyn Overlay>,

    listen_port: AtomicU16,
    local_ips: Vec<Ipv4Addr>,

    pub(crate) outbound: OutboundTable,
    inbound: InboundTable,
    pub(crate) pending: PendingResponses,
    next_id: AtomicU64,

    send_tx: mpsc::UnboundedSender<SendRequest>,
    send_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SendRequest>>>,
    dispatch_tx: mpsc::UnboundedSender<(NodeAddress, Frame)>,
    dispatch_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<(NodeAddress, Frame)>>>,
    approval_tx: mpsc::UnboundedSender<ApprovalEvent>,
    approval_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ApprovalEvent>>>,
    user_tx: mpsc::UnboundedSender<Message>,
    user_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Message>>>,

    on_message: std::sync::Mutex<Option<MessageCallback>>,

    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Set once by `connect` and never cleared on success: the channel
    /// receivers are consumed by the tasks, so a runtime connects at
    /// most once in its lifetime.
    started: AtomicBool,
    connected: AtomicBool,
    seeds: std::sync::Mutex<Vec<NodeAddress>>,

    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

impl NodeRuntime {
    pub(crate) fn new(
        logger: Arc<dyn Logger>,
        level: LogLevel,
        cfg: NodeConfig,
        overlay: Arc<dyn Overlay>,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (approval_tx, approval_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            log: NodeLogger::new(logger, level),
            cfg,
            overlay,
            listen_port: AtomicU16::new(0),
            local_ips: addr::local_ipv4s(),
            outbound: OutboundTable::new(),
            inbound: InboundTable::new(),
            pending: PendingResponses::new(),
            next_id: AtomicU64::new(1),
            send_tx,
            send_rx: std::sync::Mutex::new(Some(send_rx)),
            dispatch_tx,
            dispatch_rx: std::sync::Mutex::new(Some(dispatch_rx)),
            approval_tx,
            approval_rx: std::sync::Mutex::new(Some(approval_rx)),
            user_tx,
            user_rx: std::sync::Mutex::new(Some(user_rx)),
            on_message: std::sync::Mutex::new(None),
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            seeds: std::sync::Mutex::new(Vec::new()),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
        })
    }

    pub(crate) fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Acquire)
    }

    /// The address this node advertises to peers.
    pub(crate) fn local_address(&self) -> NodeAddress {
        let ip = self
            .local_ips
            .iter()
            .copied()
            .find(|ip| !ip.is_loopback())
            .unwrap_or(Ipv4Addr::LOCALHOST);
        NodeAddress::new(ip, self.listen_port())
    }

    /// Destination is this node: the port matches our listener and the
    /// IP is one this host answers on.
    pub(crate) fn is_self(&self, dst: NodeAddress) -> bool {
        dst.port() == self.listen_port() && self.local_ips.contains(&dst.ip())
    }

    pub(crate) fn initial_seeds(&self) -> Vec<NodeAddress> {
        self.seeds.lock().expect("seeds lock poisoned").clone()
    }

    pub(crate) fn register_callback(&self, callback: MessageCallback) {
        *self.on_message.lock().expect("callback lock poisoned") = Some(callback);
    }

    pub(crate) async fn stats(&self) -> NetworkStats {
        NetworkStats {
            approved_neighbors: self.outbound.approved_addrs().await.len(),
            outbound_connections: self.outbound.len().await,
            inbound_connections: self.inbound.len().await,
            pending_responses: self.pending.len(),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
        }
    }

    pub(crate) async fn neighbors(&self) -> Vec<NodeAddress> {
        let mut addrs = self.outbound.approved_addrs().await;
        addrs.sort();
        addrs
    }

    fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// A receiver that observes the shutdown flag; overlay tasks use it
    /// to terminate alongside the core tasks.
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    // ── Send plane ──────────────────────────────────────────────────

    /// Queue a fire-and-forget frame.
    pub(crate) fn send_frame(
        &self,
        dst: NodeAddress,
        kind: FrameKind,
        payload: String,
        needs_approved: bool,
    ) -> SendResult {
        let frame = Frame {
            kind,
            message_id: 0,
            awaiting_response: false,
            sender_port: self.listen_port(),
            payload,
        };
        let (completer, handle) = send_handle();
        self.enqueue(SendRequest {
            dst,
            frame,
            needs_approved,
            completion: SendCompletion::Plain(completer),
        });
        handle
    }

    /// Queue a reply carrying the request's message id.
    pub(crate) fn send_reply(
        &self,
        dst: NodeAddress,
        kind: FrameKind,
        in_reply_to: u64,
        payload: String,
        needs_approved: bool,
    ) -> SendResult {
        let frame = Frame {
            kind,
            message_id: in_reply_to,
            awaiting_response: false,
            sender_port: self.listen_port(),
            payload,
        };
        let (completer, handle) = send_handle();
        self.enqueue(SendRequest {
            dst,
            frame,
            needs_approved,
            completion: SendCompletion::Plain(completer),
        });
        handle
    }

    /// Queue a request and register its response slot.
    pub(crate) fn send_request(
        &self,
        dst: NodeAddress,
        kind: FrameKind,
        payload: String,
        needs_approved: bool,
    ) -> ResponseResult {
        let message_id = self.next_message_id();
        let rx = self.pending.register(message_id, dst);
        let frame = Frame {
            kind,
            message_id,
            awaiting_response: true,
            sender_port: self.listen_port(),
            payload,
        };
        let (completer, handle) = response_handle();
        self.enqueue(SendRequest {
            dst,
            frame,
            needs_approved,
            completion: SendCompletion::AwaitResponse { completer, rx },
        });
        handle
    }

    fn enqueue(&self, request: SendRequest) {
        if let Err(rejected) = self.send_tx.send(request) {
            // The sender task is gone (disconnected node); complete the
            // handle so no caller hangs.
            let request = rejected.0;
            self.pending.remove(request.frame.message_id);
            request.completion.fail(SendOutcome::ConnectionFailure);
        }
    }

    /// Drop every trace of `addr` after a transport failure: the
    /// outbound entry, any inbound connection advertising the address,
    /// and all response waiters expecting a reply from it.
    pub(crate) async fn drop_peer(&self, addr: NodeAddress) {
        self.outbound.remove(addr).await;
        self.inbound.remove_advertised(addr).await;
        let failed = self.pending.fail_peer(addr);
        if failed > 0 {
            self.log.debug(format_args!(
                "dropped peer {addr}, failed {failed} pending response(s)"
            ));
        }
    }

    // ── Approval handshake ──────────────────────────────────────────

    /// Request admission from `addr`. Returns whether the peer approved
    /// us; on success the outbound connection is marked approved and the
    /// requester-side overlay hook is queued.
    pub(crate) async fn get_approval(&self, addr: NodeAddress) -> bool {
        if self.outbound.get_approved(addr).await.is_some() {
            return true;
        }
        if self.outbound.ensure(addr).await.is_none() {
            return false;
        }

        let request = self.send_request(
            addr,
            FrameKind::Approval,
            self.overlay.network_type().to_string(),
            false,
        );
        let (outcome, response) = request.completed().await;
        let granted = outcome == ResponseOutcome::Success
            && response.map(|m| m.payload == APPROVAL_GRANTED).unwrap_or(false);

        if granted {
            if let Some(conn) = self.outbound.get(addr).await {
                conn.set_approved();
            }
            self.log
                .info(format_args!("approval granted by {addr}"));
            let _ = self.approval_tx.send(ApprovalEvent {
                role: ApprovalRole::Requester,
                peer: addr,
            });
        } else {
            self.log
                .debug(format_args!("approval refused or unreachable: {addr}"));
        }
        granted
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Bind the listener, start every task, and drive the overlay join.
    pub(crate) async fn connect(
        this: &Arc<Self>,
        listen_port: u16,
        seeds: &[NodeAddress],
    ) -> Result<JoinOutcome, NodeError> {
        if this.started.swap(true, Ordering::AcqRel) {
            return Err(NodeError::AlreadyConnected);
        }

        let bound = TcpListener::bind((Ipv4Addr::UNSPECIFIED, listen_port))
            .await
            .and_then(|listener| {
                let port = listener.local_addr()?.port();
                Ok((listener, port))
            });
        let (listener, bound_port) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                // The only fatal condition in the library; leave the
                // runtime reusable for a retry on another port.
                this.started.store(false, Ordering::Release);
                this.log.error(format_args!(
                    "failed to bind listener on port {listen_port}: {source}"
                ));
                return Err(NodeError::Bind {
                    port: listen_port,
                    source,
                });
            }
        };
        // Honor an ephemeral bind: the port actually chosen is the one
        // peers must dial and the one stamped into every frame.
        this.listen_port.store(bound_port, Ordering::Release);
        this.connected.store(true, Ordering::Release);
        *this.seeds.lock().expect("seeds lock poisoned") = seeds.to_vec();

        this.log.info(format_args!(
            "node listening on port {bound_port} ({} overlay)",
            this.overlay.network_type()
        ));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(accept_loop(this.clone(), listener)));
        tasks.push(tokio::spawn(sender_loop(this.clone())));
        tasks.push(tokio::spawn(dispatch_loop(this.clone())));
        tasks.push(tokio::spawn(approval_loop(this.clone())));
        tasks.push(tokio::spawn(user_event_loop(this.clone())));
        tasks.push(tokio::spawn(ping_loop(this.clone())));
        tasks.push(tokio::spawn(update_loop(this.clone())));
        this.tasks
            .lock()
            .expect("tasks lock poisoned")
            .extend(tasks);

        this.overlay.on_start(this).await;
        let outcome = this.overlay.join(this, seeds).await;
        this.log.info(format_args!("join finished: {outcome:?}"));
        Ok(outcome)
    }

    /// Stop every task, close all connections, and fail all waiters.
    pub(crate) async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.log.info(format_args!("disconnecting"));
        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            tasks.drain(..).collect()
        };
        for mut handle in handles {
            if timeout(Duration::from_millis(500), &mut handle).await.is_err() {
                handle.abort();
            }
        }

        self.inbound.clear().await;
        self.outbound.clear().await;
        self.pending.fail_all();
    }

    // ── Dispatch ────────────────────────────────────────────────────

    async fn dispatch(this: &Arc<Self>, sender: NodeAddress, frame: Frame) {
        if frame.kind == FrameKind::Unknown {
            trace!(peer = %sender, "dropping frame with unknown kind");
            return;
        }

        let message = Message {
            sender,
            payload: frame.payload.clone(),
            message_id: frame.message_id,
            awaiting_response: frame.awaiting_response,
            in_response_to: frame.in_response_to(),
        };

        if frame.in_response_to() {
            // Responses unblock their waiter before any kind-specific
            // work so Neighbors/System/Approval replies reach the tasks
            // parked on them.
            let consumed = this.pending.complete(frame.message_id, message.clone());
            if !consumed && frame.kind == FrameKind::User {
                // A reply that outlived its waiter (e.g. after a
                // timeout) is still application data; surface it.
                this.deliver_user(message);
            } else if !consumed {
                trace!(
                    peer = %sender,
                    id = frame.message_id,
                    "response with no waiter dropped"
                );
            }
            return;
        }

        match frame.kind {
            FrameKind::Approval => Self::handle_approval_request(this, message).await,
            FrameKind::Neighbors => this.handle_neighbors_request(message).await,
            FrameKind::Ping => {
                if let Some(conn) = this.outbound.get_approved(sender).await {
                    conn.touch_ping();
                }
            }
            FrameKind::System => this.overlay.on_system_message(this, message).await,
            FrameKind::User => this.deliver_user(message),
            FrameKind::Unknown => {}
        }
    }

    async fn handle_approval_request(this: &Arc<Self>, message: Message) {
        if !message.awaiting_response {
            return;
        }
        let peer = message.sender;
        if message.payload == this.overlay.network_type() {
            // Matching overlay: dial back, admit, and let the overlay
            // react from the approval task.
            if let Some(conn) = this.outbound.ensure(peer).await {
                conn.set_approved();
                this.send_reply(
                    peer,
                    FrameKind::Approval,
                    message.message_id,
                    APPROVAL_GRANTED.to_string(),
                    false,
                );
                this.log.info(format_args!("approved new member {peer}"));
                let _ = this.approval_tx.send(ApprovalEvent {
                    role: ApprovalRole::Grantor,
                    peer,
                });
                return;
            }
            this.log.warning(format_args!(
                "could not dial back {peer} during approval"
            ));
        } else {
            this.log.debug(format_args!(
                "refusing {peer}: overlay `{}` != `{}`",
                message.payload,
                this.overlay.network_type()
            ));
        }
        this.send_reply(
            peer,
            FrameKind::Approval,
            message.message_id,
            APPROVAL_REFUSED.to_string(),
            false,
        );
    }

    async fn handle_neighbors_request(&self, message: Message) {
        if !message.awaiting_response {
            return;
        }
        let addrs = self.neighbors().await;
        self.send_reply(
            message.sender,
            FrameKind::Neighbors,
            message.message_id,
            format_neighbor_list(&addrs),
            false,
        );
    }

    fn deliver_user(&self, message: Message) {
        if self.user_tx.send(message).is_err() {
            debug!("user message dropped: node is shutting down");
        }
    }

    fn invoke_callback(&self, message: Message) {
        let callback = {
            let slot = self.on_message.lock().expect("callback lock poisoned");
            slot.clone()
        };
        match callback {
            Some(callback) => callback(message),
            None => trace!("user message dropped: no callback registered"),
        }
    }
}

// ── Tasks ───────────────────────────────────────────────────────────

/// Park until the shutdown flag flips.
async fn stopped(mut signal: watch::Receiver<bool>) {
    while !*signal.borrow() {
        if signal.changed().await.is_err() {
            break;
        }
    }
}

async fn accept_loop(node: Arc<NodeRuntime>, listener: TcpListener) {
    let stop = node.shutdown_signal();
    tokio::pin! { let stopped = stopped(stop); }
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, socket_addr)) => {
                    register_inbound(&node, stream, socket_addr).await;
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    node.log.warning(format_args!("accept failed: {err}"));
                }
            },
        }
    }
}

async fn register_inbound(node: &Arc<NodeRuntime>, stream: TcpStream, socket_addr: SocketAddr) {
    let SocketAddr::V4(v4) = socket_addr else {
        // IPv4-only overlay; the listener is bound on IPv4 so this is
        // unreachable in practice.
        return;
    };
    let peer_ip = *v4.ip();
    if let Err(err) = stream.set_nodelay(true) {
        warn!(peer = %socket_addr, error = %err, "set_nodelay failed on inbound");
    }

    // The reader needs its own table entry (for the advertised address)
    // and the table needs the reader's abort handle, so the stream is
    // handed over once both exist.
    let (tx, rx) = oneshot::channel();
    let task_node = node.clone();
    let handle = tokio::spawn(async move {
        let Ok((stream, peer)) = rx.await else { return };
        read_loop(task_node, stream, socket_addr, peer_ip, peer).await;
    });
    let peer = node.inbound.insert(socket_addr, handle.abort_handle()).await;
    node.log
        .debug(format_args!("inbound connection from {socket_addr}"));
    let _ = tx.send((stream, peer));
}

async fn read_loop(
    node: Arc<NodeRuntime>,
    mut stream: TcpStream,
    socket_addr: SocketAddr,
    peer_ip: Ipv4Addr,
    peer: Arc<InboundPeer>,
) {
    let mut buffer = crate::wire::FrameBuffer::new();
    let mut chunk = vec![0u8; node.cfg.read_chunk_size];

    'outer: loop {
        let read = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                trace!(peer = %socket_addr, error = %err, "inbound read failed");
                break;
            }
        };
        buffer.extend(&chunk[..read]);

        loop {
            match buffer.next_frame() {
                Ok(Some(bytes)) => match decode_frame(&bytes) {
                    Ok(frame) => {
                        let sender = NodeAddress::new(peer_ip, frame.sender_port);
                        peer.set_advertised(sender);
                        node.frames_received.fetch_add(1, Ordering::Relaxed);
                        if node.dispatch_tx.send((sender, frame)).is_err() {
                            break 'outer;
                        }
                    }
                    Err(err) => {
                        node.log.warning(format_args!(
                            "undecodable frame from {socket_addr}: {err}"
                        ));
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    // The stream can no longer be framed; there is no
                    // resynchronization point, so the peer goes away.
                    node.log.warning(format_args!(
                        "closing {socket_addr}: {err}"
                    ));
                    break 'outer;
                }
            }
        }
    }

    node.inbound.remove(socket_addr).await;
    if let Some(advertised) = peer.advertised() {
        // Replies from this peer arrive on this stream; with it gone,
        // their waiters can only fail.
        node.pending.fail_peer(advertised);
        node.log
            .debug(format_args!("inbound connection from {advertised} closed"));
    }
}

async fn dispatch_loop(node: Arc<NodeRuntime>) {
    let mut rx = node
        .dispatch_rx
        .lock()
        .expect("dispatch rx lock poisoned")
        .take()
        .expect("dispatch loop started twice");
    let stop = node.shutdown_signal();
    tokio::pin! { let stopped = stopped(stop); }
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            received = rx.recv() => match received {
                Some((sender, frame)) => NodeRuntime::dispatch(&node, sender, frame).await,
                None => break,
            },
        }
    }
}

async fn sender_loop(node: Arc<NodeRuntime>) {
    let mut rx = node
        .send_rx
        .lock()
        .expect("send rx lock poisoned")
        .take()
        .expect("sender loop started twice");
    let stop = node.shutdown_signal();
    tokio::pin! { let stopped = stopped(stop); }
    let mut writers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            // Reap finished writers so the set does not grow with node
            // lifetime.
            Some(_) = writers.join_next(), if !writers.is_empty() => {}
            request = rx.recv() => match request {
                Some(request) => {
                    writers.spawn(write_request(node.clone(), request));
                }
                None => break,
            },
        }
    }

    // Best-effort drain of inflight writes on shutdown.
    let _ = timeout(Duration::from_millis(500), async {
        while writers.join_next().await.is_some() {}
    })
    .await;
    writers.abort_all();

    // Anything still queued can never be written.
    while let Ok(request) = rx.try_recv() {
        node.pending.remove(request.frame.message_id);
        request.completion.fail(SendOutcome::ConnectionFailure);
    }
}

async fn write_request(node: Arc<NodeRuntime>, request: SendRequest) {
    let SendRequest {
        dst,
        frame,
        needs_approved,
        completion,
    } = request;

    if node.is_self(dst) {
        node.pending.remove(frame.message_id);
        completion.fail(SendOutcome::SelfFailure);
        return;
    }

    let conn = if needs_approved {
        node.outbound.get_approved(dst).await
    } else {
        node.outbound.ensure(dst).await
    };
    let Some(conn) = conn else {
        node.pending.remove(frame.message_id);
        completion.fail(SendOutcome::ConnectionFailure);
        return;
    };

    let bytes = encode_frame(&frame);
    if let Err(err) = conn.write_frame(&bytes).await {
        node.log
            .warning(format_args!("write to {dst} failed: {err}"));
        node.drop_peer(dst).await;
        node.pending.remove(frame.message_id);
        completion.fail(SendOutcome::ConnectionFailure);
        return;
    }
    node.frames_sent.fetch_add(1, Ordering::Relaxed);
    trace!(peer = %dst, kind = ?frame.kind, id = frame.message_id, "frame written");

    match completion {
        SendCompletion::Plain(completer) => completer.complete(SendOutcome::Success),
        SendCompletion::AwaitResponse { completer, rx } => {
            completer.sent_ok();
            let received = match node.cfg.response_timeout {
                Some(limit) => match timeout(limit, rx).await {
                    Ok(received) => received,
                    Err(_) => {
                        node.pending.remove(frame.message_id);
                        completer.fail_response(ResponseOutcome::Timeout);
                        return;
                    }
                },
                None => rx.await,
            };
            match received {
                Ok(message) => completer.complete_response(message),
                // Sender side of the slot was dropped: the peer's
                // connection went away before it answered.
                Err(_) => completer.fail_response(ResponseOutcome::ConnectionFailure),
            }
        }
    }
}

async fn approval_loop(node: Arc<NodeRuntime>) {
    let mut rx = node
        .approval_rx
        .lock()
        .expect("approval rx lock poisoned")
        .take()
        .expect("approval loop started twice");
    let stop = node.shutdown_signal();
    tokio::pin! { let stopped = stopped(stop); }
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            event = rx.recv() => match event {
                Some(ApprovalEvent { role, peer }) => {
                    debug!(?role, peer = %peer, "running approval hook");
                    match role {
                        ApprovalRole::Grantor => {
                            node.overlay.on_approval_granted(&node, peer).await;
                        }
                        ApprovalRole::Requester => {
                            node.overlay.on_approval_request_granted(&node, peer).await;
                        }
                    }
                }
                None => break,
            },
        }
    }
}

async fn user_event_loop(node: Arc<NodeRuntime>) {
    let mut rx = node
        .user_rx
        .lock()
        .expect("user rx lock poisoned")
        .take()
        .expect("user event loop started twice");
    let stop = node.shutdown_signal();
    tokio::pin! { let stopped = stopped(stop); }
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            message = rx.recv() => match message {
                Some(message) => node.invoke_callback(message),
                None => break,
            },
        }
    }
}

async fn ping_loop(node: Arc<NodeRuntime>) {
    let mut ticker = tokio::time::interval(node.cfg.ping_frequency);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let stop = node.shutdown_signal();
    tokio::pin! { let stopped = stopped(stop); }
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticker.tick() => {
                for addr in node.outbound.approved_addrs().await {
                    node.send_frame(addr, FrameKind::Ping, String::new(), true);
                }
            }
        }
    }
}

async fn update_loop(node: Arc<NodeRuntime>) {
    let mut ticker = tokio::time::interval(node.cfg.update_frequency);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let stop = node.shutdown_signal();
    tokio::pin! { let stopped = stopped(stop); }
    // The first tick fires immediately; skip it so a freshly joined node
    // does not run maintenance before the overlay has settled.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticker.tick() => {
                let timed_out = node
                    .outbound
                    .timed_out_addrs(node.cfg.connection_timeout)
                    .await;
                for addr in timed_out {
                    node.log
                        .info(format_args!("peer {addr} timed out; dropping"));
                    node.drop_peer(addr).await;
                }
                node.overlay.update_network(&node).await;
            }
        }
    }
}
