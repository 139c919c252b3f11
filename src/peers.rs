//! Per-peer connection state.
//!
//! Two tables exist per node: outbound ("sending") connections this node
//! dialed, keyed by the peer's NodeAddress, and inbound ("receiving")
//! connections accepted from the listener, keyed by the socket address
//! the kernel reported. Their lifecycles are independent; a peer usually
//! appears in both once the overlay has converged.
//!
//! [`OutboundTable::ensure`] is the only place outbound connections are
//! minted. It uses an in-table placeholder so that concurrent callers for
//! the same address produce one dial: the first caller becomes the
//! opener, everyone else parks on a notifier until the placeholder turns
//! into a live connection or disappears. The table lock is never held
//! across the dial or the wait.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::addr::NodeAddress;

/// A live outbound connection to one peer.
///
/// The stream is written by writer tasks only, one at a time through the
/// internal lock; nothing ever reads it (replies travel over the peer's
/// own dial-back connection).
#[derive(Debug)]
pub(crate) struct PeerConnection {
    addr: NodeAddress,
    stream: Mutex<TcpStream>,
    last_ping_at: std::sync::Mutex<Instant>,
    approved: AtomicBool,
}

impl PeerConnection {
    fn new(addr: NodeAddress, stream: TcpStream) -> Self {
        Self {
            addr,
            stream: Mutex::new(stream),
            last_ping_at: std::sync::Mutex::new(Instant::now()),
            approved: AtomicBool::new(false),
        }
    }

    pub(crate) fn addr(&self) -> NodeAddress {
        self.addr
    }

    pub(crate) fn is_approved(&self) -> bool {
        self.approved.load(Ordering::Acquire)
    }

    pub(crate) fn set_approved(&self) {
        self.approved.store(true, Ordering::Release);
    }

    /// Record liveness; called when a ping from this peer arrives.
    pub(crate) fn touch_ping(&self) {
        *self.last_ping_at.lock().expect("ping lock poisoned") = Instant::now();
    }

    pub(crate) fn last_ping_age(&self) -> Duration {
        self.last_ping_at
            .lock()
            .expect("ping lock poisoned")
            .elapsed()
    }

    /// Write one encoded frame in full.
    pub(crate) async fn write_frame(&self, bytes: &[u8]) -> io::Result<()> {
        let mut stream = self.stream.lock().await;
        stream.write_all(bytes).await
    }
}

#[derive(Debug)]
enum OutboundSlot {
    /// Someone is dialing; wait for the slot to resolve.
    Opening,
    Ready(Arc<PeerConnection>),
}

/// Table of outbound connections keyed by peer address.
#[derive(Debug, Default)]
pub(crate) struct OutboundTable {
    slots: Mutex<HashMap<NodeAddress, OutboundSlot>>,
    changed: Notify,
}

impl OutboundTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return the connection to `addr`, dialing if necessary.
    ///
    /// Exactly one concurrent caller dials; the rest observe the outcome.
    /// `None` means the dial failed (or a concurrent dial failed).
    pub(crate) async fn ensure(&self, addr: NodeAddress) -> Option<Arc<PeerConnection>> {
        let opener = {
            let mut slots = self.slots.lock().await;
            match slots.get(&addr) {
                Some(OutboundSlot::Ready(conn)) => return Some(conn.clone()),
                Some(OutboundSlot::Opening) => false,
                None => {
                    slots.insert(addr, OutboundSlot::Opening);
                    true
                }
            }
        };

        if opener {
            self.dial(addr).await
        } else {
            self.await_slot(addr).await
        }
    }

    async fn dial(&self, addr: NodeAddress) -> Option<Arc<PeerConnection>> {
        let result = TcpStream::connect(addr.to_socket_addr()).await.and_then(|s| {
            s.set_nodelay(true)?;
            Ok(s)
        });

        let mut slots = self.slots.lock().await;
        let conn = match result {
            Ok(stream) => {
                trace!(peer = %addr, "outbound connection established");
                let conn = Arc::new(PeerConnection::new(addr, stream));
                slots.insert(addr, OutboundSlot::Ready(conn.clone()));
                Some(conn)
            }
            Err(err) => {
                trace!(peer = %addr, error = %err, "outbound dial failed");
                slots.remove(&addr);
                None
            }
        };
        drop(slots);
        self.changed.notify_waiters();
        conn
    }

    async fn await_slot(&self, addr: NodeAddress) -> Option<Arc<PeerConnection>> {
        loop {
            // Register interest before re-checking the slot, otherwise a
            // notify_waiters between the check and the await is lost.
            let mut notified = std::pin::pin!(self.changed.notified());
            notified.as_mut().enable();
            {
                let slots = self.slots.lock().await;
                match slots.get(&addr) {
                    Some(OutboundSlot::Ready(conn)) => return Some(conn.clone()),
                    Some(OutboundSlot::Opening) => {}
                    None => return None,
                }
            }
            notified.await;
        }
    }

    /// The live connection to `addr`, if present. Never dials.
    pub(crate) async fn get(&self, addr: NodeAddress) -> Option<Arc<PeerConnection>> {
        let slots = self.slots.lock().await;
        match slots.get(&addr) {
            Some(OutboundSlot::Ready(conn)) => Some(conn.clone()),
            _ => None,
        }
    }

    /// The live connection to `addr`, only if approved. Never dials.
    pub(crate) async fn get_approved(&self, addr: NodeAddress) -> Option<Arc<PeerConnection>> {
        self.get(addr).await.filter(|conn| conn.is_approved())
    }

    /// Drop the entry for `addr`, returning the connection if it was live.
    pub(crate) async fn remove(&self, addr: NodeAddress) -> Option<Arc<PeerConnection>> {
        let removed = {
            let mut slots = self.slots.lock().await;
            slots.remove(&addr)
        };
        self.changed.notify_waiters();
        match removed {
            Some(OutboundSlot::Ready(conn)) => Some(conn),
            _ => None,
        }
    }

    /// Addresses of all approved peers.
    pub(crate) async fn approved_addrs(&self) -> Vec<NodeAddress> {
        let slots = self.slots.lock().await;
        slots
            .values()
            .filter_map(|slot| match slot {
                OutboundSlot::Ready(conn) if conn.is_approved() => Some(conn.addr()),
                _ => None,
            })
            .collect()
    }

    /// Approved peers whose last ping is older than `timeout`.
    pub(crate) async fn timed_out_addrs(&self, timeout: Duration) -> Vec<NodeAddress> {
        let slots = self.slots.lock().await;
        slots
            .values()
            .filter_map(|slot| match slot {
                OutboundSlot::Ready(conn)
                    if conn.is_approved() && conn.last_ping_age() > timeout =>
                {
                    Some(conn.addr())
                }
                _ => None,
            })
            .collect()
    }

    pub(crate) async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub(crate) async fn clear(&self) {
        self.slots.lock().await.clear();
        self.changed.notify_waiters();
    }
}

/// One accepted connection, owned by its reader task.
///
/// `advertised` is the NodeAddress the peer claims in its frames (its
/// listening port paired with the IP observed on the stream); it is
/// unknown until the first frame decodes.
#[derive(Debug)]
pub(crate) struct InboundPeer {
    advertised: std::sync::Mutex<Option<NodeAddress>>,
    abort: AbortHandle,
}

impl InboundPeer {
    pub(crate) fn advertised(&self) -> Option<NodeAddress> {
        *self.advertised.lock().expect("advertised lock poisoned")
    }

    pub(crate) fn set_advertised(&self, addr: NodeAddress) {
        *self.advertised.lock().expect("advertised lock poisoned") = Some(addr);
    }
}

/// Table of inbound connections keyed by accepted socket address.
#[derive(Debug, Default)]
pub(crate) struct InboundTable {
    inner: Mutex<HashMap<SocketAddr, Arc<InboundPeer>>>,
}

impl InboundTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn insert(
        &self,
        socket_addr: SocketAddr,
        abort: AbortHandle,
    ) -> Arc<InboundPeer> {
        let peer = Arc::new(InboundPeer {
            advertised: std::sync::Mutex::new(None),
            abort,
        });
        let mut inner = self.inner.lock().await;
        inner.insert(socket_addr, peer.clone());
        peer
    }

    pub(crate) async fn remove(&self, socket_addr: SocketAddr) {
        let mut inner = self.inner.lock().await;
        inner.remove(&socket_addr);
    }

    /// Abort and drop every inbound connection claiming to be `addr`;
    /// called when the outbound side of that peer has failed.
    pub(crate) async fn remove_advertised(&self, addr: NodeAddress) {
        let mut inner = self.inner.lock().await;
        inner.retain(|_, peer| {
            if peer.advertised() == Some(addr) {
                peer.abort.abort();
                false
            } else {
                true
            }
        });
    }

    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Abort every reader; used at shutdown.
    pub(crate) async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        for peer in inner.values() {
            peer.abort.abort();
        }
        inner.clear();
    }
}
