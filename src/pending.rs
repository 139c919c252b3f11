//! Correlation of request ids to their waiting response handles.
//!
//! A writer that sends a request registers the message id here and parks
//! on the returned receiver; the dispatcher completes the entry when a
//! frame with that id arrives. Entries also record which peer the reply
//! is expected from, so a dropped connection can fail exactly the
//! waiters that depended on it. The lock is only ever held to mutate the
//! map, never across I/O.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::addr::NodeAddress;
use crate::node::Message;

#[derive(Debug)]
struct PendingEntry {
    peer: NodeAddress,
    tx: oneshot::Sender<Message>,
}

/// Map of in-flight request ids to response slots.
#[derive(Debug, Default)]
pub(crate) struct PendingResponses {
    inner: Mutex<HashMap<u64, PendingEntry>>,
}

impl PendingResponses {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `message_id`, replying from `peer`.
    ///
    /// Dropping the entry (failure paths) drops the sender, which the
    /// waiting receiver observes as a closed channel.
    pub(crate) fn register(
        &self,
        message_id: u64,
        peer: NodeAddress,
    ) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("pending lock poisoned");
        inner.insert(message_id, PendingEntry { peer, tx });
        rx
    }

    /// Deliver a response to its waiter. Returns `false` when no waiter
    /// was registered (already completed, timed out, or never ours).
    pub(crate) fn complete(&self, message_id: u64, message: Message) -> bool {
        let entry = {
            let mut inner = self.inner.lock().expect("pending lock poisoned");
            inner.remove(&message_id)
        };
        match entry {
            Some(entry) => entry.tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Drop a registration without completing it.
    pub(crate) fn remove(&self, message_id: u64) {
        let mut inner = self.inner.lock().expect("pending lock poisoned");
        inner.remove(&message_id);
    }

    /// Fail every waiter whose reply was expected from `peer`.
    pub(crate) fn fail_peer(&self, peer: NodeAddress) -> usize {
        let mut inner = self.inner.lock().expect("pending lock poisoned");
        let before = inner.len();
        inner.retain(|_, entry| entry.peer != peer);
        before - inner.len()
    }

    /// Fail every waiter; used at shutdown.
    pub(crate) fn fail_all(&self) {
        let mut inner = self.inner.lock().expect("pending lock poisoned");
        inner.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("pending lock poisoned").len()
    }
}
