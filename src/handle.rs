//! Waitable result handles for outbound traffic.
//!
//! Every send returns immediately with a handle; the caller decides
//! whether to fire-and-forget, poll the snapshot accessors, or await the
//! terminal outcome. Completion is signalled through a watch channel so
//! waiters park instead of polling, and a handle completes exactly once:
//! progress only moves forward and the first terminal outcome wins.

use tokio::sync::watch;

use crate::node::Message;

/// Where a plain send currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SendProgress {
    Sending,
    Completed,
}

/// Terminal outcome of a plain send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The frame was written to the peer's stream in full.
    Success,
    /// No usable connection, or the write failed.
    ConnectionFailure,
    /// The destination was this node itself; nothing touched a socket.
    SelfFailure,
}

/// Where a request/response exchange currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResponseProgress {
    Sending,
    WaitingForResponse,
    Completed,
}

/// Terminal outcome of the response half of an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseOutcome {
    Success,
    ConnectionFailure,
    Timeout,
}

#[derive(Clone, Debug)]
struct SendState {
    progress: SendProgress,
    outcome: Option<SendOutcome>,
}

/// Handle for a send with no reply expected.
///
/// Cheap to clone; every clone observes the same completion.
#[derive(Clone, Debug)]
pub struct SendResult {
    rx: watch::Receiver<SendState>,
}

impl SendResult {
    /// Current progress snapshot.
    pub fn progress(&self) -> SendProgress {
        self.rx.borrow().progress
    }

    /// Terminal outcome, if the send has completed.
    pub fn outcome(&self) -> Option<SendOutcome> {
        self.rx.borrow().outcome
    }

    /// Wait until the send completes.
    ///
    /// If the node shuts down with the write still queued, the waiter
    /// observes [`SendOutcome::ConnectionFailure`].
    pub async fn completed(&self) -> SendOutcome {
        let mut rx = self.rx.clone();
        loop {
            if let Some(outcome) = rx.borrow().outcome {
                return outcome;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().outcome;
                return last.unwrap_or(SendOutcome::ConnectionFailure);
            }
        }
    }

    /// A handle that is already finished; used when a send fails before
    /// it can even be queued (for example a failed chord lookup).
    pub(crate) fn already_completed(outcome: SendOutcome) -> Self {
        let (completer, handle) = send_handle();
        completer.complete(outcome);
        handle
    }
}

/// Producer side of a [`SendResult`].
#[derive(Debug)]
pub(crate) struct SendCompleter {
    tx: watch::Sender<SendState>,
}

impl SendCompleter {
    pub(crate) fn complete(&self, outcome: SendOutcome) {
        self.tx.send_modify(|state| {
            if state.outcome.is_none() {
                state.progress = SendProgress::Completed;
                state.outcome = Some(outcome);
            }
        });
    }
}

pub(crate) fn send_handle() -> (SendCompleter, SendResult) {
    let (tx, rx) = watch::channel(SendState {
        progress: SendProgress::Sending,
        outcome: None,
    });
    (SendCompleter { tx }, SendResult { rx })
}

#[derive(Clone, Debug)]
struct ResponseState {
    progress: ResponseProgress,
    send_outcome: Option<SendOutcome>,
    response_outcome: Option<ResponseOutcome>,
    response: Option<Message>,
}

/// Handle for a request that awaits a reply.
///
/// The send half and the response half complete independently: `sent`
/// resolves once the frame is on the wire (or has failed), `completed`
/// resolves when the reply arrives or the exchange terminally fails.
#[derive(Clone, Debug)]
pub struct ResponseResult {
    rx: watch::Receiver<ResponseState>,
}

impl ResponseResult {
    pub fn progress(&self) -> ResponseProgress {
        self.rx.borrow().progress
    }

    pub fn send_outcome(&self) -> Option<SendOutcome> {
        self.rx.borrow().send_outcome
    }

    pub fn response_outcome(&self) -> Option<ResponseOutcome> {
        self.rx.borrow().response_outcome
    }

    /// The reply, once one has arrived.
    pub fn response_message(&self) -> Option<Message> {
        self.rx.borrow().response.clone()
    }

    /// Wait until the outgoing frame is on the wire or has failed.
    pub async fn sent(&self) -> SendOutcome {
        let mut rx = self.rx.clone();
        loop {
            if let Some(outcome) = rx.borrow().send_outcome {
                return outcome;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().send_outcome;
                return last.unwrap_or(SendOutcome::ConnectionFailure);
            }
        }
    }

    /// Wait for the exchange to finish, yielding the response outcome and
    /// the reply message on success.
    pub async fn completed(&self) -> (ResponseOutcome, Option<Message>) {
        let mut rx = self.rx.clone();
        loop {
            {
                let state = rx.borrow();
                if let Some(outcome) = state.response_outcome {
                    return (outcome, state.response.clone());
                }
            }
            if rx.changed().await.is_err() {
                let state = rx.borrow();
                return match state.response_outcome {
                    Some(outcome) => (outcome, state.response.clone()),
                    None => (ResponseOutcome::ConnectionFailure, None),
                };
            }
        }
    }

    pub(crate) fn already_failed(send: SendOutcome) -> Self {
        let (completer, handle) = response_handle();
        completer.fail_send(send);
        handle
    }
}

/// Producer side of a [`ResponseResult`].
#[derive(Debug)]
pub(crate) struct ResponseCompleter {
    tx: watch::Sender<ResponseState>,
}

impl ResponseCompleter {
    /// The frame is on the wire; now waiting on the peer.
    pub(crate) fn sent_ok(&self) {
        self.tx.send_modify(|state| {
            if state.send_outcome.is_none() {
                state.progress = ResponseProgress::WaitingForResponse;
                state.send_outcome = Some(SendOutcome::Success);
            }
        });
    }

    /// The send itself failed; the exchange can never complete, so the
    /// response half terminates with `ConnectionFailure` as well.
    pub(crate) fn fail_send(&self, outcome: SendOutcome) {
        self.tx.send_modify(|state| {
            if state.response_outcome.is_none() {
                state.progress = ResponseProgress::Completed;
                state.send_outcome.get_or_insert(outcome);
                state.response_outcome = Some(ResponseOutcome::ConnectionFailure);
            }
        });
    }

    pub(crate) fn complete_response(&self, message: Message) {
        self.tx.send_modify(|state| {
            if state.response_outcome.is_none() {
                state.progress = ResponseProgress::Completed;
                state.send_outcome.get_or_insert(SendOutcome::Success);
                state.response_outcome = Some(ResponseOutcome::Success);
                state.response = Some(message);
            }
        });
    }

    pub(crate) fn fail_response(&self, outcome: ResponseOutcome) {
        self.tx.send_modify(|state| {
            if state.response_outcome.is_none() {
                state.progress = ResponseProgress::Completed;
                state.send_outcome.get_or_insert(SendOutcome::Success);
                state.response_outcome = Some(outcome);
            }
        });
    }
}

pub(crate) fn response_handle() -> (ResponseCompleter, ResponseResult) {
    let (tx, rx) = watch::channel(ResponseState {
        progress: ResponseProgress::Sending,
        send_outcome: None,
        response_outcome: None,
        response: None,
    });
    (ResponseCompleter { tx }, ResponseResult { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::NodeAddress;
    use std::net::Ipv4Addr;

    fn sample_message(payload: &str) -> Message {
        Message {
            sender: NodeAddress::new(Ipv4Addr::LOCALHOST, 5000),
            payload: payload.to_string(),
            message_id: 7,
            awaiting_response: false,
            in_response_to: true,
        }
    }

    #[tokio::test]
    async fn send_handle_wakes_waiter_once() {
        let (completer, handle) = send_handle();
        assert_eq!(handle.progress(), SendProgress::Sending);
        assert_eq!(handle.outcome(), None);

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.completed().await }
        });

        completer.complete(SendOutcome::Success);
        assert_eq!(waiter.await.unwrap(), SendOutcome::Success);
        assert_eq!(handle.progress(), SendProgress::Completed);

        // A second completion attempt must not overwrite the first.
        completer.complete(SendOutcome::ConnectionFailure);
        assert_eq!(handle.outcome(), Some(SendOutcome::Success));
    }

    #[tokio::test]
    async fn dropped_completer_fails_the_waiter() {
        let (completer, handle) = send_handle();
        drop(completer);
        assert_eq!(handle.completed().await, SendOutcome::ConnectionFailure);
    }

    #[tokio::test]
    async fn response_handle_progress_is_monotone() {
        let (completer, handle) = response_handle();
        assert_eq!(handle.progress(), ResponseProgress::Sending);

        completer.sent_ok();
        assert_eq!(handle.progress(), ResponseProgress::WaitingForResponse);
        assert_eq!(handle.sent().await, SendOutcome::Success);

        completer.complete_response(sample_message("pong!"));
        let (outcome, message) = handle.completed().await;
        assert_eq!(outcome, ResponseOutcome::Success);
        assert_eq!(message.unwrap().payload, "pong!");
        assert_eq!(handle.progress(), ResponseProgress::Completed);
    }

    #[tokio::test]
    async fn failed_send_terminates_the_response_half() {
        let (completer, handle) = response_handle();
        completer.fail_send(SendOutcome::SelfFailure);

        assert_eq!(handle.sent().await, SendOutcome::SelfFailure);
        let (outcome, message) = handle.completed().await;
        assert_eq!(outcome, ResponseOutcome::ConnectionFailure);
        assert!(message.is_none());
    }

    #[tokio::test]
    async fn late_failure_does_not_clobber_a_response() {
        let (completer, handle) = response_handle();
        completer.sent_ok();
        completer.complete_response(sample_message("first"));
        completer.fail_response(ResponseOutcome::Timeout);

        let (outcome, message) = handle.completed().await;
        assert_eq!(outcome, ResponseOutcome::Success);
        assert_eq!(message.unwrap().payload, "first");
    }
}
