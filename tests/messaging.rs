//! User messaging: events, request/response correlation, and failure
//! outcomes.

#[path = "common/mod.rs"]
mod common;

use std::sync::{Arc, Mutex};

use common::{init_tracing, spawn_mesh, wait_until};
use overnet::{ResponseOutcome, SendOutcome};
use tokio::time::Duration;

const CONVERGENCE: Duration = Duration::from_secs(10);

async fn connected_pair() -> anyhow::Result<(overnet::MeshNode, overnet::MeshNode)> {
    let a = spawn_mesh(&[]).await?;
    let b = spawn_mesh(&[a.local_address()]).await?;
    let (a2, b2) = (a.clone(), b.clone());
    let converged = wait_until(CONVERGENCE, move || {
        let (a, b) = (a2.clone(), b2.clone());
        async move {
            !a.neighbors().await.is_empty() && !b.neighbors().await.is_empty()
        }
    })
    .await;
    anyhow::ensure!(converged, "pair did not converge");
    Ok((a, b))
}

#[tokio::test]
async fn fire_and_forget_message_is_delivered() -> anyhow::Result<()> {
    init_tracing();
    let (a, b) = connected_pair().await?;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    b.on_message(move |msg| {
        sink.lock().unwrap().push(msg);
    });

    let outcome = a
        .send_message(b.local_address(), "hello over there")
        .completed()
        .await;
    assert_eq!(outcome, SendOutcome::Success);

    let probe = received.clone();
    let delivered = wait_until(CONVERGENCE, move || {
        let probe = probe.clone();
        async move { !probe.lock().unwrap().is_empty() }
    })
    .await;
    assert!(delivered, "message never reached the callback");

    let messages = received.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload, "hello over there");
    assert_eq!(messages[0].sender, a.local_address());
    assert_eq!(messages[0].message_id, 0);
    assert!(!messages[0].awaiting_response);
    assert!(!messages[0].in_response_to);

    a.disconnect().await;
    b.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn request_gets_its_matching_response() -> anyhow::Result<()> {
    init_tracing();
    let (a, b) = connected_pair().await?;

    let responder = b.clone();
    b.on_message(move |msg| {
        if msg.awaiting_response {
            responder.send_response(&msg, "pong!");
        }
    });

    let exchange = a.send_message_await_response(b.local_address(), "ping?");
    assert_eq!(exchange.sent().await, SendOutcome::Success);
    let (outcome, response) = exchange.completed().await;
    assert_eq!(outcome, ResponseOutcome::Success);

    let response = response.expect("response message");
    assert_eq!(response.payload, "pong!");
    assert_eq!(response.sender, b.local_address());
    assert!(response.in_response_to);
    assert!(!response.awaiting_response);

    a.disconnect().await;
    b.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn self_send_fails_without_touching_the_network() -> anyhow::Result<()> {
    init_tracing();
    let a = spawn_mesh(&[]).await?;
    let before = a.stats().await;

    let outcome = a
        .send_message(a.local_address(), "talking to myself")
        .completed()
        .await;
    assert_eq!(outcome, SendOutcome::SelfFailure);

    let after = a.stats().await;
    assert_eq!(before.frames_sent, after.frames_sent);
    assert_eq!(after.outbound_connections, 0);

    let (outcome, response) = a
        .send_message_await_response(a.local_address(), "still me")
        .completed()
        .await;
    assert_eq!(outcome, ResponseOutcome::ConnectionFailure);
    assert!(response.is_none());

    a.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn send_to_unapproved_peer_fails() -> anyhow::Result<()> {
    init_tracing();
    let a = spawn_mesh(&[]).await?;
    let stranger = spawn_mesh(&[]).await?;

    // User traffic requires an approved connection; two separate
    // networks have none.
    let outcome = a
        .send_message(stranger.local_address(), "who are you")
        .completed()
        .await;
    assert_eq!(outcome, SendOutcome::ConnectionFailure);

    a.disconnect().await;
    stranger.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn peer_shutdown_fails_the_outstanding_waiter() -> anyhow::Result<()> {
    init_tracing();
    let (a, b) = connected_pair().await?;
    // B never responds: the request stays pending until the transport
    // to B disappears.
    b.on_message(|_msg| {});

    let exchange = a.send_message_await_response(b.local_address(), "anyone home?");
    assert_eq!(exchange.sent().await, SendOutcome::Success);

    b.disconnect().await;

    let (outcome, response) = exchange.completed().await;
    assert_eq!(outcome, ResponseOutcome::ConnectionFailure);
    assert!(response.is_none());

    a.disconnect().await;
    Ok(())
}
