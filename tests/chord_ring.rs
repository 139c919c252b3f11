//! Chord ring formation, lookup routing, and key-addressed messaging
//! over real loopback TCP.

#[path = "common/mod.rs"]
mod common;

use std::sync::{Arc, Mutex};

use common::{init_tracing, spawn_chord, wait_until};
use overnet::{ChordNode, JoinOutcome, ResponseOutcome, SendOutcome};
use tokio::time::Duration;

const CONVERGENCE: Duration = Duration::from_secs(15);

/// X(10), Y(40), Z(70), joined sequentially through X, converged into
/// a full ring.
async fn three_node_ring() -> anyhow::Result<(ChordNode, ChordNode, ChordNode)> {
    let x = spawn_chord(10, &[]).await?;
    let y = spawn_chord(40, &[x.local_address()]).await?;

    let (x2, y2) = (x.clone(), y.clone());
    let pair_ready = wait_until(CONVERGENCE, move || {
        let (x, y) = (x2.clone(), y2.clone());
        async move {
            x.successor().await == Some(y.local_address())
                && y.successor().await == Some(x.local_address())
        }
    })
    .await;
    anyhow::ensure!(pair_ready, "two-node ring did not close");

    let z = spawn_chord(70, &[x.local_address()]).await?;
    let (x2, y2, z2) = (x.clone(), y.clone(), z.clone());
    let ring_ready = wait_until(CONVERGENCE, move || {
        let (x, y, z) = (x2.clone(), y2.clone(), z2.clone());
        async move {
            x.successor().await == Some(y.local_address())
                && y.successor().await == Some(z.local_address())
                && z.successor().await == Some(x.local_address())
                && x.predecessor().await == Some(z.local_address())
                && y.predecessor().await == Some(x.local_address())
                && z.predecessor().await == Some(y.local_address())
        }
    })
    .await;
    anyhow::ensure!(ring_ready, "three-node ring did not converge");
    Ok((x, y, z))
}

#[tokio::test]
async fn lone_chord_node_creates_a_network() -> anyhow::Result<()> {
    init_tracing();
    let x = spawn_chord(10, &[]).await?;
    assert_eq!(x.id(), 10);
    assert_eq!(x.successor().await, None);
    assert_eq!(x.predecessor().await, None);

    // Alone, every key belongs to us.
    let owner = x.lookup(12345).await.expect("local resolution");
    assert_eq!(owner.id, 10);

    let outcome = x.send_chord_message(500, "to whom it may concern").await;
    assert_eq!(outcome.completed().await, SendOutcome::SelfFailure);

    x.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn second_node_joins_through_the_seed() -> anyhow::Result<()> {
    init_tracing();
    let x = spawn_chord(10, &[]).await?;
    let y = ChordNode::with_identifier(
        Arc::new(overnet::TracingLogger),
        overnet::LogLevel::Debug,
        common::fast_config(),
        40,
    );
    let outcome = y.connect(0, &[x.local_address()]).await?;
    assert_eq!(outcome, JoinOutcome::ConnectionSuccessful);

    // The seed was alone, so it becomes our successor immediately; the
    // seed learns about us through notify on the next cycles.
    assert_eq!(y.successor().await, Some(x.local_address()));

    let (x2, y2) = (x.clone(), y.clone());
    let closed = wait_until(CONVERGENCE, move || {
        let (x, y) = (x2.clone(), y2.clone());
        async move {
            x.successor().await == Some(y.local_address())
                && x.predecessor().await == Some(y.local_address())
                && y.predecessor().await == Some(x.local_address())
        }
    })
    .await;
    assert!(closed, "two-node ring did not close");

    // Approval pairs the joiner with its seed.
    assert_eq!(x.neighbors().await, vec![y.local_address()]);
    assert_eq!(y.neighbors().await, vec![x.local_address()]);

    x.disconnect().await;
    y.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn three_node_ring_converges_and_routes_lookups() -> anyhow::Result<()> {
    init_tracing();
    let (x, y, z) = three_node_ring().await?;

    // 50 ∈ (40, 70]: Z owns it, from every vantage point.
    for node in [&x, &y, &z] {
        let n = node.clone();
        let resolved = wait_until(CONVERGENCE, move || {
            let n = n.clone();
            async move { n.lookup(50).await.map(|p| p.id) == Some(70) }
        })
        .await;
        assert!(resolved, "lookup(50) from id {} never reached Z", node.id());
    }

    // 20 ∈ (10, 40]: Y owns it. 5 wraps into (70, 10]: X owns it.
    assert_eq!(x.lookup(20).await.map(|p| p.id), Some(40));
    assert_eq!(y.lookup(5).await.map(|p| p.id), Some(10));

    for node in [x, y, z] {
        node.disconnect().await;
    }
    Ok(())
}

#[tokio::test]
async fn fix_fingers_populates_the_table() -> anyhow::Result<()> {
    init_tracing();
    let (x, y, z) = three_node_ring().await?;

    // From X(10): 10+2^0=11 is Y's key space, 10+2^5=42 is Z's, and
    // 10+2^6=74 wraps back to X itself.
    let x2 = x.clone();
    let populated = wait_until(CONVERGENCE, move || {
        let x = x2.clone();
        async move {
            let fingers = x.fingers().await;
            fingers[0].map(|p| p.id) == Some(40)
                && fingers[5].map(|p| p.id) == Some(70)
                && fingers[6].map(|p| p.id) == Some(10)
        }
    })
    .await;
    assert!(populated, "finger table did not converge");

    for node in [x, y, z] {
        node.disconnect().await;
    }
    Ok(())
}

#[tokio::test]
async fn chord_messages_route_to_the_key_owner() -> anyhow::Result<()> {
    init_tracing();
    let (x, y, z) = three_node_ring().await?;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let responder = z.clone();
    z.on_message(move |msg| {
        sink.lock().unwrap().push(msg.clone());
        if msg.awaiting_response {
            responder.send_response(&msg, "stored at 70");
        }
    });

    // Fire-and-forget to key 50 lands on Z.
    let outcome = x.send_chord_message(50, "put:50").await.completed().await;
    assert_eq!(outcome, SendOutcome::Success);

    let probe = received.clone();
    let delivered = wait_until(CONVERGENCE, move || {
        let probe = probe.clone();
        async move { !probe.lock().unwrap().is_empty() }
    })
    .await;
    assert!(delivered, "chord message never reached the key owner");
    assert_eq!(received.lock().unwrap()[0].payload, "put:50");

    // Request/response through the ring.
    let exchange = x
        .send_chord_message_await_response(50, "get:50")
        .await;
    let (outcome, response) = exchange.completed().await;
    assert_eq!(outcome, ResponseOutcome::Success);
    assert_eq!(response.expect("reply").payload, "stored at 70");

    // A key we own ourselves never touches the network.
    let outcome = x.send_chord_message(5, "mine").await.completed().await;
    assert_eq!(outcome, SendOutcome::SelfFailure);

    for node in [x, y, z] {
        node.disconnect().await;
    }
    Ok(())
}
