//! Ping-driven liveness: departed peers are detected and dropped.

#[path = "common/mod.rs"]
mod common;

use common::{init_tracing, spawn_mesh, wait_until};
use tokio::time::Duration;

const CONVERGENCE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn departed_peer_is_dropped_from_neighbors() -> anyhow::Result<()> {
    init_tracing();
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

    b.disconnect().await;

    // Either the next ping write fails or the liveness sweep notices
    // the silence; both end with B gone from A's tables.
    let a2 = a.clone();
    let cleaned = wait_until(CONVERGENCE, move || {
        let a = a2.clone();
        async move { a.neighbors().await.is_empty() }
    })
    .await;
    assert!(cleaned, "dead peer was never dropped");

    a.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn traffic_counters_move_with_the_protocol() -> anyhow::Result<()> {
    init_tracing();
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

    let stats = a.stats().await;
    assert_eq!(stats.approved_neighbors, 1);
    assert!(stats.outbound_connections >= 1);
    assert!(stats.inbound_connections >= 1);
    // The approval handshake alone moves frames in both directions.
    assert!(stats.frames_sent > 0);
    assert!(stats.frames_received > 0);

    a.disconnect().await;
    b.disconnect().await;
    Ok(())
}
