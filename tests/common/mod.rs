//! Shared helpers for the integration suite: fast protocol timing,
//! loopback nodes on ephemeral ports, and convergence polling.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;

use overnet::{
    ChordNode, LogLevel, Logger, MeshNode, NodeAddress, NodeConfig, TracingLogger,
};
use tokio::time::{sleep, Duration, Instant};

/// Timing shrunk so convergence happens in test-scale wall clock.
pub fn fast_config() -> NodeConfig {
    NodeConfig {
        ping_frequency: Duration::from_millis(150),
        update_frequency: Duration::from_millis(250),
        connection_timeout: Duration::from_secs(1),
        response_timeout: Some(Duration::from_secs(5)),
        ..NodeConfig::default()
    }
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A mesh node bound to an ephemeral loopback port, joined through
/// `seeds`.
pub async fn spawn_mesh(seeds: &[NodeAddress]) -> anyhow::Result<MeshNode> {
    let node = MeshNode::with_config(Arc::new(TracingLogger), LogLevel::Debug, fast_config());
    node.connect(0, seeds).await?;
    Ok(node)
}

/// A chord node with a fixed ring identifier, joined through `seeds`.
pub async fn spawn_chord(id: u32, seeds: &[NodeAddress]) -> anyhow::Result<ChordNode> {
    let node = ChordNode::with_identifier(
        Arc::new(TracingLogger),
        LogLevel::Debug,
        fast_config(),
        id,
    );
    node.connect(0, seeds).await?;
    Ok(node)
}

/// Poll `probe` until it reports true or `deadline` passes.
pub async fn wait_until<F, Fut>(deadline: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if probe().await {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Log sink that records everything for assertions.
#[derive(Clone, Default)]
pub struct RecordingLogger {
    entries: Arc<Mutex<Vec<(LogLevel, String)>>>,
}

impl RecordingLogger {
    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries.lock().unwrap().clone()
    }
}

impl Logger for RecordingLogger {
    fn write(&self, level: LogLevel, message: &str) {
        self.entries.lock().unwrap().push((level, message.to_string()));
    }
}
