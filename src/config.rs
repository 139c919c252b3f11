//! Protocol timing knobs.

use tokio::time::Duration;

/// Default interval between ping rounds to approved neighbors.
pub const PING_FREQUENCY: Duration = Duration::from_secs(10);

/// Default interval between overlay maintenance rounds.
pub const UPDATE_NETWORK_FREQUENCY: Duration = Duration::from_secs(30);

/// Default ceiling on how long a request waits for its reply.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bytes pulled off an inbound stream per read.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Tunable timing for a node. `Default` matches the protocol constants;
/// tests shrink the intervals to keep wall-clock time down.
#[derive(Clone, Copy, Debug)]
pub struct NodeConfig {
    /// Interval between ping rounds.
    pub ping_frequency: Duration,
    /// Interval between overlay `update_network` rounds.
    pub update_frequency: Duration,
    /// Age of `last_ping_at` past which an approved peer counts as dead.
    /// Defaults to twice [`NodeConfig::ping_frequency`].
    pub connection_timeout: Duration,
    /// Per-request reply deadline wired in at the handle boundary.
    /// `None` waits indefinitely (a waiter then only completes on reply,
    /// connection drop, or shutdown).
    pub response_timeout: Option<Duration>,
    /// Bytes read from an inbound stream per pass.
    pub read_chunk_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ping_frequency: PING_FREQUENCY,
            update_frequency: UPDATE_NETWORK_FREQUENCY,
            connection_timeout: PING_FREQUENCY.saturating_mul(2),
            response_timeout: Some(RESPONSE_TIMEOUT),
            read_chunk_size: READ_CHUNK_SIZE,
        }
    }
}
