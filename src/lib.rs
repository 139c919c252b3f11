//! # overnet
//!
//! A peer-to-peer overlay library: nodes join a logical network over
//! plain TCP, exchange length-prefixed textual messages, correlate
//! request/response pairs, and keep membership converged under one of
//! two topologies:
//!
//! - **Mesh** ([`MeshNode`]): every approved node holds a direct,
//!   approved connection to every other node. Joining through any member
//!   transitively connects you to the whole network.
//! - **Chord** ([`ChordNode`]): a ring with successor/predecessor
//!   pointers and a 31-entry finger table, giving O(log N) key lookups
//!   and key-addressed messaging.
//!
//! The crate is split into a handful of modules that mirror the moving
//! parts of the runtime:
//!
//! - [`wire`]: the length-prefixed textual frame codec and the
//!   incremental per-peer frame buffer.
//! - `node`: the concurrent I/O engine — accept loop, per-peer framed
//!   readers, single-threaded dispatcher, send queue, and the periodic
//!   ping/maintenance tasks.
//! - `mesh` / `chord`: the two overlay strategies behind a common
//!   strategy trait.
//! - [`handle`]: waitable [`SendResult`] / [`ResponseResult`] handles
//!   returned by every send.
//! - [`logger`]: the injected diagnostics sink ([`Logger`]) with a
//!   [`tracing`]-backed default.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//! use overnet::{LogLevel, MeshNode, NodeAddress, TracingLogger};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let node = MeshNode::new(Arc::new(TracingLogger), LogLevel::Info);
//! node.on_message(|msg| println!("{}: {}", msg.sender, msg.payload));
//!
//! let seed: NodeAddress = "10.0.0.7:5001".parse()?;
//! let outcome = node.connect(5002, &[seed]).await?;
//! println!("joined: {outcome:?}");
//!
//! let reply = node
//!     .send_message_await_response(seed, "ping?")
//!     .completed()
//!     .await;
//! println!("reply: {reply:?}");
//! node.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! Messages are delivered to the [`MeshNode::on_message`] callback as
//! asynchronous events; replying with `send_response` correlates the
//! reply to the sender's waiting [`ResponseResult`] by message id.

pub mod addr;
pub mod chord;
pub mod config;
pub mod handle;
pub mod logger;
pub mod mesh;
mod node;
mod overlay;
mod peers;
mod pending;
pub mod wire;

pub use addr::{AddressError, NodeAddress};
pub use chord::{ChordNode, RingPeer};
pub use config::NodeConfig;
pub use handle::{
    ResponseOutcome, ResponseProgress, ResponseResult, SendOutcome, SendProgress, SendResult,
};
pub use logger::{LogLevel, Logger, TracingLogger};
pub use mesh::MeshNode;
pub use node::{parse_neighbor_list, Message, NetworkStats, NodeError};
pub use overlay::JoinOutcome;
