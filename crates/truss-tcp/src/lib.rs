//! truss-tcp: asynchronous TCP client over a raw callback stack.
//!
//! The stack (lwIP's raw API in production, [`sim::SimStack`] in tests)
//! may only be touched from the networking core; application code lives on
//! either core. This crate supplies the client side of that arrangement:
//!
//! - [`TcpClient`] — the public handle: connect, chunked async writes,
//!   peek/consume reads, teardown, and six bridge-dispatched event slots.
//! - [`SyncAccessor`] — blocking cross-core access to `connect`/`status`.
//! - [`RxBuffer`] — cursor over the inbound segment chain with exact
//!   receive-window crediting.
//! - [`TxWriter`] — ACK-driven chunked write engine with two completion
//!   policies, stall detection, and advisory watermarks.
//! - [`ClientContext`] — the per-connection wrapper the stack's callbacks
//!   recover through their `arg` slot.
//!
//! Event hand-off always goes through `truss-bridge` workers: the client
//! never runs application code inline from a stack callback.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use truss_bridge::{AsyncContext, PerpetualBridge};
//! use truss_tcp::{sim::SimStack, TcpClient};
//!
//! let net_ctx = AsyncContext::new(0);
//! net_ctx.bind_to_current_thread();
//! let stack = SimStack::new();
//!
//! let mut client = TcpClient::new(stack.clone(), Arc::clone(&net_ctx));
//! client.install_sync_accessor();
//! client.set_on_received(
//!     PerpetualBridge::registered(Arc::clone(&net_ctx), |_| {
//!         // data is waiting; peek/consume through the client
//!     })
//!     .unwrap(),
//! );
//!
//! client.connect("192.0.2.10:7".parse().unwrap()).unwrap();
//! ```

pub mod accessor;
pub mod client;
pub mod context;
pub mod error;
pub mod rx;
pub mod sim;
pub mod stack;
pub mod tx;

pub use accessor::SyncAccessor;
pub use client::{
    default_no_delay, local_port_start, set_default_no_delay, set_local_port_start, TcpClient,
    DEFAULT_FLUSH_WAIT,
};
pub use context::ClientContext;
pub use error::{StackError, StackResult, TcpError};
pub use rx::RxBuffer;
pub use stack::{
    CallbackTable, KeepAlive, PcbId, PcbState, Segment, TcpStack, WriteFlags, DEFAULT_MSS,
};
pub use tx::{ChunkSink, CompletionMode, TxWriter, WRITE_STALL_TIMEOUT};
