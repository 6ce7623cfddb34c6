//! truss-bridge: cooperative async contexts and the bridges between them.
//!
//! A dual-core target runs one cooperative scheduler per core; state owned
//! by one context must only be touched from inside it. This crate provides
//! that scheduler ([`AsyncContext`]) and the three patterns that shepherd
//! work into it from the other core (or from interrupt-ish callers):
//!
//! - [`PerpetualBridge`] — registered once, re-triggerable, one per event
//!   kind; carries at most one small payload per firing.
//! - [`EphemeralBridge`] — one-shot and time-deferred; owns itself until it
//!   fires, then frees on the fire path.
//! - [`SyncBridge`] — blocking request/reply: the caller parks until the
//!   operation has run in the target context and its result is back.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use truss_bridge::{AsyncContext, PerpetualBridge};
//!
//! let ctx = AsyncContext::new(0);
//! let hits = Arc::new(AtomicU32::new(0));
//! let bridge = {
//!     let hits = Arc::clone(&hits);
//!     PerpetualBridge::<u16>::registered(Arc::clone(&ctx), move |len| {
//!         if let Some(len) = len {
//!             hits.fetch_add(u32::from(len), Ordering::SeqCst);
//!         }
//!     })
//!     .unwrap()
//! };
//!
//! bridge.run_with(3);     // from any core
//! ctx.poll();             // on the context core
//! assert_eq!(hits.load(Ordering::SeqCst), 3);
//! ```

pub mod bridge;
pub mod context;
pub mod ephemeral;
pub mod error;
pub mod sync;
pub mod worker;

pub use bridge::PerpetualBridge;
pub use context::AsyncContext;
pub use ephemeral::EphemeralBridge;
pub use error::BridgeError;
pub use sync::{Semaphore, SyncBridge};
pub use worker::{EphemeralJob, EphemeralWorker, PerpetualJob, PerpetualWorker};
