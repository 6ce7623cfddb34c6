//! Typed handles over the scheduler's two worker records.
//!
//! The context owns the records themselves (a registered slot for perpetual
//! workers, a deadline-keyed entry for ephemeral ones); these handles are the
//! caller's proof of registration and the key used to trigger or cancel work.

use std::sync::Arc;
use std::time::Instant;

/// Job body of a perpetual worker.
///
/// Shared rather than boxed so the dispatch loop can run it without holding
/// the worker-table lock while the job executes.
pub type PerpetualJob = Arc<dyn Fn() + Send + Sync>;

/// Job body of an ephemeral worker. Consumed on fire.
pub type EphemeralJob = Box<dyn FnOnce() + Send>;

/// Handle to a registered perpetual worker.
///
/// Stays registered until passed back to
/// [`AsyncContext::remove_worker`](crate::AsyncContext::remove_worker); the
/// handle must outlive the registration window, which is why the owning
/// bridge keeps it for its whole lifetime.
#[derive(Debug)]
pub struct PerpetualWorker {
    pub(crate) key: usize,
}

impl PerpetualWorker {
    /// Opaque registration key, for logging.
    pub fn key(&self) -> usize {
        self.key
    }
}

/// Handle to a scheduled ephemeral worker.
///
/// The record is removed automatically when it fires; the handle is only
/// needed to cancel it early.
#[derive(Debug)]
pub struct EphemeralWorker {
    pub(crate) when: Instant,
    pub(crate) seq: u64,
}

impl EphemeralWorker {
    /// Deadline at which the worker fires.
    pub fn deadline(&self) -> Instant {
        self.when
    }
}
