//! One-shot delayed dispatch into a context.
//!
//! An [`EphemeralBridge`] must survive exactly until it fires, regardless of
//! the scope that created it. The job is moved into the scheduler's timed
//! worker table on [`run`](EphemeralBridge::run); when the deadline arrives
//! the dispatch loop moves the record out into a local, runs it, and the
//! local drops at scope exit — freeing everything the job owned. If
//! registration fails, the bridge is handed back so the owning frame frees
//! it instead.

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::context::AsyncContext;
use crate::worker::{EphemeralJob, EphemeralWorker};

/// One-shot, time-deferred dispatch target.
pub struct EphemeralBridge {
    ctx: Arc<AsyncContext>,
    job: Option<EphemeralJob>,
}

impl EphemeralBridge {
    /// Build a boxed bridge around a one-shot job.
    pub fn new<F>(ctx: Arc<AsyncContext>, job: F) -> Box<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Box::new(EphemeralBridge {
            ctx,
            job: Some(Box::new(job)),
        })
    }

    /// Schedule the job to fire `delay` from now, transferring its
    /// ownership to the scheduler. On failure the bridge is returned to the
    /// caller, whose frame then owns the cleanup.
    pub fn run(mut self: Box<Self>, delay: Duration) -> Result<EphemeralWorker, Box<Self>> {
        let job = match self.job.take() {
            Some(job) => job,
            None => {
                warn!("ephemeral bridge scheduled twice");
                return Err(self);
            }
        };
        let ctx = Arc::clone(&self.ctx);
        match ctx.add_timed_worker(job, delay) {
            Ok(worker) => Ok(worker),
            Err(job) => {
                warn!("ephemeral worker registration failed; context closed");
                self.job = Some(job);
                Err(self)
            }
        }
    }
}
