//! Re-triggerable event dispatch into a context.
//!
//! A [`PerpetualBridge`] is the registered-once, fire-many pattern: one
//! bridge per event kind, constructed with the handler that must run on the
//! context core, triggered from anywhere with [`run`] or [`run_with`]. The
//! C-trampoline-plus-vtable shape of the original callback plumbing is
//! folded into a closure owned by the scheduler's worker record; the bridge
//! keeps the registration handle and the payload slot.
//!
//! [`run`]: PerpetualBridge::run
//! [`run_with`]: PerpetualBridge::run_with

use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::context::AsyncContext;
use crate::error::BridgeError;
use crate::worker::PerpetualWorker;

struct Shared<T> {
    handler: Box<dyn Fn(Option<T>) + Send + Sync>,
    /// At most one small workload per firing; a re-trigger before dispatch
    /// replaces it (latest wins).
    payload: Mutex<Option<T>>,
}

/// Registered-once, re-triggerable dispatch target.
///
/// The worker stays registered from [`initialise`](Self::initialise) until
/// drop. Triggering an uninitialised bridge is logged and otherwise ignored
/// — the application simply sees no callbacks, which is a programming error
/// to repair, not a runtime condition to handle.
pub struct PerpetualBridge<T = ()>
where
    T: Copy + Send + 'static,
{
    ctx: Arc<AsyncContext>,
    shared: Arc<Shared<T>>,
    worker: Option<PerpetualWorker>,
}

impl<T> PerpetualBridge<T>
where
    T: Copy + Send + 'static,
{
    /// Build a bridge whose `handler` will run on `ctx`'s core. The bridge
    /// is inert until [`initialise`](Self::initialise) registers it.
    pub fn new<F>(ctx: Arc<AsyncContext>, handler: F) -> Self
    where
        F: Fn(Option<T>) + Send + Sync + 'static,
    {
        PerpetualBridge {
            ctx,
            shared: Arc::new(Shared {
                handler: Box::new(handler),
                payload: Mutex::new(None),
            }),
            worker: None,
        }
    }

    /// Convenience: build and register in one step.
    pub fn registered<F>(ctx: Arc<AsyncContext>, handler: F) -> Result<Self, BridgeError>
    where
        F: Fn(Option<T>) + Send + Sync + 'static,
    {
        let mut bridge = Self::new(ctx, handler);
        bridge.initialise()?;
        Ok(bridge)
    }

    /// Register the worker with the context. Idempotent.
    pub fn initialise(&mut self) -> Result<(), BridgeError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let worker = self.ctx.add_worker(Arc::new(move || {
            let payload = shared.payload.lock().take();
            (shared.handler)(payload);
        }))?;
        self.worker = Some(worker);
        Ok(())
    }

    pub fn is_initialised(&self) -> bool {
        self.worker.is_some()
    }

    /// Trigger the bridge with no payload. Callable from any core.
    pub fn run(&self) {
        match &self.worker {
            Some(worker) => self.ctx.set_pending(worker),
            None => warn!("perpetual bridge triggered before initialise"),
        }
    }

    /// Trigger the bridge carrying `payload`.
    pub fn run_with(&self, payload: T) {
        *self.shared.payload.lock() = Some(payload);
        self.run();
    }
}

impl<T> Drop for PerpetualBridge<T>
where
    T: Copy + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.ctx.remove_worker(worker);
        }
    }
}
