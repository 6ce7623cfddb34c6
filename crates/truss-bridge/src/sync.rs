//! Cross-context request/reply bridging.
//!
//! A [`SyncBridge`] executes an operation inside its target context and
//! blocks the caller until the result is back: the cross-core equivalent of
//! a plain function call. Each call packages its payload, a zeroed result
//! slot and a one-permit semaphore into a heap execution record, registers a
//! one-shot worker for it, and parks on the semaphore; the handler releases
//! the semaphore exactly once, from inside the target context.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, ReentrantMutex};

use crate::context::AsyncContext;
use crate::error::BridgeError;
use crate::worker::PerpetualJob;

/// Minimal counting semaphore.
///
/// `SyncBridge` needs exactly one-permit signalling; kept general so the
/// context's sync-execute primitive can share it.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Semaphore {
            permits: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Return one permit and wake one waiter.
    pub fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }
}

/// Per-call execution record: moved payload, zeroed result slot, completion
/// semaphore.
struct ExecutionRecord<P, R> {
    payload: Mutex<Option<P>>,
    result: Mutex<Option<R>>,
    done: Semaphore,
}

type Handler<P, R> = Arc<dyn Fn(P) -> R + Send + Sync>;

/// Blocking request/reply bridge into a target context.
///
/// `execute` calls on one instance are serialized by a recursive mutex, so
/// a handler that re-enters the same bridge from the context core does not
/// deadlock. The handler is installed once with [`initialise`]; executing an
/// uninitialised bridge yields [`BridgeError::InvalidState`].
///
/// [`initialise`]: SyncBridge::initialise
pub struct SyncBridge<P, R>
where
    P: Send + 'static,
    R: Send + Default + 'static,
{
    ctx: Arc<AsyncContext>,
    /// Serializes `execute` per instance.
    serial: ReentrantMutex<()>,
    handler: Mutex<Option<Handler<P, R>>>,
}

impl<P, R> SyncBridge<P, R>
where
    P: Send + 'static,
    R: Send + Default + 'static,
{
    pub fn new(ctx: Arc<AsyncContext>) -> Self {
        SyncBridge {
            ctx,
            serial: ReentrantMutex::new(()),
            handler: Mutex::new(None),
        }
    }

    /// Install the operation this bridge executes in its target context.
    pub fn initialise<F>(&self, handler: F)
    where
        F: Fn(P) -> R + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    pub fn is_initialised(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Run the handler on the target context with `payload`, blocking until
    /// the result is available.
    ///
    /// Callers already on the target core take a fast path: the context
    /// lock is acquired and the handler runs inline, without re-entering
    /// the scheduler.
    pub fn execute(&self, payload: P) -> Result<R, BridgeError> {
        let handler = self
            .handler
            .lock()
            .clone()
            .ok_or(BridgeError::InvalidState)?;
        let _serial = self.serial.lock();

        if self.ctx.is_on_context_core() {
            let _ctx_lock = self.ctx.lock();
            return Ok(handler(payload));
        }

        let record = Arc::new(ExecutionRecord {
            payload: Mutex::new(Some(payload)),
            result: Mutex::new(None),
            done: Semaphore::new(0),
        });
        let job: PerpetualJob = {
            let record = Arc::clone(&record);
            Arc::new(move || {
                if let Some(payload) = record.payload.lock().take() {
                    *record.result.lock() = Some(handler(payload));
                }
                record.done.release();
            })
        };

        // Registration and the pending mark mutate the scheduler's worker
        // list from a foreign core; both are guarded inside the context.
        let worker = self
            .ctx
            .add_worker(job)
            .map_err(|_| BridgeError::ContextClosed)?;
        self.ctx.set_pending(&worker);
        record.done.acquire();
        self.ctx.remove_worker(worker);

        let result = record.result.lock().take().unwrap_or_default();
        Ok(result)
    }
}
