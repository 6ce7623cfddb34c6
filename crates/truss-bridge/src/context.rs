//! The cooperative per-core async context.
//!
//! An [`AsyncContext`] is a single-threaded cooperative scheduler bound to
//! one core (on a host build, one owning thread). It owns two worker lists:
//! perpetual workers, which stay registered and re-fire each time they are
//! marked pending, and ephemeral workers, which fire once at a deadline and
//! are removed as they fire. All network-stack state guarded by a context
//! may only be touched from inside it — the bridges in this crate exist to
//! shepherd work here from anywhere else.
//!
//! Cross-core triggering is split in two halves: the pending hand-off goes
//! through a lock-free queue, while worker-table mutation is wrapped in a
//! mutex standing in for the interrupt-disabling critical section the
//! embedded target uses.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use log::{debug, warn};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use slab::Slab;

use crate::error::BridgeError;
use crate::sync::Semaphore;
use crate::worker::{EphemeralJob, EphemeralWorker, PerpetualJob, PerpetualWorker};

/// A registered perpetual worker record.
struct PerpetualSlot {
    job: PerpetualJob,
    /// Coalesces triggers: a worker marked pending twice before dispatch
    /// runs once.
    pending: bool,
}

/// Timed records ordered by `(deadline, seq)` for expiry scanning.
struct TimedState {
    heap: BTreeMap<(Instant, u64), EphemeralJob>,
}

/// Cooperative scheduler for one core.
pub struct AsyncContext {
    core: u8,
    /// Recursive context lock; held by `poll()` for the whole dispatch pass.
    lock: ReentrantMutex<()>,
    /// Owning thread, claimed on first `poll()` or via `bind_to_current_thread`.
    owner: StdMutex<Option<ThreadId>>,
    /// Worker table; the mutex is the critical section guarding mutation
    /// issued from a foreign core.
    workers: Mutex<Slab<PerpetualSlot>>,
    /// Lock-free FIFO of pending worker keys, pushable from any core.
    pending: ConcurrentQueue<usize>,
    timed: Mutex<TimedState>,
    timed_seq: AtomicU64,
    closed: AtomicBool,
}

impl AsyncContext {
    /// Create a context for the given core number.
    ///
    /// The context is not yet bound to a thread; the first `poll()` claims
    /// the calling thread as its core.
    pub fn new(core: u8) -> Arc<Self> {
        Arc::new(AsyncContext {
            core,
            lock: ReentrantMutex::new(()),
            owner: StdMutex::new(None),
            workers: Mutex::new(Slab::new()),
            pending: ConcurrentQueue::unbounded(),
            timed: Mutex::new(TimedState {
                heap: BTreeMap::new(),
            }),
            timed_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Core number this context is bound to.
    pub fn core(&self) -> u8 {
        self.core
    }

    /// Claim the calling thread as the context's core.
    pub fn bind_to_current_thread(&self) {
        let mut owner = self.owner.lock().unwrap();
        *owner = Some(thread::current().id());
    }

    /// Whether the calling thread is the context's core.
    ///
    /// False while the context is unbound — a caller that cannot prove it is
    /// on the core must take the cross-core path.
    pub fn is_on_context_core(&self) -> bool {
        let owner = self.owner.lock().unwrap();
        *owner == Some(thread::current().id())
    }

    /// Acquire the context lock. Recursive: the owning core may re-enter.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shut the context down. Registered workers stop firing; registration
    /// of new work fails with [`BridgeError::ContextClosed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.close();
    }

    // ── Perpetual workers ───────────────────────────────────────────

    /// Register a perpetual worker. The returned handle must be kept for
    /// the whole registration window and passed to [`remove_worker`].
    ///
    /// [`remove_worker`]: AsyncContext::remove_worker
    pub fn add_worker(&self, job: PerpetualJob) -> Result<PerpetualWorker, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ContextClosed);
        }
        let key = self.workers.lock().insert(PerpetualSlot {
            job,
            pending: false,
        });
        Ok(PerpetualWorker { key })
    }

    /// Deregister a perpetual worker. Consumes the handle; a pending
    /// trigger that has not yet dispatched is discarded.
    pub fn remove_worker(&self, worker: PerpetualWorker) {
        if self.workers.lock().try_remove(worker.key).is_none() {
            warn!("remove_worker: key {} was not registered", worker.key);
        }
    }

    /// Mark a worker pending. Callable from any core; the work runs on the
    /// context core at the next `poll()`, FIFO among pending workers.
    pub fn set_pending(&self, worker: &PerpetualWorker) {
        let mut workers = self.workers.lock();
        match workers.get_mut(worker.key) {
            Some(slot) if !slot.pending => {
                slot.pending = true;
                if self.pending.push(worker.key).is_err() {
                    slot.pending = false;
                    warn!("set_pending: context closed, trigger dropped");
                }
            }
            Some(_) => {} // already queued; coalesce
            None => warn!("set_pending: key {} was not registered", worker.key),
        }
    }

    // ── Ephemeral workers ───────────────────────────────────────────

    /// Schedule a one-shot job to fire `delay` from now. On failure the job
    /// is handed back so the caller's frame can keep or drop it.
    pub fn add_timed_worker(
        &self,
        job: EphemeralJob,
        delay: Duration,
    ) -> Result<EphemeralWorker, EphemeralJob> {
        if self.is_closed() {
            return Err(job);
        }
        let when = Instant::now() + delay;
        let seq = self.timed_seq.fetch_add(1, Ordering::Relaxed);
        self.timed.lock().heap.insert((when, seq), job);
        Ok(EphemeralWorker { when, seq })
    }

    /// Cancel a scheduled ephemeral worker. Returns false if it already
    /// fired (or was never scheduled here).
    pub fn remove_timed_worker(&self, worker: &EphemeralWorker) -> bool {
        self.timed
            .lock()
            .heap
            .remove(&(worker.when, worker.seq))
            .is_some()
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Run one dispatch pass: fire every due ephemeral worker, then every
    /// pending perpetual worker, in FIFO order. Must be called from the
    /// context core; the first call claims the calling thread.
    pub fn poll(&self) {
        self.claim_or_check_owner();
        let _held = self.lock.lock();
        self.run_due_timed();
        self.drain_pending();
    }

    /// Cooperatively wait until `until`, polling the context meanwhile.
    /// Only legal on the context core.
    pub fn wait_until(&self, until: Instant) {
        debug_assert!(
            self.is_on_context_core(),
            "wait_until called off the context core"
        );
        loop {
            self.poll();
            let now = Instant::now();
            if now >= until {
                break;
            }
            thread::sleep((until - now).min(Duration::from_millis(1)));
        }
    }

    /// Execute `f` synchronously inside this context and return its result.
    ///
    /// From the context core the function runs inline under the context
    /// lock. From any other core it is shepherded over as a zero-delay
    /// ephemeral worker and the caller blocks until it has run. Not legal
    /// from ISR context.
    pub fn execute_sync<R, F>(&self, f: F) -> Result<R, BridgeError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_on_context_core() {
            let _held = self.lock.lock();
            return Ok(f());
        }
        let result: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let done = Arc::new(Semaphore::new(0));
        let job: EphemeralJob = {
            let result = Arc::clone(&result);
            let done = Arc::clone(&done);
            Box::new(move || {
                *result.lock() = Some(f());
                done.release();
            })
        };
        if self.add_timed_worker(job, Duration::ZERO).is_err() {
            return Err(BridgeError::ContextClosed);
        }
        done.acquire();
        let value = result.lock().take();
        debug_assert!(value.is_some(), "sync job completed without a result");
        value.ok_or(BridgeError::InvalidState)
    }

    fn claim_or_check_owner(&self) {
        let mut owner = self.owner.lock().unwrap();
        let current = thread::current().id();
        match *owner {
            None => {
                debug!("context core {} claimed by {:?}", self.core, current);
                *owner = Some(current);
            }
            Some(bound) => debug_assert!(
                bound == current,
                "poll called from off-core thread {current:?}"
            ),
        }
    }

    fn run_due_timed(&self) {
        loop {
            let job = {
                let now = Instant::now();
                let mut timed = self.timed.lock();
                match timed.heap.keys().next().copied() {
                    Some((when, seq)) if when <= now => timed.heap.remove(&(when, seq)),
                    _ => None,
                }
            };
            match job {
                // The record was moved out of the table: the job and
                // everything it owns drop when this frame returns.
                Some(job) => job(),
                None => break,
            }
        }
    }

    fn drain_pending(&self) {
        // Bound the pass so a worker re-marking itself pending cannot
        // starve the caller.
        let budget = self.pending.len();
        for _ in 0..budget {
            let key = match self.pending.pop() {
                Ok(key) => key,
                Err(_) => break,
            };
            let job = {
                let mut workers = self.workers.lock();
                match workers.get_mut(key) {
                    Some(slot) if slot.pending => {
                        slot.pending = false;
                        Some(Arc::clone(&slot.job))
                    }
                    // Removed since it was queued, or a stale trigger for
                    // a reused key: skip.
                    _ => None,
                }
            };
            if let Some(job) = job {
                job();
            }
        }
    }
}

impl Drop for AsyncContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_job(counter: &Arc<AtomicU32>) -> PerpetualJob {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn pending_worker_runs_once_per_trigger() {
        let ctx = AsyncContext::new(0);
        let hits = Arc::new(AtomicU32::new(0));
        let worker = ctx.add_worker(counting_job(&hits)).unwrap();

        ctx.set_pending(&worker);
        ctx.poll();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // No trigger, no run.
        ctx.poll();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        ctx.set_pending(&worker);
        ctx.poll();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        ctx.remove_worker(worker);
    }

    #[test]
    fn double_trigger_coalesces() {
        let ctx = AsyncContext::new(0);
        let hits = Arc::new(AtomicU32::new(0));
        let worker = ctx.add_worker(counting_job(&hits)).unwrap();

        ctx.set_pending(&worker);
        ctx.set_pending(&worker);
        ctx.poll();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        ctx.remove_worker(worker);
    }

    #[test]
    fn pending_dispatch_is_fifo() {
        let ctx = AsyncContext::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for tag in 0..3u32 {
            let order = Arc::clone(&order);
            handles.push(
                ctx.add_worker(Arc::new(move || order.lock().push(tag)))
                    .unwrap(),
            );
        }
        for handle in handles.iter().rev() {
            ctx.set_pending(handle);
        }
        ctx.poll();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        for handle in handles {
            ctx.remove_worker(handle);
        }
    }

    #[test]
    fn removed_worker_does_not_fire() {
        let ctx = AsyncContext::new(0);
        let hits = Arc::new(AtomicU32::new(0));
        let worker = ctx.add_worker(counting_job(&hits)).unwrap();
        ctx.set_pending(&worker);
        ctx.remove_worker(worker);
        ctx.poll();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn timed_workers_fire_in_deadline_order() {
        let ctx = AsyncContext::new(0);
        ctx.bind_to_current_thread();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (tag, delay_ms) in [(1u32, 20u64), (0, 0)] {
            let order = Arc::clone(&order);
            ctx.add_timed_worker(
                Box::new(move || order.lock().push(tag)),
                Duration::from_millis(delay_ms),
            )
            .unwrap_or_else(|_| panic!("registration failed"));
        }
        ctx.wait_until(Instant::now() + Duration::from_millis(40));
        assert_eq!(*order.lock(), vec![0, 1]);
    }

    #[test]
    fn cancelled_timed_worker_never_fires() {
        let ctx = AsyncContext::new(0);
        ctx.bind_to_current_thread();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_in = Arc::clone(&hits);
        let worker = ctx
            .add_timed_worker(
                Box::new(move || {
                    hits_in.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_millis(5),
            )
            .unwrap_or_else(|_| panic!("registration failed"));
        assert!(ctx.remove_timed_worker(&worker));
        ctx.wait_until(Instant::now() + Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn execute_sync_same_core_runs_inline() {
        let ctx = AsyncContext::new(0);
        ctx.bind_to_current_thread();
        let out = ctx.execute_sync(|| 41 + 1).unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn execute_sync_cross_core_blocks_until_done() {
        let ctx = AsyncContext::new(1);
        let stop = Arc::new(AtomicBool::new(false));
        let net = {
            let ctx = Arc::clone(&ctx);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                ctx.bind_to_current_thread();
                while !stop.load(Ordering::SeqCst) {
                    ctx.poll();
                    thread::sleep(Duration::from_micros(200));
                }
            })
        };

        let net_thread = net.thread().id();
        let observed = ctx
            .execute_sync(move || thread::current().id())
            .expect("sync execution");
        assert_eq!(observed, net_thread);

        stop.store(true, Ordering::SeqCst);
        net.join().unwrap();
    }

    #[test]
    fn closed_context_rejects_registration() {
        let ctx = AsyncContext::new(0);
        ctx.close();
        assert_eq!(
            ctx.add_worker(Arc::new(|| {})).unwrap_err(),
            BridgeError::ContextClosed
        );
        assert!(ctx
            .add_timed_worker(Box::new(|| {}), Duration::ZERO)
            .is_err());
    }
}
