//! The public TCP client handle.
//!
//! A [`TcpClient`] owns one connection context at a time and never executes
//! application code inline from stack callbacks: every event is handed off
//! through a [`PerpetualBridge`] so the work runs under the networking
//! context's worker discipline. Mutation of the context happens on the
//! networking core under the context lock; cross-core callers get there
//! through the [`SyncAccessor`](crate::accessor::SyncAccessor) or the
//! context's sync-execute primitive.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;

use truss_bridge::{AsyncContext, EphemeralBridge, PerpetualBridge};

use crate::accessor::SyncAccessor;
use crate::context::{ClientContext, ContextHooks};
use crate::error::{StackError, TcpError};
use crate::stack::{KeepAlive, PcbId, PcbState, TcpStack};
use crate::tx::{CompletionMode, WRITE_STALL_TIMEOUT};

/// Default `stop`/`flush` wait when the caller passes zero.
pub const DEFAULT_FLUSH_WAIT: Duration = Duration::from_millis(300);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

// Process-wide knobs, as on the original surface. The local-port counter is
// only ever advanced from inside the networking context; it is atomic for
// host portability, not for synchronization.
static LOCAL_PORT_START: AtomicU16 = AtomicU16::new(0);
static DEFAULT_NO_DELAY: AtomicBool = AtomicBool::new(true);

/// First local port handed to new connections; 0 leaves binding to the
/// stack.
pub fn set_local_port_start(port: u16) {
    LOCAL_PORT_START.store(port, Ordering::Relaxed);
}

pub fn local_port_start() -> u16 {
    LOCAL_PORT_START.load(Ordering::Relaxed)
}

/// Nagle default applied to every new connection. On by default: the
/// clients this core serves are interactive.
pub fn set_default_no_delay(no_delay: bool) {
    DEFAULT_NO_DELAY.store(no_delay, Ordering::Relaxed);
}

pub fn default_no_delay() -> bool {
    DEFAULT_NO_DELAY.load(Ordering::Relaxed)
}

/// The six bridge slots. Snapshotted into the context's hooks at connect
/// time; replacing a slot affects the next connection.
#[derive(Default)]
struct BridgeSlots {
    connected: Option<Arc<PerpetualBridge<()>>>,
    received: Option<Arc<PerpetualBridge<()>>>,
    fin: Option<Arc<PerpetualBridge<()>>>,
    error: Option<Arc<PerpetualBridge<StackError>>>,
    ack: Option<Arc<PerpetualBridge<u16>>>,
    poll: Option<Arc<PerpetualBridge<()>>>,
}

/// State shared between the handle, the accessor, and in-context workers.
pub(crate) struct ClientInner {
    stack: Arc<dyn TcpStack>,
    net_ctx: Arc<AsyncContext>,
    context: Mutex<Option<Box<ClientContext>>>,
    /// The write CAS: taken by `write`, released by the engine's
    /// completion hook.
    write_busy: AtomicBool,
    slots: Mutex<BridgeSlots>,
    completion_mode: Mutex<CompletionMode>,
    stall_timeout: Mutex<Duration>,
    timeout: Mutex<Duration>,
    client_id: AtomicU8,
}

impl ClientInner {
    pub(crate) fn net_ctx(&self) -> &Arc<AsyncContext> {
        &self.net_ctx
    }

    /// Connection state as the networking core sees it right now. Runs
    /// under the context lock via the accessor.
    pub(crate) fn ts_status(&self) -> PcbState {
        self.context
            .lock()
            .as_ref()
            .map(|context| context.state())
            .unwrap_or(PcbState::Closed)
    }

    /// In-context connect. One context per client: a second connect
    /// without an intervening shutdown is refused.
    pub(crate) fn ts_connect(self: &Arc<Self>, addr: SocketAddr) -> Result<(), TcpError> {
        let mut slot = self.context.lock();
        if slot.is_some() {
            return Err(TcpError::InUse);
        }
        let Some(pcb) = self.stack.create_pcb() else {
            debug!("connect: stack out of pcbs");
            return Err(TcpError::Io);
        };

        let start = local_port_start();
        if start > 0 {
            if let Err(err) = self.stack.bind_local_port(pcb, start) {
                self.stack.abort(pcb);
                return Err(TcpError::Stack(err));
            }
            LOCAL_PORT_START.store(start.wrapping_add(1), Ordering::Relaxed);
        }

        let context = Box::new(ClientContext::new(
            Arc::clone(&self.stack),
            pcb,
            self.build_hooks(),
            *self.completion_mode.lock(),
            *self.stall_timeout.lock(),
            *self.timeout.lock(),
            self.client_id.load(Ordering::Relaxed),
        ));
        {
            let weak = Arc::downgrade(self);
            context.set_write_released(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.write_busy.store(false, Ordering::Release);
                }
            }));
        }
        context.install();

        if let Err(err) = self.stack.connect(pcb, addr) {
            debug!("connect dispatch failed: {err}");
            self.stack.clear_callbacks(pcb);
            self.stack.abort(pcb);
            return Err(TcpError::Stack(err));
        }
        self.stack.set_no_delay(pcb, default_no_delay());
        *slot = Some(context);
        Ok(())
    }

    /// Close the live context, keeping it for a later reconnect inspection.
    fn ts_stop(&self) -> bool {
        match self.context.lock().as_ref() {
            Some(context) => context.close().is_ok(),
            None => true,
        }
    }

    /// Close and destroy the context.
    fn ts_shutdown(&self) -> bool {
        let mut slot = self.context.lock();
        let ok = match slot.as_ref() {
            Some(context) => context.close().is_ok(),
            None => true,
        };
        *slot = None;
        ok
    }

    fn build_hooks(&self) -> ContextHooks {
        fn plain(slot: &Option<Arc<PerpetualBridge<()>>>) -> Box<dyn Fn() + Send + Sync> {
            let slot = slot.clone();
            Box::new(move || {
                if let Some(bridge) = &slot {
                    bridge.run();
                }
            })
        }

        let slots = self.slots.lock();
        let error = slots.error.clone();
        let ack = slots.ack.clone();
        ContextHooks {
            on_connected: plain(&slots.connected),
            on_error: Box::new(move |err| {
                if let Some(bridge) = &error {
                    bridge.run_with(err);
                }
            }),
            on_data: plain(&slots.received),
            on_fin: plain(&slots.fin),
            on_ack: ack.map(|bridge| -> Box<dyn Fn(u16) + Send> {
                Box::new(move |len| bridge.run_with(len))
            }),
            on_poll: plain(&slots.poll),
        }
    }
}

/// Asynchronous TCP client handle.
pub struct TcpClient {
    inner: Arc<ClientInner>,
    accessor: Option<SyncAccessor>,
}

impl TcpClient {
    /// Build a client over `stack`, driven by the networking context
    /// `net_ctx`. The sync accessor is not installed yet; `connect` and
    /// `status` require [`install_sync_accessor`](Self::install_sync_accessor).
    pub fn new(stack: Arc<dyn TcpStack>, net_ctx: Arc<AsyncContext>) -> Self {
        TcpClient {
            inner: Arc::new(ClientInner {
                stack,
                net_ctx,
                context: Mutex::new(None),
                write_busy: AtomicBool::new(false),
                slots: Mutex::new(BridgeSlots::default()),
                completion_mode: Mutex::new(CompletionMode::default()),
                stall_timeout: Mutex::new(WRITE_STALL_TIMEOUT),
                timeout: Mutex::new(DEFAULT_TIMEOUT),
                client_id: AtomicU8::new(0),
            }),
            accessor: None,
        }
    }

    /// Wire the cross-core accessor for `connect`/`status`.
    pub fn install_sync_accessor(&mut self) {
        if self.accessor.is_none() {
            self.accessor = Some(SyncAccessor::new(Arc::clone(&self.inner)));
        }
    }

    pub fn sync_accessor(&self) -> Option<&SyncAccessor> {
        self.accessor.as_ref()
    }

    fn accessor(&self) -> &SyncAccessor {
        // Calling without the accessor is a programming error, not a
        // runtime condition.
        assert!(
            self.accessor.is_some(),
            "sync accessor not installed; call install_sync_accessor first"
        );
        self.accessor
            .as_ref()
            .unwrap_or_else(|| unreachable!("asserted above"))
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Connect to `addr`, dispatching onto the networking core through the
    /// sync accessor.
    pub fn connect(&self, addr: SocketAddr) -> Result<(), TcpError> {
        self.accessor().connect(addr)
    }

    /// Connection state via a synced cross-core read.
    pub fn status(&self) -> PcbState {
        self.accessor().status()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_established()
    }

    /// Flush outstanding writes (bounded by `max_wait`, default 300 ms)
    /// and close the connection. Safe to repeat; a second call finds no
    /// PCB and succeeds.
    pub fn stop(&self, max_wait: Duration) -> bool {
        let flushed = self.flush(max_wait);
        let done = self.run_on_net_core(|inner| inner.ts_stop());
        flushed && done
    }

    /// `stop` plus destruction of the context, readying the client for a
    /// fresh `connect`.
    pub fn shutdown(&self, max_wait: Duration) -> bool {
        self.flush(max_wait);
        self.run_on_net_core(|inner| inner.ts_shutdown())
    }

    /// Wait until no write is in progress. Returns false on deadline.
    pub fn flush(&self, max_wait: Duration) -> bool {
        let wait = if max_wait.is_zero() {
            DEFAULT_FLUSH_WAIT
        } else {
            max_wait
        };
        let deadline = Instant::now() + wait;
        while self.inner.write_busy.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                return false;
            }
            if self.inner.net_ctx.is_on_context_core() {
                // Drive the context ourselves; nobody else will.
                self.inner.net_ctx.poll();
            }
            thread::sleep(Duration::from_micros(200));
        }
        true
    }

    // ── Writing ─────────────────────────────────────────────────────

    /// Hand `buf` to the write engine. The payload is copied; chunking and
    /// completion proceed asynchronously on the networking core.
    pub fn write(&self, buf: &[u8]) -> Result<(), TcpError> {
        assert!(!buf.is_empty(), "write requires a non-empty buffer");
        if self.inner.context.lock().is_none() {
            return Err(TcpError::InvalidState);
        }
        if self
            .inner
            .write_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TcpError::InUse);
        }

        let data = buf.to_vec();
        let inner = Arc::clone(&self.inner);
        let bridge = EphemeralBridge::new(Arc::clone(&self.inner.net_ctx), move || {
            match inner.context.lock().as_ref() {
                Some(context) => context.begin_write(data),
                None => {
                    warn!("write dispatched after shutdown; dropping payload");
                    inner.write_busy.store(false, Ordering::Release);
                }
            }
        });
        if bridge.run(Duration::ZERO).is_err() {
            self.inner.write_busy.store(false, Ordering::Release);
            return Err(TcpError::InvalidState);
        }
        Ok(())
    }

    pub fn is_write_in_progress(&self) -> bool {
        self.inner.write_busy.load(Ordering::Acquire)
    }

    /// Advisory high watermark from the write engine.
    pub fn should_backpressure(&self) -> bool {
        self.inner
            .context
            .lock()
            .as_ref()
            .map(|context| context.writer_should_backpressure())
            .unwrap_or(false)
    }

    /// Advisory low watermark from the write engine.
    pub fn can_release_backpressure(&self) -> bool {
        self.inner
            .context
            .lock()
            .as_ref()
            .map(|context| context.writer_can_release_backpressure())
            .unwrap_or(true)
    }

    /// Free bytes in the stack's send buffer.
    pub fn available_for_write(&self) -> usize {
        self.with_context(|context| context.available_for_write())
            .unwrap_or(0)
    }

    // ── Read-side delegation ────────────────────────────────────────

    /// Next readable byte, or 0 when empty. Does not advance.
    pub fn peek(&self) -> u8 {
        self.with_rx(|rx| rx.peek()).unwrap_or(0)
    }

    /// Bytes readable without crossing a segment boundary.
    pub fn peek_available(&self) -> usize {
        self.with_rx(|rx| rx.peek_available()).unwrap_or(0)
    }

    /// Total unconsumed bytes buffered.
    pub fn available(&self) -> usize {
        self.with_rx(|rx| rx.len()).unwrap_or(0)
    }

    /// Borrow the current segment's readable bytes.
    pub fn with_peek_buffer<R>(&self, f: impl FnOnce(Option<&[u8]>) -> R) -> R {
        match self.inner.context.lock().as_ref() {
            Some(context) => context.with_rx(|rx| f(rx.peek_buffer())),
            None => f(None),
        }
    }

    /// Surrender `n` consumed bytes, crediting the stack's receive window.
    pub fn consume(&self, n: usize) {
        let _ = self.with_rx(|rx| rx.consume(n));
    }

    // ── Callback registration ───────────────────────────────────────
    //
    // Each slot takes a ready-built bridge; the client snapshots them into
    // the context's hooks at connect time.

    pub fn set_on_connected(&self, bridge: PerpetualBridge<()>) {
        self.inner.slots.lock().connected = Some(Arc::new(bridge));
    }

    pub fn set_on_received(&self, bridge: PerpetualBridge<()>) {
        self.inner.slots.lock().received = Some(Arc::new(bridge));
    }

    pub fn set_on_fin(&self, bridge: PerpetualBridge<()>) {
        self.inner.slots.lock().fin = Some(Arc::new(bridge));
    }

    pub fn set_on_error(&self, bridge: PerpetualBridge<StackError>) {
        self.inner.slots.lock().error = Some(Arc::new(bridge));
    }

    pub fn set_on_ack(&self, bridge: PerpetualBridge<u16>) {
        self.inner.slots.lock().ack = Some(Arc::new(bridge));
    }

    pub fn set_on_poll(&self, bridge: PerpetualBridge<()>) {
        self.inner.slots.lock().poll = Some(Arc::new(bridge));
    }

    // ── Tunables ────────────────────────────────────────────────────

    /// Completion policy for subsequent connections. Fixed per writer at
    /// connect; never changes mid-write.
    pub fn set_completion_mode(&self, mode: CompletionMode) {
        *self.inner.completion_mode.lock() = mode;
    }

    /// Stall timeout for subsequent connections' writers.
    pub fn set_stall_timeout(&self, timeout: Duration) {
        *self.inner.stall_timeout.lock() = timeout;
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.inner.timeout.lock() = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self.inner.timeout.lock()
    }

    pub fn set_client_id(&self, id: u8) {
        self.inner.client_id.store(id, Ordering::Relaxed);
    }

    pub fn client_id(&self) -> u8 {
        self.inner.client_id.load(Ordering::Relaxed)
    }

    pub fn set_no_delay(&self, no_delay: bool) {
        let _ = self.with_context(|context| context.set_no_delay(no_delay));
    }

    pub fn no_delay(&self) -> bool {
        self.with_context(|context| context.no_delay())
            .unwrap_or(false)
    }

    pub fn keep_alive(&self, config: KeepAlive) {
        let _ = self.with_context(|context| context.set_keep_alive(Some(config)));
    }

    pub fn disable_keep_alive(&self) {
        let _ = self.with_context(|context| context.set_keep_alive(None));
    }

    pub fn keep_alive_config(&self) -> Option<KeepAlive> {
        self.with_context(|context| context.keep_alive()).flatten()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.with_context(|context| context.remote_addr()).flatten()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.with_context(|context| context.local_addr()).flatten()
    }

    /// The live PCB, for diagnostics.
    pub fn pcb(&self) -> Option<PcbId> {
        self.with_context(|context| context.pcb()).flatten()
    }

    // ── Internals ───────────────────────────────────────────────────

    fn with_context<R>(&self, f: impl FnOnce(&ClientContext) -> R) -> Option<R> {
        self.inner.context.lock().as_ref().map(|context| f(context))
    }

    fn with_rx<R>(&self, f: impl FnOnce(&mut crate::rx::RxBuffer) -> R) -> Option<R> {
        self.with_context(|context| context.with_rx(f))
    }

    /// Run a teardown-side operation on the networking core: inline under
    /// the context lock when already there, synced over otherwise.
    fn run_on_net_core(&self, f: impl FnOnce(&ClientInner) -> bool + Send + 'static) -> bool {
        if self.inner.net_ctx.is_on_context_core() {
            let _lock = self.inner.net_ctx.lock();
            return f(&self.inner);
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .net_ctx
            .execute_sync(move || f(&inner))
            .unwrap_or(false)
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        // Best effort: a live context at drop is released directly. The
        // callbacks are cleared first, so late stack events hit a null arg.
        if let Some(context) = self.inner.context.lock().take() {
            drop(context);
        }
    }
}
