//! Per-connection context: the stack's view of one client.
//!
//! A [`ClientContext`] owns the PCB, the receive buffer and the write
//! engine, and is the single untyped pointer the stack carries in its `arg`
//! slot. The C-linkage trampolines below recover the context on entry,
//! validate it, and fan events out to the client's installed hooks. All of
//! this runs on the networking core; the context is created by the
//! client's in-context connect and destroyed at shutdown, never shared
//! between clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{StackError, StackResult};
use crate::rx::RxBuffer;
use crate::stack::{CallbackTable, KeepAlive, PcbId, PcbState, Segment, TcpStack, WriteFlags};
use crate::tx::{ChunkSink, CompletionMode, TxWriter};

type Hook = Box<dyn Fn() + Send + Sync>;
type ErrorHook = Box<dyn Fn(StackError) + Send + Sync>;
type AckHook = Box<dyn Fn(u16) + Send>;
type RxHook = Box<dyn Fn() + Send>;

/// The six event hooks a client installs before the context goes live.
pub(crate) struct ContextHooks {
    pub on_connected: Hook,
    pub on_error: ErrorHook,
    pub on_data: RxHook,
    pub on_fin: RxHook,
    pub on_ack: Option<AckHook>,
    pub on_poll: Hook,
}

impl Default for ContextHooks {
    fn default() -> Self {
        ContextHooks {
            on_connected: Box::new(|| {}),
            on_error: Box::new(|_| {}),
            on_data: Box::new(|| {}),
            on_fin: Box::new(|| {}),
            on_ack: None,
            on_poll: Box::new(|| {}),
        }
    }
}

/// Outbound path of the write engine: raw enqueue plus the flag policy.
/// Always copy (the engine's buffer dies at completion), and signal `more`
/// while chunks of the same write remain.
struct StackSink {
    stack: Arc<dyn TcpStack>,
    pcb: PcbId,
}

impl ChunkSink for StackSink {
    fn send_buffer_free(&self) -> usize {
        self.stack.send_buffer_free(self.pcb)
    }

    fn mss(&self) -> usize {
        self.stack.mss(self.pcb)
    }

    fn write_chunk(&self, chunk: &[u8], more: bool) -> StackResult {
        self.stack
            .enqueue(self.pcb, chunk, WriteFlags { copy: true, more })?;
        self.stack.push_output(self.pcb)
    }
}

/// Wrapper of one connection's control block and buffers.
pub struct ClientContext {
    stack: Arc<dyn TcpStack>,
    pcb: Mutex<Option<PcbId>>,
    rx: Mutex<RxBuffer>,
    tx: Mutex<TxWriter>,
    on_connected: Hook,
    on_error: ErrorHook,
    on_poll: Hook,
    timeout: Duration,
    client_id: u8,
}

impl ClientContext {
    pub(crate) fn new(
        stack: Arc<dyn TcpStack>,
        pcb: PcbId,
        hooks: ContextHooks,
        mode: CompletionMode,
        stall_timeout: Duration,
        timeout: Duration,
        client_id: u8,
    ) -> Self {
        let mut rx = RxBuffer::new(Arc::clone(&stack));
        rx.bind_pcb(pcb);
        rx.set_on_data(hooks.on_data);
        rx.set_on_fin(hooks.on_fin);

        let sink = StackSink {
            stack: Arc::clone(&stack),
            pcb,
        };
        let mut tx = TxWriter::new(Box::new(sink), mode);
        tx.set_stall_timeout(stall_timeout);
        if let Some(observer) = hooks.on_ack {
            tx.set_ack_observer(observer);
        }

        ClientContext {
            stack,
            pcb: Mutex::new(Some(pcb)),
            rx: Mutex::new(rx),
            tx: Mutex::new(tx),
            on_connected: hooks.on_connected,
            on_error: hooks.on_error,
            on_poll: hooks.on_poll,
            timeout,
            client_id,
        }
    }

    /// Register the fixed callback set with `self` as the stack's `arg`.
    ///
    /// The context must already be heap-boxed: the registered address has
    /// to stay stable until `close` clears the callbacks.
    pub(crate) fn install(&self) {
        if let Some(pcb) = *self.pcb.lock() {
            let arg = self as *const ClientContext as *mut ();
            self.stack.install_callbacks(pcb, arg, Self::callback_table());
        }
    }

    fn callback_table() -> CallbackTable {
        CallbackTable {
            connected: connected_trampoline,
            recv: recv_trampoline,
            sent: sent_trampoline,
            error: error_trampoline,
            poll: poll_trampoline,
        }
    }

    pub fn pcb(&self) -> Option<PcbId> {
        *self.pcb.lock()
    }

    pub fn state(&self) -> PcbState {
        match *self.pcb.lock() {
            Some(pcb) => self.stack.state(pcb),
            None => PcbState::Closed,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn client_id(&self) -> u8 {
        self.client_id
    }

    pub fn available_for_write(&self) -> usize {
        match *self.pcb.lock() {
            Some(pcb) => self.stack.send_buffer_free(pcb),
            None => 0,
        }
    }

    pub fn set_no_delay(&self, no_delay: bool) {
        if let Some(pcb) = *self.pcb.lock() {
            self.stack.set_no_delay(pcb, no_delay);
        }
    }

    pub fn no_delay(&self) -> bool {
        match *self.pcb.lock() {
            Some(pcb) => self.stack.no_delay(pcb),
            None => false,
        }
    }

    pub fn set_keep_alive(&self, config: Option<KeepAlive>) {
        if let Some(pcb) = *self.pcb.lock() {
            self.stack.set_keep_alive(pcb, config);
        }
    }

    pub fn keep_alive(&self) -> Option<KeepAlive> {
        (*self.pcb.lock()).and_then(|pcb| self.stack.keep_alive(pcb))
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        (*self.pcb.lock()).and_then(|pcb| self.stack.remote_addr(pcb))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        (*self.pcb.lock()).and_then(|pcb| self.stack.local_addr(pcb))
    }

    /// Run `f` against the receive buffer. Read-side delegation for the
    /// client's peek/consume surface.
    pub(crate) fn with_rx<R>(&self, f: impl FnOnce(&mut RxBuffer) -> R) -> R {
        f(&mut self.rx.lock())
    }

    pub(crate) fn set_write_released(&self, hook: Box<dyn Fn() + Send>) {
        self.tx.lock().set_completion_hook(hook);
    }

    /// Hand an owned payload to the write engine. In-context only.
    pub(crate) fn begin_write(&self, data: Vec<u8>) {
        self.tx.lock().begin(data);
    }

    pub(crate) fn writer_should_backpressure(&self) -> bool {
        self.tx.lock().should_backpressure()
    }

    pub(crate) fn writer_can_release_backpressure(&self) -> bool {
        self.tx.lock().can_release_backpressure()
    }

    /// Graceful teardown: callbacks first, then any outstanding write and
    /// the pending RX chain, then the stack close with abort as the
    /// fallback. Idempotent.
    pub fn close(&self) -> StackResult {
        let Some(pcb) = self.pcb.lock().take() else {
            return Ok(());
        };
        debug!("client {}: closing pcb {}", self.client_id, pcb.index());
        self.stack.clear_callbacks(pcb);
        // No ACK will ever land now; an in-flight write must fail over so
        // its owner's write flag is released.
        self.tx.lock().on_error(StackError::Closed);
        self.rx.lock().reset();
        match self.stack.close(pcb) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    "client {}: close failed ({err}), aborting",
                    self.client_id
                );
                self.stack.abort(pcb);
                Err(StackError::Aborted)
            }
        }
    }

    /// Hard teardown. Same ordering as `close`, no graceful attempt.
    pub fn abort(&self) {
        let Some(pcb) = self.pcb.lock().take() else {
            return;
        };
        self.stack.clear_callbacks(pcb);
        self.tx.lock().on_error(StackError::Aborted);
        self.rx.lock().reset();
        self.stack.abort(pcb);
    }

    // ── Event handlers (networking core, via the trampolines) ───────

    fn handle_connected(&self, err: StackResult) -> StackResult {
        match err {
            Ok(()) => {
                debug!("client {}: connected", self.client_id);
                (self.on_connected)();
                Ok(())
            }
            Err(e) => {
                warn!("client {}: connect failed: {e}", self.client_id);
                (self.on_error)(e);
                Ok(())
            }
        }
    }

    fn handle_recv(
        &self,
        pcb: PcbId,
        chain: Option<Box<Segment>>,
        err: StackResult,
    ) -> StackResult {
        if let Err(e) = err {
            // The chain (if any) drops here, freeing its buffers.
            warn!("client {}: receive error {e}", self.client_id);
            return Err(e);
        }
        match chain {
            Some(chain) => {
                let mut rx = self.rx.lock();
                rx.bind_pcb(pcb);
                rx.accept(chain);
                rx.notify_data();
                Ok(())
            }
            None => {
                // FIN. Buffered data stays readable; the writer learns the
                // peer is gone; the abort sentinel stops further receives.
                debug!("client {}: FIN from peer", self.client_id);
                self.rx.lock().notify_fin();
                self.tx.lock().on_error(StackError::Closed);
                Err(StackError::Aborted)
            }
        }
    }

    fn handle_sent(&self, len: u16) -> StackResult {
        self.tx.lock().on_ack(len);
        Ok(())
    }

    fn handle_error(&self, err: StackError) {
        warn!(
            "client {}: stack error {} ({err})",
            self.client_id,
            self.stack.err_to_str(err)
        );
        // The stack has already freed the PCB.
        *self.pcb.lock() = None;
        self.rx.lock().clear_pcb();
        self.tx.lock().on_error(err);
        (self.on_error)(err);
    }

    fn handle_poll(&self) -> StackResult {
        {
            let mut tx = self.tx.lock();
            if tx.has_timed_out() {
                tx.on_write_timeout();
            }
        }
        (self.on_poll)();
        Ok(())
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ── Trampolines ─────────────────────────────────────────────────────
//
// The stack hands back the registered `arg`; a null arg (teardown race)
// answers with the ok sentinel.

fn recover(arg: *mut ()) -> Option<&'static ClientContext> {
    // Lifetime is a lie the registration contract makes true: the arg is
    // cleared before the context is dropped.
    unsafe { (arg as *const ClientContext).as_ref() }
}

fn connected_trampoline(arg: *mut (), _pcb: PcbId, err: StackResult) -> StackResult {
    match recover(arg) {
        Some(context) => context.handle_connected(err),
        None => Ok(()),
    }
}

fn recv_trampoline(
    arg: *mut (),
    pcb: PcbId,
    chain: Option<Box<Segment>>,
    err: StackResult,
) -> StackResult {
    match recover(arg) {
        Some(context) => context.handle_recv(pcb, chain, err),
        None => Ok(()),
    }
}

fn sent_trampoline(arg: *mut (), _pcb: PcbId, len: u16) -> StackResult {
    match recover(arg) {
        Some(context) => context.handle_sent(len),
        None => Ok(()),
    }
}

fn error_trampoline(arg: *mut (), err: StackError) {
    if let Some(context) = recover(arg) {
        context.handle_error(err);
    }
}

fn poll_trampoline(arg: *mut (), _pcb: PcbId) -> StackResult {
    match recover(arg) {
        Some(context) => context.handle_poll(),
        None => Ok(()),
    }
}
