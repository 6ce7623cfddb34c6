//! The seam to the raw TCP stack.
//!
//! The production stack (lwIP's raw API on the networking core) and the
//! scripted in-memory stack used by the tests both sit behind [`TcpStack`].
//! The contract mirrors the raw callback API: per-PCB operations, a fixed
//! table of C-style callbacks registered with a single untyped `arg`
//! pointer, and inbound data delivered as a singly-linked segment chain.
//!
//! Everything here is only legal to call from the networking core, with two
//! exceptions noted on the trait methods.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{StackError, StackResult};

/// Default maximum segment size for a connection.
pub const DEFAULT_MSS: usize = 1460;

/// Opaque per-connection control block handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcbId(pub(crate) usize);

impl PcbId {
    /// Raw table index, for log lines only.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Connection state as reported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PcbState {
    #[default]
    Closed,
    SynSent,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl PcbState {
    pub fn is_established(self) -> bool {
        self == PcbState::Established
    }
}

/// Flag policy for one enqueued chunk.
///
/// `copy` asks the stack to copy the chunk into its own buffers; `more`
/// hints that further chunks of the same write follow, so the stack may
/// coalesce. Which flags to use is the write callback's decision, never the
/// write engine's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFlags {
    pub copy: bool,
    pub more: bool,
}

/// Keep-alive probe configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub idle: Duration,
    pub interval: Duration,
    pub probes: u8,
}

impl Default for KeepAlive {
    fn default() -> Self {
        KeepAlive {
            idle: Duration::from_secs(7200),
            interval: Duration::from_secs(75),
            probes: 9,
        }
    }
}

// ── Segment chains ──────────────────────────────────────────────────

/// One node of an inbound packet-buffer chain.
///
/// Ownership is exclusive: whoever holds the boxed head owns the whole
/// chain, and dropping the head frees every segment behind it. This
/// replaces the stack's reference-counted buffers with strict lifetime.
pub struct Segment {
    payload: Bytes,
    next: Option<Box<Segment>>,
}

impl Segment {
    /// Wrap a payload in a single-node chain.
    pub fn new(payload: impl Into<Bytes>) -> Box<Segment> {
        let payload = payload.into();
        debug_assert!(!payload.is_empty(), "stack never delivers empty segments");
        Box::new(Segment {
            payload,
            next: None,
        })
    }

    /// Build a chain with one node per slice. `None` when `slices` is empty.
    pub fn from_slices<S: AsRef<[u8]>>(slices: &[S]) -> Option<Box<Segment>> {
        let mut head: Option<Box<Segment>> = None;
        for slice in slices.iter().rev() {
            let mut node = Segment::new(Bytes::copy_from_slice(slice.as_ref()));
            node.next = head.take();
            head = Some(node);
        }
        head
    }

    /// Bytes in this segment only.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Bytes across the whole chain from this node on.
    pub fn total_len(&self) -> usize {
        let mut total = 0;
        let mut node = Some(self);
        while let Some(segment) = node {
            total += segment.payload.len();
            node = segment.next.as_deref();
        }
        total
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn next(&self) -> Option<&Segment> {
        self.next.as_deref()
    }

    /// Detach and return the rest of the chain.
    pub fn take_next(&mut self) -> Option<Box<Segment>> {
        self.next.take()
    }

    /// Append `tail` after the last node of `self`'s chain.
    pub fn chain(&mut self, tail: Box<Segment>) {
        let mut node = self;
        loop {
            let current = node;
            match current.next {
                Some(ref mut next) => node = next,
                None => {
                    current.next = Some(tail);
                    return;
                }
            }
        }
    }
}

// ── Callback table ──────────────────────────────────────────────────
//
// The `arg` slot carries exactly one untyped pointer, registered by the
// connection context and recovered by the trampolines. Every trampoline's
// first act is to validate `arg`; a null arg (teardown races) answers the
// stack with the ok sentinel.

pub type ConnectedFn = fn(arg: *mut (), pcb: PcbId, err: StackResult) -> StackResult;
/// `chain == None` signals FIN. Returning `Err(StackError::Aborted)` tells
/// the stack to deliver no further receives on this PCB.
pub type RecvFn = fn(arg: *mut (), pcb: PcbId, chain: Option<Box<Segment>>, err: StackResult) -> StackResult;
pub type SentFn = fn(arg: *mut (), pcb: PcbId, len: u16) -> StackResult;
/// No PCB: by the time the stack reports a fatal error the PCB is gone.
pub type ErrorFn = fn(arg: *mut (), err: StackError);
pub type PollFn = fn(arg: *mut (), pcb: PcbId) -> StackResult;

/// The fixed set of callbacks registered per PCB.
#[derive(Clone, Copy)]
pub struct CallbackTable {
    pub connected: ConnectedFn,
    pub recv: RecvFn,
    pub sent: SentFn,
    pub error: ErrorFn,
    pub poll: PollFn,
}

// ── Stack trait ─────────────────────────────────────────────────────

/// Raw per-connection operations of the TCP stack.
///
/// All methods must be called on the networking core under the context
/// lock, except `send_buffer_free` and `state`, which are reads the sync
/// accessor may issue while holding that lock from any core.
pub trait TcpStack: Send + Sync {
    /// Allocate a control block. `None` when the stack is out of PCBs.
    fn create_pcb(&self) -> Option<PcbId>;

    /// Register the callback table and the untyped `arg` recovered by the
    /// trampolines. `arg` must stay valid until `clear_callbacks`.
    fn install_callbacks(&self, pcb: PcbId, arg: *mut (), table: CallbackTable);

    /// Null the `arg` slot and drop the callbacks. First step of teardown.
    fn clear_callbacks(&self, pcb: PcbId);

    fn bind_local_port(&self, pcb: PcbId, port: u16) -> StackResult;

    /// Start the three-way handshake; completion arrives via `connected`.
    fn connect(&self, pcb: PcbId, remote: SocketAddr) -> StackResult;

    /// Graceful close. The PCB is invalid afterwards regardless of result.
    fn close(&self, pcb: PcbId) -> StackResult;

    /// Hard abort. Never fails; the PCB is gone.
    fn abort(&self, pcb: PcbId);

    /// Queue one chunk for transmission.
    fn enqueue(&self, pcb: PcbId, data: &[u8], flags: WriteFlags) -> StackResult;

    /// Flush queued data onto the wire.
    fn push_output(&self, pcb: PcbId) -> StackResult;

    /// Free bytes in the send buffer.
    fn send_buffer_free(&self, pcb: PcbId) -> usize;

    /// Maximum segment size for this connection.
    fn mss(&self, pcb: PcbId) -> usize;

    /// Return `n` bytes of receive-window credit. `n` is bounded by the
    /// stack's 16-bit width; consumers chunk larger counts.
    fn mark_consumed(&self, pcb: PcbId, n: u16);

    fn state(&self, pcb: PcbId) -> PcbState;

    fn set_no_delay(&self, pcb: PcbId, no_delay: bool);

    fn no_delay(&self, pcb: PcbId) -> bool;

    /// `None` disables keep-alive probing.
    fn set_keep_alive(&self, pcb: PcbId, config: Option<KeepAlive>);

    fn keep_alive(&self, pcb: PcbId) -> Option<KeepAlive>;

    fn remote_addr(&self, pcb: PcbId) -> Option<SocketAddr>;

    fn local_addr(&self, pcb: PcbId) -> Option<SocketAddr>;

    fn err_to_str(&self, err: StackError) -> &'static str {
        match err {
            StackError::Memory => "ERR_MEM",
            StackError::Buffer => "ERR_BUF",
            StackError::Timeout => "ERR_TIMEOUT",
            StackError::Routing => "ERR_RTE",
            StackError::InProgress => "ERR_INPROGRESS",
            StackError::Value => "ERR_VAL",
            StackError::WouldBlock => "ERR_WOULDBLOCK",
            StackError::Used => "ERR_USE",
            StackError::Already => "ERR_ALREADY",
            StackError::NotConnected => "ERR_CONN",
            StackError::Interface => "ERR_IF",
            StackError::Aborted => "ERR_ABRT",
            StackError::Reset => "ERR_RST",
            StackError::Closed => "ERR_CLSD",
            StackError::Argument => "ERR_ARG",
        }
    }
}
