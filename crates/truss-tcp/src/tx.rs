//! Chunked, ACK-driven write engine.
//!
//! A write copies the whole payload into an owned buffer (the caller's
//! buffer need not outlive a multi-chunk transmission), then feeds it to
//! the stack in chunks of `min(remaining, send-buffer-free, MSS)`. ACKs
//! advance the engine and trigger further chunks; a configurable stall
//! timeout abandons a write that makes no progress. The engine is
//! stack-flag-agnostic: chunks leave through a [`ChunkSink`], which owns
//! the flag policy.
//!
//! Networking-core only, like the rest of the connection state.

use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{StackError, StackResult};

/// Outbound path the engine writes through.
///
/// Implemented by the connection context over the raw stack, and by plain
/// mocks in tests.
pub trait ChunkSink: Send {
    /// Free bytes in the stack's send buffer. Read only on the networking
    /// core.
    fn send_buffer_free(&self) -> usize;

    /// Maximum segment size for the connection.
    fn mss(&self) -> usize;

    /// Queue one chunk. `more` hints that further chunks of the same write
    /// follow; how that maps to stack flags is the sink's concern.
    fn write_chunk(&self, chunk: &[u8], more: bool) -> StackResult;
}

/// When a write counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Complete when every byte has been acknowledged by the peer.
    #[default]
    Acked,
    /// Complete when every byte has been queued with the stack.
    Enqueued,
}

/// Default stall timeout: a write with no queue or ACK progress for this
/// long is abandoned.
pub const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(2);

type AckObserver = Box<dyn Fn(u16) + Send>;
type CompletionHook = Box<dyn Fn() + Send>;

/// Stateful writer for one connection.
pub struct TxWriter {
    sink: Box<dyn ChunkSink>,
    mode: CompletionMode,
    stall_timeout: Duration,

    data: Option<Box<[u8]>>,
    total: usize,
    queued: usize,
    acked: usize,
    write_start: Option<Instant>,
    last_progress: Option<Instant>,
    /// Send-buffer headroom at the last chunk attempt, net of what that
    /// attempt queued; feeds the watermark helpers.
    cached_free: usize,

    ack_observer: Option<AckObserver>,
    completion_hook: Option<CompletionHook>,
}

impl TxWriter {
    pub fn new(sink: Box<dyn ChunkSink>, mode: CompletionMode) -> Self {
        TxWriter {
            sink,
            mode,
            stall_timeout: WRITE_STALL_TIMEOUT,
            data: None,
            total: 0,
            queued: 0,
            acked: 0,
            write_start: None,
            last_progress: None,
            cached_free: 0,
            ack_observer: None,
            completion_hook: None,
        }
    }

    /// Override the stall timeout. The completion mode is fixed for the
    /// writer's lifetime; the timeout is the only tunable.
    pub fn set_stall_timeout(&mut self, timeout: Duration) {
        self.stall_timeout = timeout;
    }

    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// Observer run for every ACK that lands while a write is active.
    pub fn set_ack_observer(&mut self, observer: AckObserver) {
        self.ack_observer = Some(observer);
    }

    /// Hook run after the engine resets at completion; the client uses it
    /// to release its write-in-progress flag.
    pub fn set_completion_hook(&mut self, hook: CompletionHook) {
        self.completion_hook = Some(hook);
    }

    pub fn is_write_in_progress(&self) -> bool {
        self.data.is_some()
    }

    /// `(queued, acked, total)` snapshot for logs and tests.
    pub fn counters(&self) -> (usize, usize, usize) {
        (self.queued, self.acked, self.total)
    }

    pub fn in_flight(&self) -> usize {
        self.queued - self.acked
    }

    /// Start a write over an owned copy of the payload and push the first
    /// chunk(s). The caller holds the write-in-progress flag; entering
    /// with a write still active is a protocol violation.
    pub fn begin(&mut self, data: Vec<u8>) {
        debug_assert!(!data.is_empty(), "write size must be non-zero");
        assert!(
            self.data.is_none(),
            "write started while one is in progress"
        );
        self.total = data.len();
        self.queued = 0;
        self.acked = 0;
        self.data = Some(data.into_boxed_slice());
        let now = Instant::now();
        self.write_start = Some(now);
        self.last_progress = Some(now);
        debug!("tx: starting write of {} bytes", self.total);
        self.send_next_chunk();
    }

    /// Queue as much of the remaining payload as the send buffer and MSS
    /// allow. Runs in the networking context.
    pub fn send_next_chunk(&mut self) {
        loop {
            let Some(data) = self.data.as_ref() else {
                trace!("tx: send_next_chunk with no write in progress");
                return;
            };
            let remaining = self.total - self.queued;
            if remaining == 0 {
                // Fully queued; acked mode now waits for the ACKs.
                return;
            }
            let free = self.sink.send_buffer_free();
            self.cached_free = free;
            let chunk = remaining.min(free).min(self.sink.mss());
            if chunk == 0 {
                return; // no space; the next ACK re-enters
            }
            let more = chunk < remaining;
            if let Err(err) = self
                .sink
                .write_chunk(&data[self.queued..self.queued + chunk], more)
            {
                debug!("tx: chunk of {chunk} rejected ({err}); deferring");
                return;
            }
            self.cached_free = free - chunk;
            self.queued += chunk;
            self.last_progress = Some(Instant::now());
            trace!("tx: queued {}/{} bytes", self.queued, self.total);
            if self.mode == CompletionMode::Enqueued && self.queued == self.total {
                self.complete_write();
                return;
            }
        }
    }

    /// Account `len` acknowledged bytes and keep the write moving.
    pub fn on_ack(&mut self, len: u16) {
        if !self.is_write_in_progress() {
            debug!("tx: ack of {len} with no write in progress");
            return;
        }
        self.acked += usize::from(len);
        assert!(
            self.acked <= self.total,
            "acked {} of {} total: protocol violation",
            self.acked,
            self.total
        );
        self.last_progress = Some(Instant::now());
        if let Some(observer) = &self.ack_observer {
            observer(len);
        }
        if self.mode == CompletionMode::Acked && self.acked == self.total {
            debug!("tx: all {} bytes acked, write complete", self.total);
            self.complete_write();
            return;
        }
        if self.queued < self.total {
            // The ACK freed send-buffer space for unqueued bytes.
            self.send_next_chunk();
        }
    }

    /// A connection-level failure ends the write and releases the buffer.
    pub fn on_error(&mut self, err: StackError) {
        if self.is_write_in_progress() {
            warn!(
                "tx: write abandoned at {}/{} bytes: {err}",
                self.acked, self.total
            );
        }
        self.complete_write();
    }

    /// Whether the active write has gone `stall_timeout` without queue or
    /// ACK progress.
    pub fn has_timed_out(&self) -> bool {
        match self.last_progress {
            Some(progress) => progress.elapsed() >= self.stall_timeout,
            None => false,
        }
    }

    /// Poll-path reaction to a detected stall.
    pub fn on_write_timeout(&mut self) {
        if let Some(start) = self.write_start {
            warn!(
                "tx: write stalled after {:?} at {}/{} bytes, abandoning",
                start.elapsed(),
                self.acked,
                self.total
            );
        }
        self.complete_write();
    }

    // ── Backpressure advice ─────────────────────────────────────────
    //
    // Advisory only; the writer itself never blocks.

    /// High watermark: in-flight at or above 70 % of the window.
    pub fn should_backpressure(&self) -> bool {
        let window = self.cached_free + self.in_flight();
        window > 0 && self.in_flight() * 10 >= window * 7
    }

    /// Low watermark: in-flight back at or below 50 % of the window.
    pub fn can_release_backpressure(&self) -> bool {
        let window = self.cached_free + self.in_flight();
        self.in_flight() * 10 <= window * 5
    }

    /// Release the owned buffer, zero the counters and timestamps, and let
    /// the client drop its write-in-progress flag.
    fn complete_write(&mut self) {
        self.data = None;
        self.total = 0;
        self.queued = 0;
        self.acked = 0;
        self.write_start = None;
        self.last_progress = None;
        if let Some(hook) = &self.completion_hook {
            hook();
        }
    }
}
