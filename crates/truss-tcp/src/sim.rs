//! Scripted in-memory stack.
//!
//! [`SimStack`] implements [`TcpStack`] over a slab of fake PCBs and lets a
//! test script the far end: complete handshakes, deliver segment chains,
//! FINs and errors, acknowledge sent bytes, and tick the poll timer. Every
//! raw call the client core makes is recorded so tests can assert on chunk
//! sizes, flags, and receive-window credit.
//!
//! The script methods invoke the registered callbacks synchronously, so
//! they must be called from the thread standing in for the networking core,
//! exactly like the real stack's deferred-dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use slab::Slab;

use crate::error::{StackError, StackResult};
use crate::stack::{
    CallbackTable, KeepAlive, PcbId, PcbState, Segment, TcpStack, WriteFlags, DEFAULT_MSS,
};

/// Tunables for a simulated connection.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub mss: usize,
    pub send_buffer: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            mss: DEFAULT_MSS,
            send_buffer: 2 * DEFAULT_MSS,
        }
    }
}

struct SimPcb {
    state: PcbState,
    local_port: u16,
    remote: Option<SocketAddr>,
    send_free: usize,
    unacked: usize,
    no_delay: bool,
    keep_alive: Option<KeepAlive>,
    arg: usize,
    callbacks: Option<CallbackTable>,
    /// Set when the recv callback answered with the abort sentinel.
    recv_stopped: bool,
    chunks: Vec<(usize, WriteFlags)>,
    recved: Vec<u16>,
    output_calls: u32,
}

impl SimPcb {
    fn new(send_buffer: usize) -> Self {
        SimPcb {
            state: PcbState::Closed,
            local_port: 0,
            remote: None,
            send_free: send_buffer,
            unacked: 0,
            no_delay: false,
            keep_alive: None,
            arg: 0,
            callbacks: None,
            recv_stopped: false,
            chunks: Vec::new(),
            recved: Vec::new(),
            output_calls: 0,
        }
    }
}

/// In-memory [`TcpStack`] with a scripting surface for tests.
pub struct SimStack {
    config: SimConfig,
    pcbs: Mutex<Slab<SimPcb>>,
}

impl SimStack {
    pub fn new() -> Arc<Self> {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Arc<Self> {
        Arc::new(SimStack {
            config,
            pcbs: Mutex::new(Slab::new()),
        })
    }

    pub fn config(&self) -> SimConfig {
        self.config
    }

    /// The most recently allocated PCB, for scripts that let the client
    /// allocate.
    pub fn newest_pcb(&self) -> Option<PcbId> {
        self.pcbs.lock().iter().map(|(key, _)| PcbId(key)).last()
    }

    // ── Script surface ──────────────────────────────────────────────

    /// Complete a pending handshake and fire the `connected` callback.
    pub fn complete_connect(&self, pcb: PcbId) -> StackResult {
        {
            let mut pcbs = self.pcbs.lock();
            let record = pcbs.get_mut(pcb.0).ok_or(StackError::Argument)?;
            if record.state != PcbState::SynSent {
                return Err(StackError::NotConnected);
            }
            record.state = PcbState::Established;
        }
        if let Some((table, arg)) = self.callback_entry(pcb) {
            return (table.connected)(arg, pcb, Ok(()));
        }
        Ok(())
    }

    /// Deliver an inbound chain through the `recv` callback. Honors a
    /// previous abort answer by dropping the chain.
    pub fn deliver(&self, pcb: PcbId, chain: Box<Segment>) -> StackResult {
        if self.recv_stopped(pcb) {
            debug!("sim: receive stopped on pcb {}, dropping chain", pcb.index());
            return Err(StackError::Closed);
        }
        match self.callback_entry(pcb) {
            Some((table, arg)) => {
                let result = (table.recv)(arg, pcb, Some(chain), Ok(()));
                if result == Err(StackError::Aborted) {
                    self.set_recv_stopped(pcb);
                }
                result
            }
            None => Ok(()),
        }
    }

    /// Deliver a receive with a stack-reported error, as the real stack
    /// does when a segment arrives broken.
    pub fn deliver_recv_err(
        &self,
        pcb: PcbId,
        chain: Option<Box<Segment>>,
        err: StackError,
    ) -> StackResult {
        match self.callback_entry(pcb) {
            Some((table, arg)) => (table.recv)(arg, pcb, chain, Err(err)),
            None => Ok(()),
        }
    }

    /// Deliver FIN: a receive with no chain.
    pub fn deliver_fin(&self, pcb: PcbId) -> StackResult {
        {
            let mut pcbs = self.pcbs.lock();
            if let Some(record) = pcbs.get_mut(pcb.0) {
                record.state = PcbState::CloseWait;
            }
        }
        match self.callback_entry(pcb) {
            Some((table, arg)) => {
                let result = (table.recv)(arg, pcb, None, Ok(()));
                if result == Err(StackError::Aborted) {
                    self.set_recv_stopped(pcb);
                }
                result
            }
            None => Ok(()),
        }
    }

    /// Acknowledge `len` sent bytes: frees send-buffer space, then fires
    /// the `sent` callback.
    pub fn deliver_ack(&self, pcb: PcbId, len: u16) -> StackResult {
        {
            let mut pcbs = self.pcbs.lock();
            let record = pcbs.get_mut(pcb.0).ok_or(StackError::Argument)?;
            let len = usize::from(len);
            if len > record.unacked {
                warn!(
                    "sim: ack of {len} exceeds {} unacked on pcb {}",
                    record.unacked,
                    pcb.index()
                );
            }
            record.unacked = record.unacked.saturating_sub(len);
            record.send_free = (record.send_free + len).min(self.config.send_buffer);
        }
        match self.callback_entry(pcb) {
            Some((table, arg)) => (table.sent)(arg, pcb, len),
            None => Ok(()),
        }
    }

    /// Fire the periodic `poll` callback once.
    pub fn tick_poll(&self, pcb: PcbId) -> StackResult {
        match self.callback_entry(pcb) {
            Some((table, arg)) => (table.poll)(arg, pcb),
            None => Ok(()),
        }
    }

    /// Kill the connection with a fatal stack error. The PCB is freed
    /// before the callback runs, as on the real stack.
    pub fn fail_connection(&self, pcb: PcbId, err: StackError) {
        let entry = self.callback_entry(pcb);
        if self.pcbs.lock().try_remove(pcb.0).is_none() {
            warn!("sim: fail_connection on unknown pcb {}", pcb.index());
        }
        if let Some((table, arg)) = entry {
            (table.error)(arg, err);
        }
    }

    // ── Inspection ──────────────────────────────────────────────────

    /// Chunk sizes and flags in enqueue order.
    pub fn chunk_log(&self, pcb: PcbId) -> Vec<(usize, WriteFlags)> {
        self.pcbs
            .lock()
            .get(pcb.0)
            .map(|record| record.chunks.clone())
            .unwrap_or_default()
    }

    /// Receive-window credits in notification order.
    pub fn recved_log(&self, pcb: PcbId) -> Vec<u16> {
        self.pcbs
            .lock()
            .get(pcb.0)
            .map(|record| record.recved.clone())
            .unwrap_or_default()
    }

    pub fn recved_total(&self, pcb: PcbId) -> u64 {
        self.recved_log(pcb).iter().map(|&n| u64::from(n)).sum()
    }

    pub fn unacked(&self, pcb: PcbId) -> usize {
        self.pcbs
            .lock()
            .get(pcb.0)
            .map(|record| record.unacked)
            .unwrap_or_default()
    }

    pub fn output_calls(&self, pcb: PcbId) -> u32 {
        self.pcbs
            .lock()
            .get(pcb.0)
            .map(|record| record.output_calls)
            .unwrap_or_default()
    }

    pub fn bound_local_port(&self, pcb: PcbId) -> u16 {
        self.pcbs
            .lock()
            .get(pcb.0)
            .map(|record| record.local_port)
            .unwrap_or_default()
    }

    pub fn is_recv_stopped(&self, pcb: PcbId) -> bool {
        self.recv_stopped(pcb)
    }

    /// PCBs not yet closed; teardown tests expect this to reach zero.
    pub fn open_pcbs(&self) -> usize {
        self.pcbs
            .lock()
            .iter()
            .filter(|(_, record)| record.state != PcbState::Closed)
            .count()
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Snapshot the callback table outside the PCB lock: callbacks
    /// re-enter the stack (enqueue from the ack path), so they must run
    /// unlocked.
    fn callback_entry(&self, pcb: PcbId) -> Option<(CallbackTable, *mut ())> {
        let pcbs = self.pcbs.lock();
        let record = pcbs.get(pcb.0)?;
        record
            .callbacks
            .map(|table| (table, record.arg as *mut ()))
    }

    fn recv_stopped(&self, pcb: PcbId) -> bool {
        self.pcbs
            .lock()
            .get(pcb.0)
            .map(|record| record.recv_stopped)
            .unwrap_or(true)
    }

    fn set_recv_stopped(&self, pcb: PcbId) {
        if let Some(record) = self.pcbs.lock().get_mut(pcb.0) {
            record.recv_stopped = true;
        }
    }
}

impl TcpStack for SimStack {
    fn create_pcb(&self) -> Option<PcbId> {
        let key = self.pcbs.lock().insert(SimPcb::new(self.config.send_buffer));
        Some(PcbId(key))
    }

    fn install_callbacks(&self, pcb: PcbId, arg: *mut (), table: CallbackTable) {
        if let Some(record) = self.pcbs.lock().get_mut(pcb.0) {
            record.arg = arg as usize;
            record.callbacks = Some(table);
        }
    }

    fn clear_callbacks(&self, pcb: PcbId) {
        if let Some(record) = self.pcbs.lock().get_mut(pcb.0) {
            record.arg = 0;
            record.callbacks = None;
        }
    }

    fn bind_local_port(&self, pcb: PcbId, port: u16) -> StackResult {
        let mut pcbs = self.pcbs.lock();
        let record = pcbs.get_mut(pcb.0).ok_or(StackError::Argument)?;
        record.local_port = port;
        Ok(())
    }

    fn connect(&self, pcb: PcbId, remote: SocketAddr) -> StackResult {
        let mut pcbs = self.pcbs.lock();
        let record = pcbs.get_mut(pcb.0).ok_or(StackError::Argument)?;
        if record.state != PcbState::Closed {
            return Err(StackError::Already);
        }
        record.remote = Some(remote);
        record.state = PcbState::SynSent;
        Ok(())
    }

    fn close(&self, pcb: PcbId) -> StackResult {
        let mut pcbs = self.pcbs.lock();
        let record = pcbs.get_mut(pcb.0).ok_or(StackError::Argument)?;
        record.state = PcbState::Closed;
        Ok(())
    }

    fn abort(&self, pcb: PcbId) {
        let mut pcbs = self.pcbs.lock();
        if let Some(record) = pcbs.get_mut(pcb.0) {
            record.state = PcbState::Closed;
            record.callbacks = None;
            record.arg = 0;
        }
    }

    fn enqueue(&self, pcb: PcbId, data: &[u8], flags: WriteFlags) -> StackResult {
        let mut pcbs = self.pcbs.lock();
        let record = pcbs.get_mut(pcb.0).ok_or(StackError::Argument)?;
        if record.state == PcbState::Closed {
            return Err(StackError::NotConnected);
        }
        if data.len() > record.send_free {
            return Err(StackError::Memory);
        }
        record.send_free -= data.len();
        record.unacked += data.len();
        record.chunks.push((data.len(), flags));
        Ok(())
    }

    fn push_output(&self, pcb: PcbId) -> StackResult {
        let mut pcbs = self.pcbs.lock();
        let record = pcbs.get_mut(pcb.0).ok_or(StackError::Argument)?;
        record.output_calls += 1;
        Ok(())
    }

    fn send_buffer_free(&self, pcb: PcbId) -> usize {
        self.pcbs
            .lock()
            .get(pcb.0)
            .map(|record| record.send_free)
            .unwrap_or_default()
    }

    fn mss(&self, _pcb: PcbId) -> usize {
        self.config.mss
    }

    fn mark_consumed(&self, pcb: PcbId, n: u16) {
        debug_assert!(n > 0, "zero-credit window update");
        if let Some(record) = self.pcbs.lock().get_mut(pcb.0) {
            record.recved.push(n);
        }
    }

    fn state(&self, pcb: PcbId) -> PcbState {
        self.pcbs
            .lock()
            .get(pcb.0)
            .map(|record| record.state)
            .unwrap_or_default()
    }

    fn set_no_delay(&self, pcb: PcbId, no_delay: bool) {
        if let Some(record) = self.pcbs.lock().get_mut(pcb.0) {
            record.no_delay = no_delay;
        }
    }

    fn no_delay(&self, pcb: PcbId) -> bool {
        self.pcbs
            .lock()
            .get(pcb.0)
            .map(|record| record.no_delay)
            .unwrap_or_default()
    }

    fn set_keep_alive(&self, pcb: PcbId, config: Option<KeepAlive>) {
        if let Some(record) = self.pcbs.lock().get_mut(pcb.0) {
            record.keep_alive = config;
        }
    }

    fn keep_alive(&self, pcb: PcbId) -> Option<KeepAlive> {
        self.pcbs.lock().get(pcb.0).and_then(|record| record.keep_alive)
    }

    fn remote_addr(&self, pcb: PcbId) -> Option<SocketAddr> {
        self.pcbs.lock().get(pcb.0).and_then(|record| record.remote)
    }

    fn local_addr(&self, pcb: PcbId) -> Option<SocketAddr> {
        let pcbs = self.pcbs.lock();
        let record = pcbs.get(pcb.0)?;
        if record.local_port == 0 {
            return None;
        }
        Some(SocketAddr::from(([127, 0, 0, 1], record.local_port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_tracks_send_buffer() {
        let sim = SimStack::with_config(SimConfig {
            mss: 100,
            send_buffer: 150,
        });
        let pcb = sim.create_pcb().unwrap();
        TcpStack::connect(&*sim, pcb, "10.0.0.1:80".parse().unwrap()).unwrap();
        let flags = WriteFlags {
            copy: true,
            more: false,
        };
        assert!(sim.enqueue(pcb, &[0u8; 100], flags).is_ok());
        assert_eq!(sim.send_buffer_free(pcb), 50);
        assert_eq!(sim.enqueue(pcb, &[0u8; 60], flags), Err(StackError::Memory));

        sim.deliver_ack(pcb, 100).unwrap();
        assert_eq!(sim.send_buffer_free(pcb), 150);
        assert_eq!(sim.unacked(pcb), 0);
    }

    #[test]
    fn callbacks_survive_without_registration() {
        let sim = SimStack::new();
        let pcb = sim.create_pcb().unwrap();
        TcpStack::connect(&*sim, pcb, "10.0.0.1:80".parse().unwrap()).unwrap();
        // No callbacks installed: scripting is a quiet no-op.
        assert!(sim.complete_connect(pcb).is_ok());
        assert!(sim.deliver(pcb, Segment::new(&b"x"[..])).is_ok());
        assert!(sim.deliver_fin(pcb).is_ok());
        assert!(sim.tick_poll(pcb).is_ok());
    }
}
