//! Cursor-based receive buffer over an inbound segment chain.
//!
//! The buffer owns the head of the chain the stack delivered and exposes a
//! peek/consume cursor over it. Consumption frees segments as they drain
//! and returns receive-window credit to the stack for exactly the bytes
//! surrendered, chunked to the stack's 16-bit width.
//!
//! Single-reader, single-writer, networking core only. Not ISR-safe.

use std::sync::Arc;

use log::trace;

use crate::stack::{PcbId, Segment, TcpStack};

type EventHook = Box<dyn Fn() + Send>;

/// Receive buffer for one connection.
pub struct RxBuffer {
    stack: Arc<dyn TcpStack>,
    pcb: Option<PcbId>,
    head: Option<Box<Segment>>,
    /// Cursor into the head segment; zero whenever `head` is `None`, and
    /// strictly less than the head's length otherwise.
    offset: usize,
    on_data: Option<EventHook>,
    on_fin: Option<EventHook>,
}

impl RxBuffer {
    pub fn new(stack: Arc<dyn TcpStack>) -> Self {
        RxBuffer {
            stack,
            pcb: None,
            head: None,
            offset: 0,
            on_data: None,
            on_fin: None,
        }
    }

    /// Remember which PCB to credit consumed bytes against.
    pub fn bind_pcb(&mut self, pcb: PcbId) {
        self.pcb = Some(pcb);
    }

    /// Forget the PCB; remaining data stays readable but earns no more
    /// window credit (the PCB is gone).
    pub fn clear_pcb(&mut self) {
        self.pcb = None;
    }

    pub fn set_on_data(&mut self, hook: EventHook) {
        self.on_data = Some(hook);
    }

    pub fn set_on_fin(&mut self, hook: EventHook) {
        self.on_fin = Some(hook);
    }

    pub(crate) fn notify_data(&self) {
        if let Some(hook) = &self.on_data {
            hook();
        }
    }

    pub(crate) fn notify_fin(&self) {
        if let Some(hook) = &self.on_fin {
            hook();
        }
    }

    /// Take ownership of a delivered chain, appending when data is already
    /// buffered.
    pub fn accept(&mut self, chain: Box<Segment>) {
        match self.head.as_mut() {
            Some(head) => head.chain(chain),
            None => {
                self.head = Some(chain);
                self.offset = 0;
            }
        }
    }

    /// Next byte at the cursor, or 0 when empty. Does not advance.
    pub fn peek(&self) -> u8 {
        match &self.head {
            Some(head) => head.payload()[self.offset],
            None => 0,
        }
    }

    /// Bytes readable in the current segment only.
    pub fn peek_available(&self) -> usize {
        match &self.head {
            Some(head) => head.len() - self.offset,
            None => 0,
        }
    }

    /// Readable bytes of the current segment, valid until the next
    /// `consume` or `reset`.
    pub fn peek_buffer(&self) -> Option<&[u8]> {
        self.head
            .as_ref()
            .map(|head| &head.payload()[self.offset..])
    }

    /// Total unconsumed bytes across the whole chain.
    pub fn len(&self) -> usize {
        match &self.head {
            Some(head) => head.total_len() - self.offset,
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Surrender `n` bytes from the cursor. Exhausted segments are freed
    /// and the stack is credited with exactly the consumed count.
    /// `consume(0)` is a no-op; `n` beyond the buffered total consumes to
    /// the end of the chain.
    pub fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let consumed = if n <= self.peek_available() {
            self.consume_fast(n)
        } else {
            self.consume_slow(n)
        };
        if consumed > 0 {
            self.credit_stack(consumed);
        }
    }

    /// Free the chain and reset cursor and PCB binding.
    pub fn reset(&mut self) {
        self.head = None;
        self.offset = 0;
        self.pcb = None;
    }

    /// Fast path: `n` fits within the current segment.
    fn consume_fast(&mut self, n: usize) -> usize {
        let remaining = self.peek_available();
        if n < remaining {
            self.offset += n;
        } else {
            // Exact fit: free this segment and move to the next.
            self.advance_segment();
        }
        n
    }

    /// Slow path: walk segment boundaries until `n` is satisfied or the
    /// chain ends.
    fn consume_slow(&mut self, mut n: usize) -> usize {
        let mut consumed = 0;
        while n > 0 && self.head.is_some() {
            let remaining = self.peek_available();
            if n < remaining {
                self.offset += n;
                consumed += n;
                break;
            }
            consumed += remaining;
            n -= remaining;
            self.advance_segment();
        }
        consumed
    }

    /// Drop the head segment and reset the cursor onto its successor.
    fn advance_segment(&mut self) {
        if let Some(mut head) = self.head.take() {
            self.head = head.take_next();
        }
        self.offset = 0;
    }

    /// Return window credit, split so no single call exceeds the stack's
    /// 16-bit width.
    fn credit_stack(&self, mut consumed: usize) {
        let Some(pcb) = self.pcb else {
            trace!("rx: {consumed} bytes consumed with no pcb bound");
            return;
        };
        while consumed > 0 {
            let credit = consumed.min(usize::from(u16::MAX)) as u16;
            self.stack.mark_consumed(pcb, credit);
            consumed -= usize::from(credit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimStack;
    use crate::stack::TcpStack;

    fn buffer_with_pcb() -> (Arc<SimStack>, PcbId, RxBuffer) {
        let sim = SimStack::new();
        let pcb = sim.create_pcb().unwrap();
        let stack: Arc<dyn TcpStack> = sim.clone();
        let mut rx = RxBuffer::new(stack);
        rx.bind_pcb(pcb);
        (sim, pcb, rx)
    }

    #[test]
    fn empty_buffer_answers_zeroes() {
        let (_sim, _pcb, rx) = buffer_with_pcb();
        assert_eq!(rx.peek(), 0);
        assert_eq!(rx.peek_available(), 0);
        assert!(rx.peek_buffer().is_none());
        assert_eq!(rx.len(), 0);
    }

    #[test]
    fn peek_does_not_advance() {
        let (_sim, _pcb, mut rx) = buffer_with_pcb();
        rx.accept(Segment::from_slices(&["AB"]).unwrap());
        assert_eq!(rx.peek(), b'A');
        assert_eq!(rx.peek(), b'A');
        assert_eq!(rx.peek_available(), 2);
    }

    #[test]
    fn consume_zero_is_a_no_op() {
        let (sim, pcb, mut rx) = buffer_with_pcb();
        rx.accept(Segment::from_slices(&["AB"]).unwrap());
        rx.consume(0);
        assert_eq!(rx.peek_available(), 2);
        assert!(sim.recved_log(pcb).is_empty());
    }

    #[test]
    fn fast_path_advances_within_a_segment() {
        let (sim, pcb, mut rx) = buffer_with_pcb();
        rx.accept(Segment::from_slices(&["ABCD"]).unwrap());
        rx.consume(1);
        assert_eq!(rx.peek(), b'B');
        assert_eq!(rx.peek_available(), 3);
        assert_eq!(sim.recved_total(pcb), 1);
    }

    #[test]
    fn exact_fit_frees_the_segment() {
        let (sim, pcb, mut rx) = buffer_with_pcb();
        rx.accept(Segment::from_slices(&["AB", "CDE"]).unwrap());
        rx.consume(2);
        assert_eq!(rx.peek(), b'C');
        assert_eq!(rx.peek_available(), 3);
        assert_eq!(sim.recved_total(pcb), 2);
    }

    #[test]
    fn slow_path_crosses_segment_boundaries() {
        let (sim, pcb, mut rx) = buffer_with_pcb();
        rx.accept(Segment::from_slices(&["AB", "CDE", "F"]).unwrap());
        rx.consume(4);
        assert_eq!(rx.peek(), b'E');
        assert_eq!(rx.len(), 2);
        assert_eq!(sim.recved_total(pcb), 4);
    }

    #[test]
    fn over_consume_drains_the_chain() {
        let (sim, pcb, mut rx) = buffer_with_pcb();
        rx.accept(Segment::from_slices(&["AB", "CD"]).unwrap());
        rx.consume(100);
        assert!(rx.is_empty());
        assert_eq!(rx.peek_available(), 0);
        // Only the four real bytes earn credit.
        assert_eq!(sim.recved_total(pcb), 4);
    }

    #[test]
    fn arbitrary_splits_preserve_order_and_credit() {
        let (sim, pcb, mut rx) = buffer_with_pcb();
        rx.accept(Segment::from_slices(&["hel", "lo wo", "rld"]).unwrap());
        let mut read = Vec::new();
        for split in [1usize, 4, 2, 3, 1] {
            for _ in 0..split {
                read.push(rx.peek());
                rx.consume(1);
            }
        }
        assert_eq!(read, b"hello world");
        assert!(rx.is_empty());
        assert_eq!(sim.recved_total(pcb), 11);
    }

    #[test]
    fn window_credit_is_chunked_to_u16() {
        let (sim, pcb, mut rx) = buffer_with_pcb();
        let big = vec![0xAAu8; 70_000];
        rx.accept(Segment::new(big));
        rx.consume(70_000);
        assert_eq!(sim.recved_log(pcb), vec![65_535, 4_465]);
    }

    #[test]
    fn reset_frees_chain_and_unbinds() {
        let (sim, pcb, mut rx) = buffer_with_pcb();
        rx.accept(Segment::from_slices(&["data"]).unwrap());
        rx.reset();
        assert!(rx.is_empty());
        rx.consume(4);
        assert!(sim.recved_log(pcb).is_empty());
    }

    #[test]
    fn append_keeps_cursor_position() {
        let (_sim, _pcb, mut rx) = buffer_with_pcb();
        rx.accept(Segment::from_slices(&["AB"]).unwrap());
        rx.consume(1);
        rx.accept(Segment::from_slices(&["CD"]).unwrap());
        assert_eq!(rx.peek(), b'B');
        assert_eq!(rx.len(), 3);
    }
}
