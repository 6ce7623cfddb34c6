//! End-to-end scenarios over the scripted stack.
//!
//! Each test stands a client up over a `SimStack`, scripts the far end
//! (handshake completion, segment delivery, ACKs, poll ticks), and drives
//! the networking context by hand so bridge dispatch is deterministic.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use truss_bridge::{AsyncContext, EphemeralBridge, PerpetualBridge};
use truss_tcp::sim::{SimConfig, SimStack};
use truss_tcp::{
    CompletionMode, PcbId, PcbState, Segment, StackError, TcpClient, TcpError, TcpStack,
    WriteFlags,
};

const PEER: &str = "192.0.2.10:4242";

/// Serializes the tests that touch the process-wide knobs (local port
/// start, no-delay default); the rest of the suite runs freely.
static GLOBALS_LOCK: Mutex<()> = Mutex::new(());

fn harness(config: SimConfig) -> (Arc<AsyncContext>, Arc<SimStack>, TcpClient) {
    let ctx = AsyncContext::new(0);
    ctx.bind_to_current_thread();
    let sim = SimStack::with_config(config);
    let mut client = TcpClient::new(sim.clone(), Arc::clone(&ctx));
    client.install_sync_accessor();
    (ctx, sim, client)
}

/// Connect, complete the handshake, and dispatch the connected event.
fn establish(ctx: &AsyncContext, sim: &SimStack, client: &TcpClient) -> PcbId {
    client.connect(PEER.parse().unwrap()).unwrap();
    let pcb = sim.newest_pcb().unwrap();
    sim.complete_connect(pcb).unwrap();
    ctx.poll();
    pcb
}

fn counter_bridge(ctx: &Arc<AsyncContext>, counter: &Arc<AtomicU32>) -> PerpetualBridge<()> {
    let counter = Arc::clone(counter);
    PerpetualBridge::registered(Arc::clone(ctx), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap()
}

// ── Scenario 1: small write, ACKed mode ─────────────────────────────

#[test]
fn small_write_completes_on_full_ack() {
    let (ctx, sim, client) = harness(SimConfig {
        mss: 1460,
        send_buffer: 2920,
    });
    let pcb = establish(&ctx, &sim, &client);

    client.write(&[0x42u8; 512]).unwrap();
    ctx.poll(); // run the dispatched write

    assert_eq!(
        sim.chunk_log(pcb),
        vec![(
            512,
            WriteFlags {
                copy: true,
                more: false
            }
        )]
    );
    assert!(client.is_write_in_progress(), "waiting for the ACK");

    sim.deliver_ack(pcb, 512).unwrap();
    assert!(!client.is_write_in_progress());
    assert_eq!(sim.unacked(pcb), 0, "nothing in flight at completion");

    // The engine reset exactly once: a second write starts cleanly.
    client.write(b"again").unwrap();
    ctx.poll();
    assert_eq!(sim.chunk_log(pcb).len(), 2);
}

// ── Scenario 2: split write crossing the send-buffer boundary ───────

#[test]
fn large_write_chunks_follow_the_acks() {
    let (ctx, sim, client) = harness(SimConfig {
        mss: 1460,
        send_buffer: 1000,
    });
    let pcb = establish(&ctx, &sim, &client);

    client.write(&[7u8; 3000]).unwrap();
    ctx.poll();
    assert_eq!(chunk_sizes(&sim, pcb), vec![1000]);
    assert!(client.is_write_in_progress());

    sim.deliver_ack(pcb, 600).unwrap();
    assert_eq!(chunk_sizes(&sim, pcb), vec![1000, 600]);

    sim.deliver_ack(pcb, 400).unwrap();
    assert_eq!(chunk_sizes(&sim, pcb), vec![1000, 600, 400]);

    sim.deliver_ack(pcb, 500).unwrap();
    sim.deliver_ack(pcb, 500).unwrap();
    assert_eq!(chunk_sizes(&sim, pcb), vec![1000, 600, 400, 500, 500]);
    let queued: usize = chunk_sizes(&sim, pcb).iter().sum();
    assert_eq!(queued, 3000, "fully queued");
    assert!(client.is_write_in_progress(), "acked-mode still waiting");

    sim.deliver_ack(pcb, 500).unwrap();
    sim.deliver_ack(pcb, 500).unwrap();
    assert!(!client.is_write_in_progress());

    // Every chunk but the last carried the more hint.
    let more_flags: Vec<bool> = sim
        .chunk_log(pcb)
        .iter()
        .map(|(_, flags)| flags.more)
        .collect();
    assert_eq!(more_flags, vec![true, true, true, true, false]);
}

fn chunk_sizes(sim: &SimStack, pcb: PcbId) -> Vec<usize> {
    sim.chunk_log(pcb).iter().map(|(len, _)| *len).collect()
}

// ── Scenario 3: stall timeout ───────────────────────────────────────

#[test]
fn stalled_write_is_abandoned_by_the_poll_path() {
    let (ctx, sim, client) = harness(SimConfig {
        mss: 1460,
        send_buffer: 1000,
    });
    client.set_stall_timeout(Duration::from_millis(40));
    let pcb = establish(&ctx, &sim, &client);

    client.write(&[9u8; 4000]).unwrap();
    ctx.poll();
    assert_eq!(chunk_sizes(&sim, pcb), vec![1000]);

    // Poll before the deadline: still in progress.
    sim.tick_poll(pcb).unwrap();
    assert!(client.is_write_in_progress());

    thread::sleep(Duration::from_millis(60));
    sim.tick_poll(pcb).unwrap();
    assert!(!client.is_write_in_progress(), "stall detected and reset");
    assert_eq!(chunk_sizes(&sim, pcb), vec![1000], "no further chunks");
}

// ── Scenario 4: receive then FIN ────────────────────────────────────

#[test]
fn fin_preserves_buffered_data_and_fails_the_writer() {
    let (ctx, sim, client) = harness(SimConfig {
        mss: 1460,
        send_buffer: 100,
    });

    let fin_count = Arc::new(AtomicU32::new(0));
    let data_count = Arc::new(AtomicU32::new(0));
    let error_count = Arc::new(AtomicU32::new(0));
    client.set_on_fin(counter_bridge(&ctx, &fin_count));
    client.set_on_received(counter_bridge(&ctx, &data_count));
    {
        let error_count = Arc::clone(&error_count);
        client.set_on_error(
            PerpetualBridge::registered(Arc::clone(&ctx), move |_| {
                error_count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap(),
        );
    }
    let pcb = establish(&ctx, &sim, &client);

    // A write that cannot finish: 100-byte window, 300-byte payload.
    client.write(&[1u8; 300]).unwrap();
    ctx.poll();
    assert!(client.is_write_in_progress());

    sim.deliver(pcb, Segment::from_slices(&["AB", "CDE"]).unwrap())
        .unwrap();
    let fin_result = sim.deliver_fin(pcb);
    assert_eq!(fin_result, Err(StackError::Aborted), "abort sentinel");
    ctx.poll();

    assert_eq!(fin_count.load(Ordering::SeqCst), 1, "FIN fired once");
    assert_eq!(data_count.load(Ordering::SeqCst), 1);
    assert_eq!(error_count.load(Ordering::SeqCst), 0, "FIN is not an error");
    assert!(
        !client.is_write_in_progress(),
        "in-flight write failed with connection-closed"
    );

    // Buffered bytes outlive the FIN until the application consumes them.
    assert_eq!(client.available(), 5);
    let mut read = Vec::new();
    while client.available() > 0 {
        read.push(client.peek());
        client.consume(1);
    }
    assert_eq!(read, b"ABCDE");
    assert_eq!(sim.recved_total(pcb), 5, "exactly five bytes credited");
    assert!(sim.is_recv_stopped(pcb));
}

// ── Scenario 5: cross-core sync accessor ────────────────────────────

#[test]
fn status_from_the_other_core_matches_the_in_context_view() {
    let ctx = AsyncContext::new(1);
    let sim = SimStack::new();
    let mut client = TcpClient::new(sim.clone(), Arc::clone(&ctx));
    client.install_sync_accessor();

    let stop = Arc::new(AtomicBool::new(false));
    let poller = {
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
    // Blocks until the poller is alive and draining the context.
    ctx.execute_sync(|| ()).unwrap();

    // connect() from this (non-networking) core dispatches in-context.
    client.connect(PEER.parse().unwrap()).unwrap();
    let pcb = sim.newest_pcb().unwrap();
    assert_eq!(client.status(), PcbState::SynSent);

    // Script the handshake on the networking core.
    let sim_on_core = sim.clone();
    ctx.execute_sync(move || sim_on_core.complete_connect(pcb))
        .unwrap()
        .unwrap();

    // The synced read and an in-context read agree.
    let observed = client.status();
    let sim_in_ctx = sim.clone();
    let in_context = ctx
        .execute_sync(move || sim_in_ctx.state(pcb))
        .unwrap();
    assert_eq!(observed, PcbState::Established);
    assert_eq!(observed, in_context);

    assert!(client.shutdown(Duration::from_millis(50)));
    stop.store(true, Ordering::SeqCst);
    poller.join().unwrap();
}

// ── Scenario 6: ephemeral self-destruction ──────────────────────────

#[test]
fn unretained_ephemeral_bridge_fires_and_frees() {
    struct Probe {
        dropped: Arc<AtomicU32>,
    }
    impl Drop for Probe {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    let ctx = AsyncContext::new(0);
    ctx.bind_to_current_thread();
    let fired = Arc::new(AtomicU32::new(0));
    let dropped = Arc::new(AtomicU32::new(0));
    {
        let fired = Arc::clone(&fired);
        let probe = Probe {
            dropped: Arc::clone(&dropped),
        };
        let bridge = EphemeralBridge::new(Arc::clone(&ctx), move || {
            let _keep = &probe;
            fired.fetch_add(1, Ordering::SeqCst);
        });
        bridge
            .run(Duration::from_millis(10))
            .unwrap_or_else(|_| panic!("registration failed"));
        // The creating scope ends here without retaining a handle.
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 0, "alive until it fires");

    ctx.wait_until(Instant::now() + Duration::from_millis(30));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(dropped.load(Ordering::SeqCst), 1, "freed on the fire path");
}

// ── Lifecycle invariants ────────────────────────────────────────────

#[test]
fn second_connect_without_shutdown_is_refused() {
    let (ctx, sim, client) = harness(SimConfig::default());
    establish(&ctx, &sim, &client);

    assert_eq!(
        client.connect(PEER.parse().unwrap()),
        Err(TcpError::InUse)
    );

    assert!(client.shutdown(Duration::from_millis(10)));
    assert_eq!(client.status(), PcbState::Closed);
    client.connect(PEER.parse().unwrap()).unwrap();
}

#[test]
fn repeated_stop_is_safe() {
    let (ctx, sim, client) = harness(SimConfig::default());
    establish(&ctx, &sim, &client);

    assert!(client.stop(Duration::from_millis(10)));
    // Second stop finds the nulled PCB and still reports success.
    assert!(client.stop(Duration::from_millis(10)));
    assert_eq!(sim.open_pcbs(), 0);
}

#[test]
fn write_before_connect_is_invalid() {
    let (_ctx, _sim, client) = harness(SimConfig::default());
    assert_eq!(client.write(b"hello"), Err(TcpError::InvalidState));
}

#[test]
fn enqueued_mode_completes_without_acks() {
    let (ctx, sim, client) = harness(SimConfig {
        mss: 1460,
        send_buffer: 4096,
    });
    client.set_completion_mode(CompletionMode::Enqueued);
    let pcb = establish(&ctx, &sim, &client);

    client.write(&[6u8; 2000]).unwrap();
    ctx.poll();
    assert!(
        !client.is_write_in_progress(),
        "enqueued mode completes once fully queued"
    );
    let queued: usize = chunk_sizes(&sim, pcb).iter().sum();
    assert_eq!(queued, 2000);
}

#[test]
#[should_panic(expected = "non-empty")]
fn zero_length_write_is_a_precondition_violation() {
    let (ctx, sim, client) = harness(SimConfig::default());
    establish(&ctx, &sim, &client);
    let _ = client.write(&[]);
}

#[test]
fn concurrent_write_is_refused_until_completion() {
    let (ctx, sim, client) = harness(SimConfig::default());
    let pcb = establish(&ctx, &sim, &client);

    client.write(&[1u8; 64]).unwrap();
    ctx.poll();
    assert_eq!(client.write(&[2u8; 64]), Err(TcpError::InUse));

    sim.deliver_ack(pcb, 64).unwrap();
    client.write(&[3u8; 64]).unwrap();
    ctx.poll();
    assert_eq!(sim.chunk_log(pcb).len(), 2);
}

#[test]
fn broken_receive_forwards_the_error_and_keeps_the_buffer() {
    let (ctx, sim, client) = harness(SimConfig::default());
    let pcb = establish(&ctx, &sim, &client);

    sim.deliver(pcb, Segment::from_slices(&["ok"]).unwrap())
        .unwrap();
    // A receive the stack reports as broken: the chain is freed, the error
    // answered back, and previously buffered data is untouched.
    let result = sim.deliver_recv_err(
        pcb,
        Segment::from_slices(&["junk"]),
        StackError::Buffer,
    );
    assert_eq!(result, Err(StackError::Buffer));
    ctx.poll();
    assert_eq!(client.available(), 2);
}

// ── Stack-error path ────────────────────────────────────────────────

#[test]
fn fatal_stack_error_reaches_the_error_bridge() {
    let (ctx, sim, client) = harness(SimConfig::default());

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        client.set_on_error(
            PerpetualBridge::registered(Arc::clone(&ctx), move |err| {
                seen.lock().push(err);
            })
            .unwrap(),
        );
    }
    let pcb = establish(&ctx, &sim, &client);

    client.write(&[5u8; 128]).unwrap();
    ctx.poll();
    sim.fail_connection(pcb, StackError::Reset);
    ctx.poll();

    assert_eq!(*seen.lock(), vec![Some(StackError::Reset)]);
    assert!(!client.is_write_in_progress(), "write failed over");
    assert_eq!(client.status(), PcbState::Closed);
    assert!(client.shutdown(Duration::from_millis(10)));
}

// ── Supplementary surface ───────────────────────────────────────────

#[test]
fn connect_applies_the_no_delay_default() {
    let _globals = GLOBALS_LOCK.lock();
    truss_tcp::set_default_no_delay(true);
    let (ctx, sim, client) = harness(SimConfig::default());
    let pcb = establish(&ctx, &sim, &client);
    assert!(sim.no_delay(pcb));
    assert!(client.no_delay());

    client.set_no_delay(false);
    assert!(!sim.no_delay(pcb));
}

#[test]
fn local_port_start_binds_and_increments() {
    let _globals = GLOBALS_LOCK.lock();
    truss_tcp::set_local_port_start(49_152);
    let (ctx, sim, client) = harness(SimConfig::default());
    let pcb = establish(&ctx, &sim, &client);
    let first = sim.bound_local_port(pcb);
    assert!(first >= 49_152);
    assert!(truss_tcp::local_port_start() > first);

    client.shutdown(Duration::from_millis(10));
    let pcb = establish(&ctx, &sim, &client);
    assert!(sim.bound_local_port(pcb) > first);
    truss_tcp::set_local_port_start(0);
}

#[test]
fn keep_alive_round_trips_through_the_stack() {
    let (ctx, sim, client) = harness(SimConfig::default());
    let pcb = establish(&ctx, &sim, &client);

    let config = truss_tcp::KeepAlive {
        idle: Duration::from_secs(30),
        interval: Duration::from_secs(5),
        probes: 3,
    };
    client.keep_alive(config);
    assert_eq!(sim.keep_alive(pcb), Some(config));
    assert_eq!(client.keep_alive_config(), Some(config));

    client.disable_keep_alive();
    assert_eq!(sim.keep_alive(pcb), None);
}

#[test]
fn addresses_reflect_the_connection() {
    let _globals = GLOBALS_LOCK.lock();
    truss_tcp::set_local_port_start(50_000);
    let (ctx, sim, client) = harness(SimConfig::default());
    let pcb = establish(&ctx, &sim, &client);

    assert_eq!(client.remote_addr(), Some(PEER.parse().unwrap()));
    let bound = sim.bound_local_port(pcb);
    assert!(bound >= 50_000);
    assert_eq!(client.local_addr().map(|addr| addr.port()), Some(bound));
    truss_tcp::set_local_port_start(0);
}

#[test]
fn backpressure_advice_follows_the_window() {
    let (ctx, sim, client) = harness(SimConfig {
        mss: 1460,
        send_buffer: 1000,
    });
    let pcb = establish(&ctx, &sim, &client);
    assert!(client.can_release_backpressure(), "idle writer is relaxed");

    client.write(&[0u8; 900]).unwrap();
    ctx.poll();
    assert!(client.should_backpressure());

    sim.deliver_ack(pcb, 900).unwrap();
    assert!(client.can_release_backpressure());
}

#[test]
fn available_for_write_tracks_the_send_buffer() {
    let (ctx, sim, client) = harness(SimConfig {
        mss: 1460,
        send_buffer: 1000,
    });
    let pcb = establish(&ctx, &sim, &client);
    assert_eq!(client.available_for_write(), 1000);

    client.write(&[0u8; 400]).unwrap();
    ctx.poll();
    assert_eq!(client.available_for_write(), 600);
    sim.deliver_ack(pcb, 400).unwrap();
    assert_eq!(client.available_for_write(), 1000);
}
