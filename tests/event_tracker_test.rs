//! Event tracker over real loopback TCP
//!
//! Every tracker listens on an ephemeral port. Positions are made
//! deterministic with a manual clock: arrival instants only move when the
//! test advances the clock.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use eegview::common::{Clock, ManualClock, SoftwareEvent, SystemClock};
use eegview::event_tracker::{
    estimate_position, Checkpoint, EventTracker, TrackerConfig, EVENT_STACK_CAPACITY,
};
use proptest::prelude::*;

const FS: f64 = 256.0;

fn tracker_with(clock: Arc<dyn Clock>) -> EventTracker {
    let config = TrackerConfig {
        port: 0,
        accept_timeout: Duration::from_millis(50),
    };
    EventTracker::with_clock(FS, &config, clock).expect("start tracker")
}

fn connect(tracker: &EventTracker) -> TcpStream {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, tracker.local_addr().port()));
    let stream = TcpStream::connect(addr).expect("connect to tracker");
    stream.set_nodelay(true).expect("nodelay");
    stream
}

fn send(stream: &mut TcpStream, codes: &[u32]) {
    let bytes: Vec<u8> = codes.iter().flat_map(|c| c.to_ne_bytes()).collect();
    stream.write_all(&bytes).expect("send events");
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Swap until `count` events have been gathered or the timeout expires
fn collect(tracker: &EventTracker, count: usize) -> Vec<SoftwareEvent> {
    let mut events = Vec::new();
    wait_until(Duration::from_secs(5), || {
        events.extend(tracker.swap_event_stack().iter().copied());
        events.len() >= count
    });
    events
}

#[test]
fn test_event_stamped_from_last_checkpoint() {
    let clock = Arc::new(ManualClock::new());
    let tracker = tracker_with(clock.clone());

    tracker.update_read_checkpoint(1000);
    clock.advance(Duration::from_millis(200));

    let mut client = connect(&tracker);
    send(&mut client, &[5]);

    let events = collect(&tracker, 1);
    assert_eq!(events, vec![SoftwareEvent::new(1051, 5)]);
}

#[test]
fn test_events_keep_arrival_order() {
    let clock = Arc::new(ManualClock::new());
    let tracker = tracker_with(clock.clone());
    tracker.update_read_checkpoint(64);

    let mut client = connect(&tracker);
    send(&mut client, &[3, 1, 4, 1, 5]);

    let events = collect(&tracker, 5);
    let codes: Vec<u32> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(codes, vec![3, 1, 4, 1, 5]);
    assert!(events.iter().all(|e| e.position == 64));
}

#[test]
fn test_swap_hands_over_each_event_once() {
    let clock = Arc::new(ManualClock::new());
    let tracker = tracker_with(clock.clone());
    let mut client = connect(&tracker);

    send(&mut client, &[1]);
    assert_eq!(collect(&tracker, 1).len(), 1);
    assert!(tracker.swap_event_stack().is_empty());
    assert!(tracker.swap_event_stack().is_empty());

    send(&mut client, &[2]);
    let events = collect(&tracker, 1);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, 2);
}

#[test]
fn test_client_can_reconnect() {
    let clock = Arc::new(ManualClock::new());
    let tracker = tracker_with(clock.clone());

    {
        let mut first = connect(&tracker);
        assert!(wait_until(Duration::from_secs(2), || tracker.is_client_connected()));
        send(&mut first, &[10]);
        assert_eq!(collect(&tracker, 1)[0].event_type, 10);
    }
    assert!(wait_until(Duration::from_secs(2), || !tracker.is_client_connected()));

    let mut second = connect(&tracker);
    send(&mut second, &[20]);
    let events = collect(&tracker, 1);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, 20);
}

#[test]
fn test_partial_record_is_not_an_event() {
    let clock = Arc::new(ManualClock::new());
    let tracker = tracker_with(clock.clone());

    let mut client = connect(&tracker);
    client.write_all(&[7, 0]).unwrap();
    drop(client);

    assert!(wait_until(Duration::from_secs(2), || !tracker.is_client_connected()));
    thread::sleep(Duration::from_millis(50));
    assert!(tracker.swap_event_stack().is_empty());
}

#[test]
fn test_full_stack_drops_extra_events() {
    let clock = Arc::new(ManualClock::new());
    let tracker = tracker_with(clock.clone());

    let extra = 4;
    let codes: Vec<u32> = (0..(EVENT_STACK_CAPACITY + extra) as u32).collect();
    let mut client = connect(&tracker);
    send(&mut client, &codes);

    assert!(wait_until(Duration::from_secs(5), || {
        tracker.dropped_events() == extra as u64
    }));
    let stack = tracker.swap_event_stack();
    assert!(stack.is_full());
    let kept: Vec<u32> = stack.iter().map(|e| e.event_type).collect();
    assert_eq!(kept, codes[..EVENT_STACK_CAPACITY].to_vec());
}

#[test]
fn test_deinit_unblocks_idle_client() {
    let clock = Arc::new(ManualClock::new());
    let mut tracker = tracker_with(clock.clone());

    let mut client = connect(&tracker);
    assert!(wait_until(Duration::from_secs(2), || tracker.is_client_connected()));

    let started = Instant::now();
    tracker.deinit();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!tracker.is_client_connected());

    // Server side is gone: the client sees end of stream or a reset
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 4];
    match client.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => assert_ne!(e.kind(), std::io::ErrorKind::WouldBlock),
    }
}

#[test]
fn test_deinit_without_client_returns_promptly() {
    let clock = Arc::new(ManualClock::new());
    let mut tracker = tracker_with(clock);

    let started = Instant::now();
    tracker.deinit();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_concurrent_sender_and_swapper() {
    const TOTAL: u32 = 2000;
    let tracker = tracker_with(Arc::new(SystemClock));
    let mut client = connect(&tracker);

    let sender = thread::spawn(move || {
        for chunk in (0..TOTAL).collect::<Vec<_>>().chunks(7) {
            send(&mut client, chunk);
        }
    });

    let mut received: Vec<u32> = Vec::new();
    let mut total_read = 0i64;
    let done = wait_until(Duration::from_secs(10), || {
        total_read += 32;
        tracker.update_read_checkpoint(total_read);
        received.extend(tracker.swap_event_stack().iter().map(|e| e.event_type));
        received.len() as u64 + tracker.dropped_events() == TOTAL as u64
    });
    sender.join().unwrap();

    assert!(done, "received {} dropped {}", received.len(), tracker.dropped_events());
    assert!(received.windows(2).all(|w| w[0] < w[1]), "events out of order");
}

proptest! {
    #[test]
    fn prop_estimate_is_monotonic_in_arrival(
        position in -1_000_000i64..1_000_000,
        fs in 1u32..16_384,
        offsets_ms in proptest::collection::vec(0u64..10_000, 1..32),
    ) {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(20));
        let checkpoint = Checkpoint { position, at: clock.now() };

        let mut offsets_ms = offsets_ms;
        offsets_ms.sort_unstable();
        let positions: Vec<i64> = offsets_ms
            .iter()
            .map(|&ms| estimate_position(&checkpoint, checkpoint.at + Duration::from_millis(ms), fs as f64))
            .collect();

        prop_assert!(positions.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(positions.iter().all(|&p| p >= position));
    }

    #[test]
    fn prop_estimate_before_checkpoint_is_earlier(
        position in 0i64..1_000_000,
        fs in 1u32..16_384,
        back_ms in 1u64..10_000,
    ) {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(20));
        let checkpoint = Checkpoint { position, at: clock.now() };

        let arrival = checkpoint.at - Duration::from_millis(back_ms);
        prop_assert!(estimate_position(&checkpoint, arrival, fs as f64) <= position);
    }
}
