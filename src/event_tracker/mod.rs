//! Software event tracker
//!
//! Listens on a TCP port for a single client that sends event codes
//! (one native-endian `u32` per event, nothing is sent back). Each code is
//! stamped with an estimated sample position extrapolated from the last
//! read checkpoint published by the acquisition thread:
//!
//! ```text
//! position = checkpoint.position + round((arrival - checkpoint.at) * sampling_rate)
//! ```
//!
//! Events are appended to one of two [`EventStack`]s. The acquisition
//! thread calls [`EventTracker::swap_event_stack`] once per cycle, which
//! hands it the stack filled since the previous swap and points the
//! network thread at the other one.
//!
//! Architecture:
//! - Network thread: accept phase (bounded wait so the quit flag is seen
//!   while idle), then session phase (blocking receive until the client
//!   disconnects)
//! - Consumer: `update_read_checkpoint` + `swap_event_stack` every cycle
//! - Teardown: set quit, shut the client socket down to unblock the
//!   receive, join

pub mod stack;

pub use stack::{EventStack, EVENT_STACK_CAPACITY};

use std::io::{self, Read};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::common::clock::signed_secs_between;
use crate::common::{Clock, SoftwareEvent, SystemClock};

/// Default listening port
pub const DEFAULT_PORT: u16 = 1234;

/// Size of one event record on the wire
pub const EVENT_RECORD_SIZE: usize = std::mem::size_of::<u32>();

const ACCEPT_POLL_SLICE: Duration = Duration::from_millis(10);

/// Tracker errors
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Cannot listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Listening socket setup failed: {0}")]
    Listener(#[source] io::Error),

    #[error("Client I/O error: {0}")]
    ClientIo(#[source] io::Error),

    #[error("Failed to spawn tracker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Tracker settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    pub port: u16,
    /// Longest wait in the accept phase before the loop comes round again
    pub accept_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            accept_timeout: Duration::from_millis(500),
        }
    }
}

/// Sample index paired with the instant it was read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub position: i64,
    pub at: Instant,
}

/// Extrapolate the sample position of an event arriving at `arrival`
///
/// Rounds half away from zero. Arrivals stamped before the checkpoint
/// yield positions before it.
pub fn estimate_position(checkpoint: &Checkpoint, arrival: Instant, sampling_rate: f64) -> i64 {
    let dt = signed_secs_between(checkpoint.at, arrival);
    checkpoint.position + (dt * sampling_rate).round() as i64
}

/// State shared between the network thread and the consumer
struct Shared {
    checkpoint: Checkpoint,
    stacks: [EventStack; 2],
    write_index: usize,
    /// Clone of the active client, kept so teardown can shut it down
    client: Option<TcpStream>,
    quit: bool,
    dropped: u64,
}

impl Shared {
    fn record(&mut self, event: SoftwareEvent) -> bool {
        let stored = self.stacks[self.write_index].push(event);
        if !stored {
            self.dropped += 1;
        }
        stored
    }
}

/// Context handed to the network thread
struct Receiver {
    shared: Arc<Mutex<Shared>>,
    clock: Arc<dyn Clock>,
    sampling_rate: f64,
    accept_timeout: Duration,
}

pub struct EventTracker {
    shared: Arc<Mutex<Shared>>,
    clock: Arc<dyn Clock>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl EventTracker {
    /// Listen on `port` on all interfaces and start the network thread
    pub fn init(sampling_rate: f64, port: u16) -> Result<Self, TrackerError> {
        let config = TrackerConfig {
            port,
            ..Default::default()
        };
        Self::with_clock(sampling_rate, &config, Arc::new(SystemClock))
    }

    /// Same as [`EventTracker::init`] with explicit settings and time source
    pub fn with_clock(
        sampling_rate: f64,
        config: &TrackerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TrackerError> {
        let listener = bind_listener(config.port)?;
        let local_addr = listener.local_addr().map_err(TrackerError::Listener)?;

        let shared = Arc::new(Mutex::new(Shared {
            checkpoint: Checkpoint {
                position: 0,
                at: clock.now(),
            },
            stacks: [EventStack::new(), EventStack::new()],
            write_index: 0,
            client: None,
            quit: false,
            dropped: 0,
        }));

        let receiver = Receiver {
            shared: Arc::clone(&shared),
            clock: Arc::clone(&clock),
            sampling_rate,
            accept_timeout: config.accept_timeout,
        };
        let thread = thread::Builder::new()
            .name("event-tracker".to_string())
            .spawn(move || receiver.run(listener))
            .map_err(TrackerError::Spawn)?;

        info!(addr = %local_addr, sampling_rate, "Event tracker listening");

        Ok(Self {
            shared,
            clock,
            thread: Some(thread),
            local_addr,
        })
    }

    /// Address the listening socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Publish the total number of samples read so far, stamped now
    pub fn update_read_checkpoint(&self, total_samples_read: i64) {
        let at = self.clock.now();
        self.shared.lock().checkpoint = Checkpoint {
            position: total_samples_read,
            at,
        };
    }

    /// Take the events gathered since the previous swap
    ///
    /// The network thread moves to the other stack, which is emptied.
    pub fn swap_event_stack(&self) -> EventStack {
        let mut shared = self.shared.lock();
        let frozen = shared.write_index;
        let next = (frozen + 1) % 2;
        shared.write_index = next;
        shared.stacks[next].clear();
        shared.stacks[frozen]
    }

    /// Whether a client session is currently open
    pub fn is_client_connected(&self) -> bool {
        self.shared.lock().client.is_some()
    }

    /// Events lost to full stacks since init
    pub fn dropped_events(&self) -> u64 {
        self.shared.lock().dropped
    }

    /// Stop the network thread and close every socket. Idempotent.
    pub fn deinit(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };

        let client = {
            let mut shared = self.shared.lock();
            shared.quit = true;
            shared.client.take()
        };
        if let Some(client) = client {
            let _ = client.shutdown(Shutdown::Both);
        }

        if handle.join().is_err() {
            warn!("Event tracker thread panicked");
        }
        info!(addr = %self.local_addr, "Event tracker stopped");
    }
}

impl Drop for EventTracker {
    fn drop(&mut self) {
        self.deinit();
    }
}

fn bind_listener(port: u16) -> Result<TcpListener, TrackerError> {
    let candidates = [
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
    ];
    let listener =
        TcpListener::bind(&candidates[..]).map_err(|source| TrackerError::Bind { port, source })?;
    listener
        .set_nonblocking(true)
        .map_err(TrackerError::Listener)?;
    Ok(listener)
}

impl Receiver {
    fn quit_requested(&self) -> bool {
        self.shared.lock().quit
    }

    fn run(self, listener: TcpListener) {
        while !self.quit_requested() {
            let Some((stream, peer)) = self.accept(&listener) else {
                continue;
            };
            if !self.register(&stream) {
                break;
            }
            info!(%peer, "Accepted event client");

            match self.serve(stream) {
                Ok(()) => {}
                Err(e) if self.quit_requested() => debug!(error = %e, "Client session interrupted"),
                Err(e) => warn!(error = %e, "Event client session failed"),
            }

            self.shared.lock().client = None;
            info!(%peer, "Event client disconnected");
        }
        debug!("Event tracker thread exiting");
    }

    /// Wait up to `accept_timeout` for a connection
    fn accept(&self, listener: &TcpListener) -> Option<(TcpStream, SocketAddr)> {
        let deadline = Instant::now() + self.accept_timeout;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!(%peer, error = %e, "Cannot switch client socket to blocking mode");
                        return None;
                    }
                    return Some((stream, peer));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            }
            if self.quit_requested() || Instant::now() >= deadline {
                return None;
            }
            thread::sleep(ACCEPT_POLL_SLICE);
        }
    }

    /// Record the client so teardown can reach it; false if quitting
    fn register(&self, stream: &TcpStream) -> bool {
        let handle = match stream.try_clone() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Cannot keep a handle on the event client");
                return !self.quit_requested();
            }
        };
        let mut shared = self.shared.lock();
        if shared.quit {
            return false;
        }
        shared.client = Some(handle);
        true
    }

    /// Receive event records until the client goes away
    fn serve(&self, mut stream: TcpStream) -> Result<(), TrackerError> {
        let mut record = [0u8; EVENT_RECORD_SIZE];
        loop {
            match stream.read_exact(&mut record) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(TrackerError::ClientIo(e)),
            }
            let arrival = self.clock.now();
            let event_type = u32::from_ne_bytes(record);

            let mut shared = self.shared.lock();
            if shared.quit {
                return Ok(());
            }
            let position = estimate_position(&shared.checkpoint, arrival, self.sampling_rate);
            if !shared.record(SoftwareEvent::new(position, event_type)) {
                debug!(event_type, position, "Event stack full, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;

    fn checkpoint_at(clock: &ManualClock, position: i64) -> Checkpoint {
        Checkpoint {
            position,
            at: clock.now(),
        }
    }

    #[test]
    fn test_estimate_position_200ms_at_256hz() {
        let clock = ManualClock::new();
        let cp = checkpoint_at(&clock, 1000);
        clock.advance(Duration::from_millis(200));
        assert_eq!(estimate_position(&cp, clock.now(), 256.0), 1051);
    }

    #[test]
    fn test_estimate_position_rounds_half_away_from_zero() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(10));
        let cp = checkpoint_at(&clock, 100);

        let later = cp.at + Duration::from_millis(1250);
        assert_eq!(estimate_position(&cp, later, 2.0), 103);

        let earlier = cp.at - Duration::from_millis(1250);
        assert_eq!(estimate_position(&cp, earlier, 2.0), 97);
    }

    #[test]
    fn test_estimate_position_at_checkpoint() {
        let clock = ManualClock::new();
        let cp = checkpoint_at(&clock, 4096);
        assert_eq!(estimate_position(&cp, cp.at, 2048.0), 4096);
    }

    #[test]
    fn test_swap_without_events_is_empty() {
        let tracker = EventTracker::init(2048.0, 0).unwrap();
        for _ in 0..5 {
            assert!(tracker.swap_event_stack().is_empty());
        }
    }

    #[test]
    fn test_deinit_is_idempotent() {
        let mut tracker = EventTracker::init(2048.0, 0).unwrap();
        tracker.deinit();
        tracker.deinit();
        assert!(!tracker.is_client_connected());
    }
}
