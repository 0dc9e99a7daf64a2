//! Acquisition loop and its owning context
//!
//! [`Acquisition`] is the handle the caller keeps: it configures and
//! starts the device, brings up the event tracker, and spawns the
//! acquisition thread. Each cycle of that thread:
//!
//! 1. reads the run flag and recording state (consuming `SavingWithReset`)
//! 2. stops if asked to
//! 3. blocks on the device for one block; a read error ends the session
//! 4. publishes the read checkpoint and takes the event snapshot
//! 5. writes samples and events if saving; a write failure stops the
//!    recording and notifies the user on a detached thread
//! 6. forwards samples and events to the display
//!
//! The recording file is locked only for the duration of each write, so
//! [`Acquisition::stop_recording`] from another thread waits at most one
//! write.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::common::{
    AcquisitionState, ChannelLayout, Clock, CycleFlags, RecordingState, SampleBlock,
    SharedControl, SystemClock,
};
use crate::device::{scale_to_uv, trigger_value, ChannelGroups, Device, DeviceError};
use crate::display::{DisplaySink, Tab};
use crate::event_tracker::{EventStack, EventTracker, TrackerConfig};
use crate::recording::{
    describe_channels, DataFileWriter, RecordingController, RecordingError, RecordingFile,
    RecordingFormat, RecordingSetup,
};

/// Acquisition errors
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to spawn acquisition thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Acquisition thread panicked")]
    ThreadPanicked,
}

/// Session settings
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub groups: ChannelGroups,
    /// Samples per device read
    pub block_size: usize,
    /// `None` disables software events
    pub events: Option<TrackerConfig>,
    pub record_duration_secs: f64,
    pub eeg_labels: Vec<String>,
    pub exg_labels: Vec<String>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            groups: ChannelGroups::default(),
            block_size: 32,
            events: Some(TrackerConfig::default()),
            record_duration_secs: 1.0,
            eeg_labels: Vec::new(),
            exg_labels: Vec::new(),
        }
    }
}

/// Counters updated by the acquisition thread
#[derive(Debug, Default)]
pub struct AcquisitionMetrics {
    pub samples_read: AtomicU64,
    pub blocks_read: AtomicU64,
    pub events_received: AtomicU64,
    pub samples_recorded: AtomicU64,
    pub write_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AcquisitionStats {
    pub samples_read: u64,
    pub blocks_read: u64,
    pub events_received: u64,
    pub samples_recorded: u64,
    pub write_failures: u64,
}

impl AcquisitionMetrics {
    pub fn snapshot(&self) -> AcquisitionStats {
        AcquisitionStats {
            samples_read: self.samples_read.load(Ordering::Relaxed),
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            samples_recorded: self.samples_recorded.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Acquisition-thread view of the current recording session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordingCursor {
    saving: bool,
    session: u64,
    recorded: u64,
    start_offset: i64,
}

impl RecordingCursor {
    /// Mirror the shared recording state; true if saving toggled
    ///
    /// `SavingWithReset` restarts the session at `total_read`.
    pub fn observe(&mut self, flags: CycleFlags, total_read: i64) -> bool {
        if flags.recording == RecordingState::SavingWithReset {
            self.recorded = 0;
            self.start_offset = total_read;
        }
        let saving = flags.recording.is_saving();
        let changed = saving != self.saving;
        self.saving = saving;
        self.session = flags.session;
        changed
    }

    pub fn is_saving(&self) -> bool {
        self.saving
    }

    /// Recording session the cursor was last told about
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Samples written in this session
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    /// Total-read count at which the session started
    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    pub fn advance(&mut self, samples: usize) {
        self.recorded += samples as u64;
    }

    pub fn halt(&mut self) {
        self.saving = false;
    }

    /// Seconds from session start to `position`; `None` if before it
    pub fn onset_secs(&self, position: i64, sampling_rate: f64) -> Option<f64> {
        let offset = position - self.start_offset;
        (offset >= 0).then(|| offset as f64 / sampling_rate)
    }

    pub fn elapsed(&self, sampling_rate: f64) -> Duration {
        Duration::from_secs_f64(self.recorded as f64 / sampling_rate)
    }
}

/// Handle on a running acquisition session
pub struct Acquisition {
    control: Arc<SharedControl>,
    recording: Arc<RecordingController>,
    metrics: Arc<AcquisitionMetrics>,
    thread: Option<JoinHandle<()>>,
    layout: ChannelLayout,
    sampling_rate: u32,
    event_addr: Option<SocketAddr>,
    record_duration_secs: f64,
    eeg_labels: Vec<String>,
    exg_labels: Vec<String>,
}

impl Acquisition {
    /// Configure and start `device`, then run the acquisition thread
    pub fn start(
        config: &AcquisitionConfig,
        device: Box<dyn Device>,
        display: Arc<dyn DisplaySink>,
    ) -> Result<Self, AcquisitionError> {
        Self::start_with_clock(config, device, display, Arc::new(SystemClock))
    }

    /// [`Acquisition::start`] with an explicit time source for event stamping
    pub fn start_with_clock(
        config: &AcquisitionConfig,
        mut device: Box<dyn Device>,
        display: Arc<dyn DisplaySink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AcquisitionError> {
        if config.block_size == 0 {
            return Err(AcquisitionError::Config("block_size must be positive".to_string()));
        }
        if !(config.record_duration_secs > 0.0) {
            return Err(AcquisitionError::Config(
                "record_duration_sec must be positive".to_string(),
            ));
        }

        let caps = device.capabilities();
        let layout = device.configure_groups(config.groups)?;
        device.start()?;
        info!(
            device = device.name(),
            sampling_rate = caps.sampling_rate,
            eeg = layout.eeg,
            exg = layout.exg,
            block_size = config.block_size,
            "Device started"
        );

        let tracker = config.events.as_ref().and_then(|tracker_config| {
            match EventTracker::with_clock(caps.sampling_rate as f64, tracker_config, clock) {
                Ok(tracker) => Some(tracker),
                Err(e) => {
                    warn!(error = %e, "Event tracking disabled for this session");
                    None
                }
            }
        });
        let event_addr = tracker.as_ref().map(EventTracker::local_addr);

        let control = Arc::new(SharedControl::new());
        let recording = Arc::new(RecordingController::new(Arc::clone(&control)));
        let metrics = Arc::new(AcquisitionMetrics::default());
        control.transition_to(AcquisitionState::Running);

        let worker = AcquisitionLoop {
            device,
            tracker,
            control: Arc::clone(&control),
            recording: Arc::clone(&recording),
            display,
            metrics: Arc::clone(&metrics),
            layout,
            block_size: config.block_size,
            sampling_rate: caps.sampling_rate as f64,
        };
        let thread = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                control.transition_to(AcquisitionState::Stopped);
                AcquisitionError::Spawn(e)
            })?;

        Ok(Self {
            control,
            recording,
            metrics,
            thread: Some(thread),
            layout,
            sampling_rate: caps.sampling_rate,
            event_addr,
            record_duration_secs: config.record_duration_secs,
            eeg_labels: config.eeg_labels.clone(),
            exg_labels: config.exg_labels.clone(),
        })
    }

    pub fn state(&self) -> AcquisitionState {
        self.control.acquisition_state()
    }

    /// True once the acquisition thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    /// Address of the event tracker, if it is running
    pub fn event_address(&self) -> Option<SocketAddr> {
        self.event_addr
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.metrics.snapshot()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.recording.state()
    }

    /// Descriptor set applied to every new recording file
    pub fn recording_setup(&self) -> RecordingSetup {
        RecordingSetup {
            sampling_rate: self.sampling_rate,
            record_duration_secs: self.record_duration_secs,
            channels: describe_channels(self.layout, &self.eeg_labels, &self.exg_labels),
        }
    }

    /// Create `path` and prepare it for the next recording
    pub fn setup_recording<P: AsRef<Path>>(
        &self,
        path: P,
        format: RecordingFormat,
    ) -> Result<(), RecordingError> {
        let file = DataFileWriter::create(path, format)?;
        self.setup_recording_with(Box::new(file))
    }

    /// Prepare an arbitrary [`RecordingFile`] for the next recording
    pub fn setup_recording_with(&self, file: Box<dyn RecordingFile>) -> Result<(), RecordingError> {
        self.recording.setup(file, &self.recording_setup())
    }

    pub fn start_recording(&self) -> Result<RecordingState, RecordingError> {
        self.recording.request_start()
    }

    pub fn stop_recording(&self) -> Result<(), RecordingError> {
        self.recording.request_stop()
    }

    /// Close any recording, stop the loop and wait for it. Idempotent.
    pub fn stop(&mut self) -> Result<(), AcquisitionError> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };

        if let Err(e) = self.recording.request_stop() {
            warn!(error = %e, "Recording did not close cleanly on stop");
        }
        self.control.request_halt();

        handle.join().map_err(|_| AcquisitionError::ThreadPanicked)
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "Acquisition did not stop cleanly");
        }
    }
}

/// Reusable buffers for display conversion
struct DisplayBuffers {
    eeg: Vec<f32>,
    exg: Vec<f32>,
    triggers: Vec<u32>,
}

impl DisplayBuffers {
    fn new(layout: ChannelLayout, block_size: usize) -> Self {
        Self {
            eeg: Vec::with_capacity(layout.eeg * block_size),
            exg: Vec::with_capacity(layout.exg * block_size),
            triggers: Vec::with_capacity(block_size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Requested,
    DeviceError,
}

/// State owned by the acquisition thread
struct AcquisitionLoop {
    device: Box<dyn Device>,
    tracker: Option<EventTracker>,
    control: Arc<SharedControl>,
    recording: Arc<RecordingController>,
    display: Arc<dyn DisplaySink>,
    metrics: Arc<AcquisitionMetrics>,
    layout: ChannelLayout,
    block_size: usize,
    sampling_rate: f64,
}

impl AcquisitionLoop {
    fn run(mut self) {
        let mut block = SampleBlock::new(self.layout, self.block_size);
        let mut buffers = DisplayBuffers::new(self.layout, self.block_size);
        let mut cursor = RecordingCursor::default();
        let mut total_read: i64 = 0;

        let exit = loop {
            let flags = self.control.take_cycle_flags();
            if cursor.observe(flags, total_read) {
                info!(
                    saving = cursor.is_saving(),
                    session = cursor.session(),
                    start_offset = cursor.start_offset(),
                    "Recording flag changed"
                );
            }
            if !flags.run {
                break LoopExit::Requested;
            }

            let n = match self.device.read_block(&mut block) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, total_read, "Device read failed");
                    self.display.on_disconnected();
                    self.display.on_popup_message(&e.user_message());
                    break LoopExit::DeviceError;
                }
            };
            total_read += n as i64;
            self.metrics.samples_read.fetch_add(n as u64, Ordering::Relaxed);
            self.metrics.blocks_read.fetch_add(1, Ordering::Relaxed);

            let events = match &self.tracker {
                Some(tracker) => {
                    tracker.update_read_checkpoint(total_read);
                    tracker.swap_event_stack()
                }
                None => EventStack::new(),
            };
            self.metrics
                .events_received
                .fetch_add(events.len() as u64, Ordering::Relaxed);

            if cursor.is_saving() {
                self.record(&block, &events, &mut cursor);
            }
            self.forward(&block, &events, &mut buffers);
        };

        self.finish(exit, total_read);
    }

    fn record(&self, block: &SampleBlock, events: &EventStack, cursor: &mut RecordingCursor) {
        let sampling_rate = self.sampling_rate;
        let snapshot = *cursor;
        let result = self.recording.write_with(snapshot.session(), |file| {
            file.write_block(block)?;
            if file.supports_events() {
                for event in events {
                    match snapshot.onset_secs(event.position, sampling_rate) {
                        Some(onset) => file.add_event(event.event_type, onset)?,
                        None => debug!(
                            position = event.position,
                            start = snapshot.start_offset(),
                            "Event precedes recording start, not annotated"
                        ),
                    }
                }
            }
            Ok(())
        });

        match result {
            Ok(true) => {
                cursor.advance(block.len());
                self.metrics
                    .samples_recorded
                    .fetch_add(block.len() as u64, Ordering::Relaxed);
                self.display.on_recording_time(cursor.elapsed(sampling_rate));
            }
            Ok(false) => {
                debug!(session = snapshot.session(), "Recording session ended, write skipped");
                cursor.halt();
            }
            Err(e) => {
                error!(error = %e, recorded = cursor.recorded(), "Recording write failed");
                cursor.halt();
                self.metrics.write_failures.fetch_add(1, Ordering::Relaxed);
                match self.recording.stop_session(snapshot.session()) {
                    Ok(true) => self.notify_detached(format!("Recording stopped: {e}")),
                    Ok(false) => debug!("Failed session already ended, newer recording left open"),
                    Err(close_err) => {
                        warn!(error = %close_err, "Failed recording did not close cleanly");
                        self.notify_detached(format!("Recording stopped: {e}"));
                    }
                }
            }
        }
    }

    /// Deliver a popup without waiting for the display
    fn notify_detached(&self, message: String) {
        let display = Arc::clone(&self.display);
        let spawned = thread::Builder::new()
            .name("notify".to_string())
            .spawn(move || display.on_popup_message(&message));
        if let Err(e) = spawned {
            warn!(error = %e, "Cannot spawn notification thread");
        }
    }

    fn forward(&self, block: &SampleBlock, events: &EventStack, buffers: &mut DisplayBuffers) {
        let n = block.len();
        if self.layout.eeg > 0 {
            buffers.eeg.clear();
            buffers.eeg.extend(block.eeg().iter().map(|&v| scale_to_uv(v)));
            self.display.on_samples(Tab::Eeg, n, &buffers.eeg);
        }
        if self.layout.exg > 0 {
            buffers.exg.clear();
            buffers.exg.extend(block.exg().iter().map(|&v| scale_to_uv(v)));
            self.display.on_samples(Tab::Exg, n, &buffers.exg);
        }
        buffers.triggers.clear();
        buffers
            .triggers
            .extend(block.triggers().iter().map(|&t| trigger_value(t)));
        self.display.on_triggers(n, &buffers.triggers);

        if !events.is_empty() {
            self.display.on_events(Tab::Eeg, events.as_slice());
        }
    }

    fn finish(mut self, exit: LoopExit, total_read: i64) {
        if let Some(mut tracker) = self.tracker.take() {
            tracker.deinit();
        }
        if let Err(e) = self.device.stop() {
            warn!(error = %e, "Device did not stop cleanly");
        }
        self.control.transition_to(AcquisitionState::Stopped);
        info!(?exit, total_read, "Acquisition loop finished");
    }
}
