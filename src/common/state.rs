//! Shared control flags between the caller thread and the acquisition thread
//!
//! ## Acquisition state machine
//! ```text
//!   ┌──────┐   start   ┌─────────┐  stop / read error  ┌─────────┐
//!   │ Idle │ ────────► │ Running │ ──────────────────► │ Stopped │
//!   └──────┘           └─────────┘                     └─────────┘
//! ```
//!
//! ## Recording state
//! ```text
//!   Paused ──start (fresh file)──► SavingWithReset ──(consumed by loop)──► Saving
//!     ▲                                                                      │
//!     └──────────────────────────────── stop ────────────────────────────────┘
//! ```
//!
//! The mutex in [`SharedControl`] guards only these small flags and is
//! never held across a blocking call.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Lifecycle of one acquisition session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AcquisitionState {
    #[default]
    Idle,
    Running,
    /// Terminal
    Stopped,
}

impl AcquisitionState {
    pub fn can_transition_to(&self, target: AcquisitionState) -> bool {
        use AcquisitionState::*;
        matches!((self, target), (Idle, Running) | (Running, Stopped) | (Idle, Stopped))
    }
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionState::Idle => write!(f, "Idle"),
            AcquisitionState::Running => write!(f, "Running"),
            AcquisitionState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Recording flag mirrored by the acquisition thread each cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecordingState {
    #[default]
    Paused,
    Saving,
    /// One-shot: the acquisition loop resets its counters and turns this
    /// into `Saving` the first time it observes it.
    SavingWithReset,
}

impl RecordingState {
    pub fn is_saving(&self) -> bool {
        !matches!(self, RecordingState::Paused)
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordingState::Paused => write!(f, "Paused"),
            RecordingState::Saving => write!(f, "Saving"),
            RecordingState::SavingWithReset => write!(f, "SavingWithReset"),
        }
    }
}

/// Snapshot taken by the acquisition loop at the top of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleFlags {
    /// False once a stop has been requested
    pub run: bool,
    pub recording: RecordingState,
    /// Id of the most recently started recording session, 0 before the first
    pub session: u64,
}

#[derive(Debug)]
struct ControlFlags {
    run: bool,
    acquisition: AcquisitionState,
    recording: RecordingState,
    session: u64,
}

/// Synchronization mutex around the control flags
#[derive(Debug)]
pub struct SharedControl {
    flags: Mutex<ControlFlags>,
}

impl Default for SharedControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedControl {
    pub fn new() -> Self {
        Self {
            flags: Mutex::new(ControlFlags {
                run: false,
                acquisition: AcquisitionState::Idle,
                recording: RecordingState::Paused,
                session: 0,
            }),
        }
    }

    pub fn acquisition_state(&self) -> AcquisitionState {
        self.flags.lock().acquisition
    }

    /// Move the acquisition state machine, returning false if the
    /// transition is not allowed
    pub fn transition_to(&self, to: AcquisitionState) -> bool {
        let mut flags = self.flags.lock();
        let from = flags.acquisition;
        if !from.can_transition_to(to) {
            return false;
        }
        flags.acquisition = to;
        flags.run = to == AcquisitionState::Running;
        drop(flags);
        info!(from = %from, to = %to, "Acquisition state transition");
        true
    }

    /// Ask the acquisition loop to stop at the top of its next cycle
    pub fn request_halt(&self) {
        self.flags.lock().run = false;
    }

    pub fn is_running(&self) -> bool {
        self.flags.lock().run
    }

    pub fn recording_state(&self) -> RecordingState {
        self.flags.lock().recording
    }

    pub fn set_recording_state(&self, state: RecordingState) {
        self.flags.lock().recording = state;
    }

    pub fn recording_session(&self) -> u64 {
        self.flags.lock().session
    }

    /// Leave `Paused` under a new session id
    ///
    /// Returns `None` and changes nothing if already saving.
    pub fn begin_session(&self, reset: bool) -> Option<u64> {
        let mut flags = self.flags.lock();
        if flags.recording.is_saving() {
            return None;
        }
        flags.recording = if reset {
            RecordingState::SavingWithReset
        } else {
            RecordingState::Saving
        };
        flags.session += 1;
        Some(flags.session)
    }

    /// Read the run flag and recording state for one cycle.
    ///
    /// `SavingWithReset` is consumed here: it is returned once and the
    /// shared state becomes `Saving`, so the reset happens on exactly one
    /// cycle.
    pub fn take_cycle_flags(&self) -> CycleFlags {
        let mut flags = self.flags.lock();
        let recording = flags.recording;
        if recording == RecordingState::SavingWithReset {
            flags.recording = RecordingState::Saving;
        }
        CycleFlags {
            run: flags.run,
            recording,
            session: flags.session,
        }
    }
}
