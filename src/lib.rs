//! eegview: biosignal acquisition core
//!
//! Pulls fixed-size sample blocks from an acquisition device, forwards
//! them to a display, optionally records them to file, and annotates the
//! recording with software events received over TCP.

pub mod acquisition;
pub mod common;
pub mod config;
pub mod device;
pub mod display;
pub mod event_tracker;
pub mod recording;

pub use acquisition::{Acquisition, AcquisitionConfig, AcquisitionError};
pub use event_tracker::{EventStack, EventTracker};
pub use recording::{RecordingController, RecordingError, RecordingFormat};
