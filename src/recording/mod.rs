//! Recording files and the controller that guards them
//!
//! [`RecordingFile`] is the interface the acquisition loop writes through;
//! [`DataFileWriter`] is the implementation backed by the format in
//! [`format`]. [`RecordingController`] owns the open file and the
//! recording state shared with the acquisition thread.

pub mod controller;
pub mod format;
pub mod writer;

pub use controller::{RecordingController, RecordingSetup};
pub use format::{
    DataRecord, EventAnnotation, FileFooter, FileFormatError, RecordBlock, RecordingContents,
    RecordingHeader, RecordingReader, ValidationReport,
};
pub use writer::DataFileWriter;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{ChannelLayout, SampleBlock};
use crate::device::EEG_SCALE_UV;

/// Recording errors
#[derive(Error, Debug)]
pub enum RecordingError {
    /// The file could not be created or configured
    #[error("Cannot set up recording: {0}")]
    Setup(String),

    /// A write to an open file failed
    #[error("Recording write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("This file format does not support event annotations")]
    AnnotationsUnsupported,

    #[error("Block layout {block:?} does not match the recording channels {file:?}")]
    LayoutMismatch {
        block: ChannelLayout,
        file: ChannelLayout,
    },

    #[error("No recording file has been set up")]
    NoFile,

    #[error("A recording is already in progress")]
    AlreadyRecording,

    #[error("Failed to close recording: {0}")]
    Close(#[source] std::io::Error),
}

/// Recording file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingFormat {
    /// Samples only
    Samples,
    /// Samples plus embedded event annotations
    #[default]
    Annotated,
}

impl RecordingFormat {
    pub fn supports_events(&self) -> bool {
        matches!(self, RecordingFormat::Annotated)
    }
}

impl FromStr for RecordingFormat {
    type Err = RecordingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "samples" => Ok(RecordingFormat::Samples),
            "annotated" => Ok(RecordingFormat::Annotated),
            other => Err(RecordingError::Setup(format!("unknown recording format '{other}'"))),
        }
    }
}

impl fmt::Display for RecordingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordingFormat::Samples => write!(f, "samples"),
            RecordingFormat::Annotated => write!(f, "annotated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Eeg,
    Exg,
    Trigger,
}

/// Channel descriptor stored in the recording header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub label: String,
    pub kind: ChannelKind,
    pub transducer: String,
    pub unit: String,
    pub physical_min: f64,
    pub physical_max: f64,
    pub digital_min: i32,
    pub digital_max: i32,
}

/// 24-bit signed range of the amplifier
const DIGITAL_MIN: i32 = -8_388_608;
const DIGITAL_MAX: i32 = 8_388_607;

impl ChannelInfo {
    fn electrode(label: &str, kind: ChannelKind) -> Self {
        let uv_per_count = (EEG_SCALE_UV * 256.0) as f64;
        Self {
            label: label.to_string(),
            kind,
            transducer: "Active Electrode".to_string(),
            unit: "uV".to_string(),
            physical_min: DIGITAL_MIN as f64 * uv_per_count,
            physical_max: DIGITAL_MAX as f64 * uv_per_count,
            digital_min: DIGITAL_MIN,
            digital_max: DIGITAL_MAX,
        }
    }

    pub fn eeg(label: &str) -> Self {
        Self::electrode(label, ChannelKind::Eeg)
    }

    pub fn exg(label: &str) -> Self {
        Self::electrode(label, ChannelKind::Exg)
    }

    pub fn trigger(label: &str) -> Self {
        Self {
            label: label.to_string(),
            kind: ChannelKind::Trigger,
            transducer: "Triggers and Status".to_string(),
            unit: "Boolean".to_string(),
            physical_min: 0.0,
            physical_max: 65535.0,
            digital_min: 0,
            digital_max: 65535,
        }
    }
}

/// Channel descriptors for a layout: EEG, then EXG, then the trigger
///
/// Missing labels fall back to `EEG<n>` / `EXG<n>` (1-based).
pub fn describe_channels(
    layout: ChannelLayout,
    eeg_labels: &[String],
    exg_labels: &[String],
) -> Vec<ChannelInfo> {
    let label = |labels: &[String], prefix: &str, i: usize| {
        labels
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("{prefix}{}", i + 1))
    };

    let mut channels = Vec::with_capacity(layout.total());
    channels.extend((0..layout.eeg).map(|i| ChannelInfo::eeg(&label(eeg_labels, "EEG", i))));
    channels.extend((0..layout.exg).map(|i| ChannelInfo::exg(&label(exg_labels, "EXG", i))));
    channels.push(ChannelInfo::trigger("Status"));
    channels
}

/// A recording file being written
///
/// Lifecycle: `configure` → `add_channel`* → `prepare_for_transfer` →
/// (`write_block` | `add_event`)* → `close`.
pub trait RecordingFile: Send {
    /// `sampling_rate` is the device rate, stored as given; it is not
    /// derived from the rounded `samples_per_record`.
    fn configure(
        &mut self,
        sampling_rate: f64,
        record_duration_secs: f64,
        samples_per_record: u32,
    ) -> Result<(), RecordingError>;

    fn add_channel(&mut self, channel: ChannelInfo) -> Result<(), RecordingError>;

    fn prepare_for_transfer(&mut self) -> Result<(), RecordingError>;

    fn write_block(&mut self, block: &SampleBlock) -> Result<(), RecordingError>;

    fn supports_events(&self) -> bool;

    fn add_event(&mut self, event_type: u32, onset_secs: f64) -> Result<(), RecordingError>;

    fn close(self: Box<Self>) -> Result<(), RecordingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse_and_display() {
        assert_eq!(
            "Annotated".parse::<RecordingFormat>().unwrap(),
            RecordingFormat::Annotated
        );
        assert_eq!(RecordingFormat::Samples.to_string(), "samples");
        assert!(matches!(
            "edf".parse::<RecordingFormat>(),
            Err(RecordingError::Setup(_))
        ));
    }

    #[test]
    fn test_only_annotated_supports_events() {
        assert!(RecordingFormat::Annotated.supports_events());
        assert!(!RecordingFormat::Samples.supports_events());
    }

    #[test]
    fn test_describe_channels_labels_and_order() {
        let labels = vec!["Fp1".to_string()];
        let channels = describe_channels(ChannelLayout::new(2, 1), &labels, &[]);

        let names: Vec<&str> = channels.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(names, vec!["Fp1", "EEG2", "EXG1", "Status"]);
        assert_eq!(channels[3].kind, ChannelKind::Trigger);
    }

    #[test]
    fn test_electrode_physical_range() {
        let ch = ChannelInfo::eeg("Cz");
        assert_eq!(ch.physical_min, -262_144.0);
        assert!((ch.physical_max - 262_143.968_75).abs() < 1e-6);
    }
}
