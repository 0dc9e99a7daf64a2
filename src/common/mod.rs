//! Common data types shared across components
//!
//! This module defines the sample block exchanged between the device, the
//! acquisition loop and its consumers, the software event record produced
//! by the event tracker, and the shared control flags.

use serde::{Deserialize, Serialize};

pub mod cli;
pub mod clock;
pub mod shutdown;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use state::{AcquisitionState, CycleFlags, RecordingState, SharedControl};

/// Software event attached to an estimated position in the sample stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SoftwareEvent {
    /// Estimated sample index (monotonic, signed)
    pub position: i64,
    /// Event code sent by the client
    pub event_type: u32,
}

impl SoftwareEvent {
    pub fn new(position: i64, event_type: u32) -> Self {
        Self {
            position,
            event_type,
        }
    }
}

/// Number of channels in each category of a block
///
/// Every block also carries exactly one trigger channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelLayout {
    pub eeg: usize,
    pub exg: usize,
}

impl ChannelLayout {
    pub fn new(eeg: usize, exg: usize) -> Self {
        Self { eeg, exg }
    }

    /// Total channel count including the trigger channel
    pub fn total(&self) -> usize {
        self.eeg + self.exg + 1
    }
}

/// One block of consecutively acquired samples across all channels
///
/// Sample storage is frame-major: `eeg[frame * layout.eeg + channel]`.
/// Raw values are what the device delivers (24-bit data in the upper bits
/// of an `i32` for EEG/EXG, status word for the trigger channel).
#[derive(Debug, Clone)]
pub struct SampleBlock {
    layout: ChannelLayout,
    capacity: usize,
    len: usize,
    eeg: Vec<i32>,
    exg: Vec<i32>,
    triggers: Vec<u32>,
}

impl SampleBlock {
    /// Allocate a block able to hold `capacity` samples per channel
    pub fn new(layout: ChannelLayout, capacity: usize) -> Self {
        Self {
            layout,
            capacity,
            len: 0,
            eeg: vec![0; layout.eeg * capacity],
            exg: vec![0; layout.exg * capacity],
            triggers: vec![0; capacity],
        }
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of valid samples per channel
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark the first `len` frames as valid (clamped to capacity)
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity);
    }

    /// Valid EEG samples, frame-major
    pub fn eeg(&self) -> &[i32] {
        &self.eeg[..self.len * self.layout.eeg]
    }

    /// Valid EXG samples, frame-major
    pub fn exg(&self) -> &[i32] {
        &self.exg[..self.len * self.layout.exg]
    }

    /// Valid trigger samples
    pub fn triggers(&self) -> &[u32] {
        &self.triggers[..self.len]
    }

    /// Full EEG buffer for the device to fill
    pub fn eeg_mut(&mut self) -> &mut [i32] {
        &mut self.eeg
    }

    /// Full EXG buffer for the device to fill
    pub fn exg_mut(&mut self) -> &mut [i32] {
        &mut self.exg
    }

    /// Full trigger buffer for the device to fill
    pub fn triggers_mut(&mut self) -> &mut [u32] {
        &mut self.triggers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_total_includes_trigger() {
        assert_eq!(ChannelLayout::new(64, 8).total(), 73);
        assert_eq!(ChannelLayout::new(0, 0).total(), 1);
    }

    #[test]
    fn test_sample_block_views_follow_len() {
        let mut block = SampleBlock::new(ChannelLayout::new(2, 1), 4);
        assert!(block.is_empty());
        assert_eq!(block.eeg_mut().len(), 8);

        block.set_len(3);
        assert_eq!(block.eeg().len(), 6);
        assert_eq!(block.exg().len(), 3);
        assert_eq!(block.triggers().len(), 3);
    }

    #[test]
    fn test_sample_block_len_is_clamped() {
        let mut block = SampleBlock::new(ChannelLayout::new(1, 0), 4);
        block.set_len(10);
        assert_eq!(block.len(), 4);
    }
}
