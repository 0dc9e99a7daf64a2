//! Acquisition device abstraction
//!
//! The acquisition loop only talks to a [`Device`]: query capabilities,
//! select channel groups, start/stop the stream and block on
//! [`Device::read_block`]. Hardware drivers and the synthetic
//! [`emulator::Emulator`] implement it.

pub mod emulator;

pub use emulator::{Emulator, EmulatorConfig};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{ChannelLayout, SampleBlock};

/// Microvolts per raw count (24-bit data left-aligned in an i32)
pub const EEG_SCALE_UV: f32 = 0.031_25 / 256.0;

/// Device errors
///
/// Every variant is fatal to the acquisition session that hits it.
/// [`DeviceError::user_message`] gives the text shown to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Failed to open the device driver")]
    OpenFailed,

    #[error("Synchronization with the ADC box is lost")]
    SyncLost,

    #[error("Acquisition has not been started")]
    NotStarted,

    #[error("Device buffer is full")]
    BufferFull,

    #[error("Unsupported option: {0}")]
    BadOption(String),

    #[error("Device I/O error (code {code}): {message}")]
    Io { code: i32, message: String },

    #[error("Unknown device: {0}")]
    NotFound(String),
}

impl DeviceError {
    /// Human-readable message for popups
    pub fn user_message(&self) -> String {
        match self {
            DeviceError::OpenFailed => "Attempt to open the driver failed.\n\n\
                Check that it is correctly installed, or that the USB cable is plugged."
                .to_string(),
            DeviceError::SyncLost => "The synchronization with the ADC box is lost.\n\n\
                Check that the ADC box is switched on or that the optical cable is plugged."
                .to_string(),
            DeviceError::NotStarted => "An attempt to get the data in buffered mode has been made, \
                but the acquisition has not been started yet."
                .to_string(),
            DeviceError::BufferFull => "The buffer is full. Data has been lost".to_string(),
            DeviceError::BadOption(detail) => format!(
                "The specified option is not supported or is not consistent \
                 with the capabilities of the system ({detail})"
            ),
            DeviceError::Io { code, message } => {
                format!("Device I/O error (code {code}): {message}")
            }
            DeviceError::NotFound(id) => format!("No device matches \"{id}\""),
        }
    }
}

/// What the device can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub sampling_rate: u32,
    pub max_eeg: usize,
    pub max_exg: usize,
}

/// EEG channel set selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EegSet {
    /// Everything the device offers
    All,
    /// 32 channels
    A,
    /// 64 channels
    #[default]
    AB,
    /// 128 channels
    AD,
}

impl EegSet {
    pub fn channel_count(&self, max: usize) -> usize {
        match self {
            EegSet::All => max,
            EegSet::A => 32,
            EegSet::AB => 64,
            EegSet::AD => 128,
        }
    }
}

impl FromStr for EegSet {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(EegSet::All),
            "a" => Ok(EegSet::A),
            "ab" => Ok(EegSet::AB),
            "ad" => Ok(EegSet::AD),
            other => Err(DeviceError::BadOption(format!("unknown EEG set '{other}'"))),
        }
    }
}

impl TryFrom<String> for EegSet {
    type Error = DeviceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EegSet> for String {
    fn from(set: EegSet) -> Self {
        set.to_string()
    }
}

impl fmt::Display for EegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EegSet::All => write!(f, "all"),
            EegSet::A => write!(f, "A"),
            EegSet::AB => write!(f, "AB"),
            EegSet::AD => write!(f, "AD"),
        }
    }
}

/// EXG (external sensor) channel set selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExgSet {
    All,
    /// 8 channels
    #[default]
    Std,
    None,
}

impl ExgSet {
    pub fn channel_count(&self, max: usize) -> usize {
        match self {
            ExgSet::All => max,
            ExgSet::Std => 8,
            ExgSet::None => 0,
        }
    }
}

impl FromStr for ExgSet {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(ExgSet::All),
            "std" => Ok(ExgSet::Std),
            "none" => Ok(ExgSet::None),
            other => Err(DeviceError::BadOption(format!("unknown EXG set '{other}'"))),
        }
    }
}

impl TryFrom<String> for ExgSet {
    type Error = DeviceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ExgSet> for String {
    fn from(set: ExgSet) -> Self {
        set.to_string()
    }
}

impl fmt::Display for ExgSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExgSet::All => write!(f, "all"),
            ExgSet::Std => write!(f, "STD"),
            ExgSet::None => write!(f, "none"),
        }
    }
}

/// Channel groups requested from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelGroups {
    pub eeg: EegSet,
    pub exg: ExgSet,
}

impl ChannelGroups {
    pub fn new(eeg: EegSet, exg: ExgSet) -> Self {
        Self { eeg, exg }
    }

    /// Channel counts these groups select on a device with `caps`
    pub fn resolve(&self, caps: &Capabilities) -> Result<ChannelLayout, DeviceError> {
        let eeg = self.eeg.channel_count(caps.max_eeg);
        let exg = self.exg.channel_count(caps.max_exg);
        if eeg > caps.max_eeg {
            return Err(DeviceError::BadOption(format!(
                "EEG set {} needs {} channels, device has {}",
                self.eeg, eeg, caps.max_eeg
            )));
        }
        if exg > caps.max_exg {
            return Err(DeviceError::BadOption(format!(
                "EXG set {} needs {} channels, device has {}",
                self.exg, exg, caps.max_exg
            )));
        }
        Ok(ChannelLayout::new(eeg, exg))
    }
}

/// Acquisition device
pub trait Device: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Select channel groups; must happen before [`Device::start`]
    fn configure_groups(&mut self, groups: ChannelGroups) -> Result<ChannelLayout, DeviceError>;

    fn start(&mut self) -> Result<(), DeviceError>;

    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Block until `block` is filled; returns the number of samples read
    /// per channel
    fn read_block(&mut self, block: &mut SampleBlock) -> Result<usize, DeviceError>;
}

/// Open a device by identifier
pub fn open(identifier: &str, emulator: &EmulatorConfig) -> Result<Box<dyn Device>, DeviceError> {
    match identifier.to_ascii_lowercase().as_str() {
        "emulator" | "fake" => Ok(Box::new(Emulator::new(emulator.clone()))),
        _ => Err(DeviceError::NotFound(identifier.to_string())),
    }
}

/// Raw EEG/EXG count to microvolts
pub fn scale_to_uv(raw: i32) -> f32 {
    raw as f32 * EEG_SCALE_UV
}

/// Raw status word to the 16-bit trigger value
pub fn trigger_value(raw: u32) -> u32 {
    (raw >> 8) & 0xFFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capabilities {
        Capabilities {
            sampling_rate: 2048,
            max_eeg: 64,
            max_exg: 24,
        }
    }

    #[test]
    fn test_eeg_set_parse_is_case_insensitive() {
        assert_eq!("ab".parse::<EegSet>().unwrap(), EegSet::AB);
        assert_eq!("AD".parse::<EegSet>().unwrap(), EegSet::AD);
        assert_eq!("All".parse::<EegSet>().unwrap(), EegSet::All);
        assert!("B".parse::<EegSet>().is_err());
    }

    #[test]
    fn test_exg_set_parse() {
        assert_eq!("std".parse::<ExgSet>().unwrap(), ExgSet::Std);
        assert_eq!("NONE".parse::<ExgSet>().unwrap(), ExgSet::None);
        assert!("half".parse::<ExgSet>().is_err());
    }

    #[test]
    fn test_resolve_default_groups() {
        let layout = ChannelGroups::default().resolve(&caps()).unwrap();
        assert_eq!(layout, ChannelLayout::new(64, 8));
    }

    #[test]
    fn test_resolve_all_uses_device_max() {
        let layout = ChannelGroups::new(EegSet::All, ExgSet::All)
            .resolve(&caps())
            .unwrap();
        assert_eq!(layout, ChannelLayout::new(64, 24));
    }

    #[test]
    fn test_resolve_rejects_oversized_set() {
        let err = ChannelGroups::new(EegSet::AD, ExgSet::Std)
            .resolve(&caps())
            .unwrap_err();
        assert!(matches!(err, DeviceError::BadOption(_)));
        assert!(err.user_message().contains("not supported"));
    }

    #[test]
    fn test_open_unknown_device() {
        let result = open("activetwo-usb", &EmulatorConfig::default());
        assert!(matches!(result, Err(DeviceError::NotFound(_))));
    }

    #[test]
    fn test_open_emulator() {
        let device = open("Emulator", &EmulatorConfig::default()).unwrap();
        assert_eq!(device.capabilities().sampling_rate, 2048);
    }

    #[test]
    fn test_trigger_value_and_scale() {
        assert_eq!(trigger_value(3 << 8), 3);
        assert_eq!(trigger_value(0xFF), 0);
        assert_eq!(scale_to_uv(256), 0.031_25);
    }

    #[test]
    fn test_sync_lost_message() {
        assert!(DeviceError::SyncLost
            .user_message()
            .starts_with("The synchronization with the ADC box is lost."));
    }
}
