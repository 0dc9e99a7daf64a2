//! Configuration for the eegview binaries
//!
//! Loaded from TOML; every section and field is optional.
//!
//! # Example
//! ```ignore
//! let config = Config::load("eegview.toml")?;
//! let device = device::open(&config.acquisition.device, &config.emulator)?;
//! let acq = Acquisition::start(&config.acquisition_config(), device, display)?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::acquisition::AcquisitionConfig;
use crate::device::{ChannelGroups, EegSet, EmulatorConfig, ExgSet};
use crate::event_tracker::{TrackerConfig, DEFAULT_PORT};
use crate::recording::RecordingFormat;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub acquisition: AcquisitionSection,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default)]
    pub recording: RecordingSection,
    #[serde(default)]
    pub emulator: EmulatorConfig,
    #[serde(default)]
    pub labels: LabelsSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionSection {
    /// Identifier passed to `device::open`
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub eeg_set: EegSet,
    #[serde(default)]
    pub exg_set: ExgSet,
    /// Samples per read
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

impl Default for AcquisitionSection {
    fn default() -> Self {
        Self {
            device: default_device(),
            eeg_set: EegSet::default(),
            exg_set: ExgSet::default(),
            block_size: default_block_size(),
        }
    }
}

fn default_device() -> String {
    "emulator".to_string()
}

fn default_block_size() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bounded accept wait in milliseconds
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_port(),
            accept_poll_ms: default_accept_poll_ms(),
        }
    }
}

impl EventsSection {
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            port: self.port,
            accept_timeout: Duration::from_millis(self.accept_poll_ms),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_accept_poll_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingSection {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default)]
    pub format: RecordingFormat,
    /// Seconds of signal per data record
    #[serde(default = "default_record_duration")]
    pub record_duration_sec: f64,
}

impl Default for RecordingSection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            file_prefix: default_file_prefix(),
            format: RecordingFormat::default(),
            record_duration_sec: default_record_duration(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_file_prefix() -> String {
    "eegview".to_string()
}

fn default_record_duration() -> f64 {
    1.0
}

/// Channel label overrides, in channel order
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelsSection {
    #[serde(default)]
    pub eeg: Vec<String>,
    #[serde(default)]
    pub exg: Vec<String>,
}

impl Config {
    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.acquisition.block_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "acquisition.block_size",
                reason: "must be positive".to_string(),
            });
        }
        if !(self.recording.record_duration_sec > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "recording.record_duration_sec",
                reason: "must be positive".to_string(),
            });
        }
        if self.emulator.sampling_rate == 0 {
            return Err(ConfigError::InvalidValue {
                field: "emulator.sampling_rate",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn acquisition_config(&self) -> AcquisitionConfig {
        AcquisitionConfig {
            groups: ChannelGroups::new(self.acquisition.eeg_set, self.acquisition.exg_set),
            block_size: self.acquisition.block_size,
            events: self.events.enabled.then(|| self.events.tracker_config()),
            record_duration_secs: self.recording.record_duration_sec,
            eeg_labels: self.labels.eeg.clone(),
            exg_labels: self.labels.exg.clone(),
        }
    }

    /// Fresh file name in the output directory for a recording started at
    /// `started`; never overwrites an existing file
    pub fn recording_path(&self, started: DateTime<Local>) -> PathBuf {
        let stem = format!(
            "{}_{}",
            self.recording.file_prefix,
            started.format("%Y%m%d_%H%M%S")
        );
        let dir = &self.recording.output_dir;
        let base = dir.join(format!("{stem}.rec"));
        if !base.exists() {
            return base;
        }

        let mut n = 1;
        loop {
            let candidate = dir.join(format!("{stem}_{n}.rec"));
            if !candidate.exists() {
                warn!(
                    existing = %base.display(),
                    new = %candidate.display(),
                    "Recording file already exists, using numbered name"
                );
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.acquisition.device, "emulator");
        assert_eq!(config.acquisition.eeg_set, EegSet::AB);
        assert_eq!(config.acquisition.exg_set, ExgSet::Std);
        assert_eq!(config.acquisition.block_size, 32);
        assert!(config.events.enabled);
        assert_eq!(config.events.port, 1234);
        assert_eq!(config.recording.format, RecordingFormat::Annotated);
        assert_eq!(config.emulator.sampling_rate, 2048);
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
[acquisition]
device = "fake"
eeg_set = "a"
exg_set = "none"
block_size = 64

[events]
enabled = false
port = 5000
accept_poll_ms = 100

[recording]
output_dir = "/data/eeg"
format = "samples"
record_duration_sec = 0.5

[emulator]
sampling_rate = 512
realtime = false

[labels]
eeg = ["Fp1", "Fp2"]
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.acquisition.eeg_set, EegSet::A);
        assert_eq!(config.acquisition.exg_set, ExgSet::None);
        assert_eq!(config.recording.format, RecordingFormat::Samples);
        assert_eq!(config.recording.output_dir, PathBuf::from("/data/eeg"));
        assert_eq!(config.emulator.sampling_rate, 512);
        assert!(!config.emulator.realtime);
        assert_eq!(config.emulator.max_eeg_channels, 64);

        let acq = config.acquisition_config();
        assert!(acq.events.is_none());
        assert_eq!(acq.block_size, 64);
        assert_eq!(acq.eeg_labels, vec!["Fp1", "Fp2"]);
        assert_eq!(acq.record_duration_secs, 0.5);
    }

    #[test]
    fn test_tracker_config_from_events_section() {
        let config = Config::from_toml("[events]\nport = 4000\naccept_poll_ms = 50").unwrap();
        let tracker = config.acquisition_config().events.unwrap();
        assert_eq!(tracker.port, 4000);
        assert_eq!(tracker.accept_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_channel_set_rejected() {
        let result = Config::from_toml("[acquisition]\neeg_set = \"B\"");
        assert!(matches!(result, Err(ConfigError::TomlError(_))));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let result = Config::from_toml("[acquisition]\nblock_size = 0");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_recording_path_avoids_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.recording.output_dir = dir.path().to_path_buf();
        let started = Local.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();

        let first = config.recording_path(started);
        assert_eq!(first, dir.path().join("eegview_20260314_092653.rec"));

        std::fs::write(&first, b"taken").unwrap();
        let second = config.recording_path(started);
        assert_eq!(second, dir.path().join("eegview_20260314_092653_1.rec"));
    }
}
