//! Synthetic acquisition device
//!
//! Produces zeroed EEG/EXG samples (optionally with Gaussian noise) and a
//! trigger channel that steps through 0..=7 every 128 samples, encoded in
//! bits 8..16 of the status word like the real amplifier does.

use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use tracing::{debug, info};

use super::{Capabilities, ChannelGroups, Device, DeviceError, EEG_SCALE_UV};
use crate::common::{ChannelLayout, SampleBlock};

/// Samples per trigger step
pub const TRIGGER_PERIOD: u64 = 128;

/// Emulator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub sampling_rate: u32,
    pub max_eeg_channels: usize,
    pub max_exg_channels: usize,
    /// Pace reads against the monotonic clock
    pub realtime: bool,
    /// Standard deviation of added noise in microvolts (0 = none)
    pub noise_uv: f64,
    /// Fail with a sync loss after this many blocks (0 = never)
    pub fail_after_blocks: u64,
    /// Seed for the noise generator
    pub seed: Option<u64>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 2048,
            max_eeg_channels: 64,
            max_exg_channels: 24,
            realtime: true,
            noise_uv: 0.0,
            fail_after_blocks: 0,
            seed: None,
        }
    }
}

/// Status word of global sample `index`
pub fn trigger_pattern(index: u64) -> u32 {
    (((index / TRIGGER_PERIOD) % 8) as u32) << 8
}

pub struct Emulator {
    config: EmulatorConfig,
    layout: Option<ChannelLayout>,
    started_at: Option<Instant>,
    samples_read: u64,
    blocks_read: u64,
    noise: Option<(Normal<f64>, StdRng)>,
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Self {
        let noise = if config.noise_uv > 0.0 {
            let rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            Normal::new(0.0, config.noise_uv).ok().map(|n| (n, rng))
        } else {
            None
        };

        Self {
            config,
            layout: None,
            started_at: None,
            samples_read: 0,
            blocks_read: 0,
            noise,
        }
    }

    /// Samples delivered since the last start
    pub fn samples_read(&self) -> u64 {
        self.samples_read
    }

    fn fill_noise(&mut self, buf: &mut [i32]) {
        match self.noise.as_mut() {
            Some((dist, rng)) => {
                for sample in buf.iter_mut() {
                    let uv = dist.sample(rng);
                    *sample = (uv / EEG_SCALE_UV as f64) as i32;
                }
            }
            None => buf.fill(0),
        }
    }

    fn pace(&self, started_at: Instant, samples_after_read: u64) {
        let due = Duration::from_secs_f64(
            samples_after_read as f64 / self.config.sampling_rate as f64,
        );
        let elapsed = started_at.elapsed();
        if due > elapsed {
            thread::sleep(due - elapsed);
        }
    }
}

impl Device for Emulator {
    fn name(&self) -> &str {
        "emulator"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            sampling_rate: self.config.sampling_rate,
            max_eeg: self.config.max_eeg_channels,
            max_exg: self.config.max_exg_channels,
        }
    }

    fn configure_groups(&mut self, groups: ChannelGroups) -> Result<ChannelLayout, DeviceError> {
        let layout = groups.resolve(&self.capabilities())?;
        debug!(eeg = layout.eeg, exg = layout.exg, "Emulator channel groups configured");
        self.layout = Some(layout);
        Ok(layout)
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        if self.layout.is_none() {
            return Err(DeviceError::BadOption(
                "channel groups must be configured before start".to_string(),
            ));
        }
        self.samples_read = 0;
        self.blocks_read = 0;
        self.started_at = Some(Instant::now());
        info!(
            sampling_rate = self.config.sampling_rate,
            realtime = self.config.realtime,
            "Emulator started"
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        if self.started_at.take().is_some() {
            info!(samples = self.samples_read, "Emulator stopped");
        }
        Ok(())
    }

    fn read_block(&mut self, block: &mut SampleBlock) -> Result<usize, DeviceError> {
        let started_at = self.started_at.ok_or(DeviceError::NotStarted)?;
        if Some(block.layout()) != self.layout {
            return Err(DeviceError::BadOption(
                "block layout does not match configured channel groups".to_string(),
            ));
        }
        if self.config.fail_after_blocks > 0 && self.blocks_read >= self.config.fail_after_blocks {
            return Err(DeviceError::SyncLost);
        }

        let n = block.capacity();
        self.fill_noise(block.eeg_mut());
        self.fill_noise(block.exg_mut());

        let first = self.samples_read;
        for (i, status) in block.triggers_mut().iter_mut().enumerate() {
            *status = trigger_pattern(first + i as u64);
        }
        block.set_len(n);

        self.samples_read += n as u64;
        self.blocks_read += 1;

        if self.config.realtime {
            self.pace(started_at, self.samples_read);
        }
        Ok(n)
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
