//! Downstream consumer of acquired data
//!
//! The acquisition loop pushes every block, event snapshot and error
//! notification into a [`DisplaySink`]. Return values are never
//! consulted; a slow sink slows acquisition, so implementations should
//! hand work off quickly.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::common::SoftwareEvent;

/// Panel a block of samples belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Tab {
    Eeg,
    Exg,
    Trigger,
}

pub trait DisplaySink: Send + Sync {
    /// Scaled samples (µV), frame-major, `count` frames
    fn on_samples(&self, tab: Tab, count: usize, buffer: &[f32]);

    /// Trigger values, one per frame
    fn on_triggers(&self, count: usize, values: &[u32]);

    fn on_events(&self, tab: Tab, events: &[SoftwareEvent]);

    /// The device stopped delivering data
    fn on_disconnected(&self);

    fn on_popup_message(&self, text: &str);

    fn on_recording_time(&self, _elapsed: Duration) {}
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn on_samples(&self, _: Tab, _: usize, _: &[f32]) {}
    fn on_triggers(&self, _: usize, _: &[u32]) {}
    fn on_events(&self, _: Tab, _: &[SoftwareEvent]) {}
    fn on_disconnected(&self) {}
    fn on_popup_message(&self, _: &str) {}
}

#[derive(Debug)]
struct LogStats {
    frames: u64,
    frames_since_report: u64,
    last_trigger: u32,
    last_report: Instant,
    recording: Option<Duration>,
}

/// Sink that reports through `tracing`, throttled to one status line per
/// interval
#[derive(Debug)]
pub struct LogDisplay {
    interval: Duration,
    stats: Mutex<LogStats>,
}

impl Default for LogDisplay {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl LogDisplay {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stats: Mutex::new(LogStats {
                frames: 0,
                frames_since_report: 0,
                last_trigger: 0,
                last_report: Instant::now(),
                recording: None,
            }),
        }
    }

    /// Frames seen so far
    pub fn frames(&self) -> u64 {
        self.stats.lock().frames
    }
}

impl DisplaySink for LogDisplay {
    fn on_samples(&self, _tab: Tab, _count: usize, _buffer: &[f32]) {}

    fn on_triggers(&self, count: usize, values: &[u32]) {
        let mut stats = self.stats.lock();
        stats.frames += count as u64;
        stats.frames_since_report += count as u64;
        if let Some(&last) = values.last() {
            stats.last_trigger = last;
        }

        let elapsed = stats.last_report.elapsed();
        if elapsed >= self.interval {
            let rate = stats.frames_since_report as f64 / elapsed.as_secs_f64();
            info!(
                frames = stats.frames,
                rate_hz = format!("{rate:.1}"),
                trigger = stats.last_trigger,
                recording_secs = stats.recording.map(|d| d.as_secs_f64()),
                "Acquiring"
            );
            stats.frames_since_report = 0;
            stats.last_report = Instant::now();
        }
    }

    fn on_events(&self, _tab: Tab, events: &[SoftwareEvent]) {
        for event in events {
            info!(
                event_type = event.event_type,
                position = event.position,
                "Software event"
            );
        }
    }

    fn on_disconnected(&self) {
        error!("Device disconnected, acquisition stopped");
    }

    fn on_popup_message(&self, text: &str) {
        warn!(message = %text, "User notification");
    }

    fn on_recording_time(&self, elapsed: Duration) {
        self.stats.lock().recording = Some(elapsed);
    }
}
