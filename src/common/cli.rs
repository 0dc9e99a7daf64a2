//! CLI argument parsing for the eegview binaries
//!
//! Each binary has its own Args struct; the viewer embeds [`CommonArgs`]
//! for the configuration file path. Values given on the command line
//! override the configuration file.

use clap::Parser;
use std::path::PathBuf;

/// Arguments shared by components that read a configuration file
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file
    #[arg(short = 'f', long = "config", default_value = "eegview.toml")]
    pub config_file: String,
}

/// Arguments for the acquisition viewer
#[derive(Parser, Debug, Clone)]
#[command(name = "eegview", about = "Acquire biosignals, track software events, record to file")]
pub struct ViewerArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Device identifier (e.g. "emulator")
    #[arg(short = 'd', long)]
    pub device: Option<String>,

    /// EEG channel set: all, A, AB, AD
    #[arg(long = "eeg-set")]
    pub eeg_set: Option<String>,

    /// EXG channel set: all, STD, none
    #[arg(long = "exg-set")]
    pub exg_set: Option<String>,

    /// TCP port of the event tracker
    #[arg(short = 'p', long, env = "EEGVIEW_EVENT_PORT")]
    pub port: Option<u16>,

    /// Disable the event tracker
    #[arg(long = "no-events")]
    pub no_events: bool,

    /// Record the session to this file
    #[arg(short = 'o', long = "record")]
    pub record: Option<PathBuf>,

    /// Recording format: samples, annotated
    #[arg(long)]
    pub format: Option<String>,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    pub duration: Option<f64>,
}

/// Arguments for the event client
#[derive(Parser, Debug, Clone)]
#[command(name = "send_event", about = "Send software events to a running event tracker")]
pub struct SendEventArgs {
    /// Tracker address
    #[arg(short = 'a', long, default_value = "127.0.0.1:1234")]
    pub address: String,

    /// Delay between consecutive events in milliseconds
    #[arg(short = 'i', long = "interval-ms", default_value_t = 0)]
    pub interval_ms: u64,

    /// Event codes to send, in order
    #[arg(required = true)]
    pub codes: Vec<u32>,
}

/// Arguments for the recording inspector
#[derive(Parser, Debug, Clone)]
#[command(name = "recording_info", about = "Inspect and validate a recording file")]
pub struct InspectArgs {
    /// Recording file to inspect
    pub path: PathBuf,

    /// Emit JSON instead of text
    #[arg(long)]
    pub json: bool,
}
