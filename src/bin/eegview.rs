//! Headless acquisition: read the device, track software events,
//! optionally record the whole session to file
//!
//! Usage:
//!   cargo run --bin eegview                                  # defaults, emulator
//!   cargo run --bin eegview -- -f eegview.toml               # config file
//!   cargo run --bin eegview -- --record ./data --duration 60 # record 60 s into ./data

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context};
use chrono::Local;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use eegview::common::cli::ViewerArgs;
use eegview::common::shutdown::setup_shutdown;
use eegview::config::Config;
use eegview::device::{self, EegSet, ExgSet};
use eegview::display::{DisplaySink, LogDisplay};
use eegview::{Acquisition, RecordingFormat};

fn load_config(args: &ViewerArgs) -> anyhow::Result<Config> {
    let path = &args.common.config_file;
    let mut config = if Path::new(path).exists() {
        let config =
            Config::load(path).with_context(|| format!("loading configuration from {path}"))?;
        info!(config_file = %path, "Loaded configuration");
        config
    } else {
        info!(config_file = %path, "No configuration file, using defaults");
        Config::default()
    };

    if let Some(device) = &args.device {
        config.acquisition.device = device.clone();
    }
    if let Some(set) = &args.eeg_set {
        config.acquisition.eeg_set = set.parse::<EegSet>()?;
    }
    if let Some(set) = &args.exg_set {
        config.acquisition.exg_set = set.parse::<ExgSet>()?;
    }
    if let Some(port) = args.port {
        config.events.port = port;
    }
    if args.no_events {
        config.events.enabled = false;
    }
    if let Some(format) = &args.format {
        config.recording.format = format.parse::<RecordingFormat>()?;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("eegview=info".parse()?))
        .init();

    let args = ViewerArgs::parse();
    let mut config = load_config(&args)?;
    if let Some(secs) = args.duration {
        ensure!(secs > 0.0, "--duration must be positive");
    }

    let device = device::open(&config.acquisition.device, &config.emulator)
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    let display: Arc<dyn DisplaySink> = Arc::new(LogDisplay::default());
    let mut acquisition = Acquisition::start(&config.acquisition_config(), device, display)?;

    if let Some(addr) = acquisition.event_address() {
        info!(%addr, "Event tracker ready");
    }

    if let Some(target) = &args.record {
        let path = if target.is_dir() {
            config.recording.output_dir = target.clone();
            config.recording_path(Local::now())
        } else {
            target.clone()
        };
        acquisition
            .setup_recording(&path, config.recording.format)
            .with_context(|| format!("preparing {}", path.display()))?;
        acquisition.start_recording()?;
        info!(path = %path.display(), format = %config.recording.format, "Recording");
    }

    let (shutdown_tx, mut shutdown_rx) = setup_shutdown();
    if let Some(secs) = args.duration {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            info!(secs, "Acquisition duration elapsed");
            let _ = tx.send(());
        });
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                if acquisition.is_finished() {
                    warn!("Acquisition ended without a stop request");
                    break;
                }
            }
        }
    }

    let stats = tokio::task::spawn_blocking(move || {
        acquisition.stop().map(|()| acquisition.stats())
    })
    .await??;

    info!(
        samples = stats.samples_read,
        blocks = stats.blocks_read,
        events = stats.events_received,
        recorded = stats.samples_recorded,
        write_failures = stats.write_failures,
        "eegview stopped"
    );
    Ok(())
}
