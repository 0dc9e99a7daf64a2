//! Event client: sends software event codes to a running tracker
//!
//! Usage:
//!   cargo run --bin send_event -- 5
//!   cargo run --bin send_event -- --address 10.0.0.2:1234 --interval-ms 250 1 2 3

use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use eegview::common::cli::SendEventArgs;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("send_event=info".parse()?))
        .init();

    let args = SendEventArgs::parse();
    let mut stream = TcpStream::connect(&args.address)
        .with_context(|| format!("connecting to {}", args.address))?;
    stream.set_nodelay(true)?;
    info!(address = %args.address, "Connected to event tracker");

    let interval = Duration::from_millis(args.interval_ms);
    for (i, code) in args.codes.iter().enumerate() {
        if i > 0 && !interval.is_zero() {
            thread::sleep(interval);
        }
        stream
            .write_all(&code.to_ne_bytes())
            .with_context(|| format!("sending event {code}"))?;
        info!(code, "Event sent");
    }

    stream.flush()?;
    Ok(())
}
