//! Inspect and validate a recording file
//!
//! Usage:
//!   cargo run --bin recording_info -- session.rec
//!   cargo run --bin recording_info -- session.rec --json

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;

use eegview::common::cli::InspectArgs;
use eegview::recording::{RecordingHeader, RecordingReader, ValidationReport};

#[derive(Serialize)]
struct InfoReport<'a> {
    path: &'a Path,
    header: &'a RecordingHeader,
    validation: ValidationReport,
    duration_secs: f64,
    event_counts: BTreeMap<u32, usize>,
}

fn main() -> anyhow::Result<()> {
    let args = InspectArgs::parse();

    let file = File::open(&args.path).with_context(|| format!("opening {}", args.path.display()))?;
    let mut reader = RecordingReader::new(BufReader::new(file))
        .with_context(|| format!("reading header of {}", args.path.display()))?;

    let validation = reader.validate();
    let contents = reader.read_contents().unwrap_or_default();

    let header = reader.header().clone();
    let samples: u64 = contents.records.iter().map(|r| r.samples as u64).sum();
    let mut event_counts = BTreeMap::new();
    for event in &contents.events {
        *event_counts.entry(event.event_type).or_insert(0) += 1;
    }

    let report = InfoReport {
        path: &args.path,
        header: &header,
        validation,
        duration_secs: samples as f64 / header.sampling_rate,
        event_counts,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }

    if !report.validation.is_valid {
        std::process::exit(1);
    }
    Ok(())
}

fn print_text(report: &InfoReport<'_>) {
    let h = report.header;
    println!("File:            {}", report.path.display());
    println!("Format:          {} (v{})", h.format, h.version);
    println!("Started:         {}", h.start_time);
    println!("Sampling rate:   {} Hz", h.sampling_rate);
    println!(
        "Records:         {} samples per {} s",
        h.samples_per_record, h.record_duration_secs
    );
    println!("Duration:        {:.3} s", report.duration_secs);
    println!("Channels:        {}", h.channels.len());
    for (i, ch) in h.channels.iter().enumerate() {
        println!("  {:>3}  {:<8} {:?} [{}]", i, ch.label, ch.kind, ch.unit);
    }

    if report.event_counts.is_empty() {
        println!("Events:          none");
    } else {
        println!("Events:");
        for (event_type, count) in &report.event_counts {
            println!("  type {:>5}: {}", event_type, count);
        }
    }

    let v = &report.validation;
    println!();
    println!("Valid:           {}", if v.is_valid { "yes" } else { "NO" });
    if let Some(footer) = &v.footer {
        println!("Complete:        {}", footer.is_complete());
        println!("Checksum:        {:016x}", footer.data_checksum);
    }
    println!(
        "Readable:        {} blocks ({} records, {} events)",
        v.readable_blocks, v.readable_records, v.readable_events
    );
    for error in &v.errors {
        println!("  ! {error}");
    }
}
