//! Recording files end to end: write with `DataFileWriter`, read back and
//! validate, then damage the file and check that validation notices
//!
//! Sample values come from a seeded generator so failures reproduce.

use std::fs::{self, File};
use std::path::Path;

use rand::prelude::*;
use rand::rngs::StdRng;

use eegview::common::{ChannelLayout, SampleBlock};
use eegview::recording::{
    describe_channels, DataFileWriter, RecordingError, RecordingFile, RecordingFormat,
    RecordingReader,
};

const SAMPLES_PER_RECORD: u32 = 10;

/// Expected stored values per channel (EEG, EXG, trigger)
struct Expected {
    channels: Vec<Vec<i32>>,
}

fn random_block(rng: &mut StdRng, layout: ChannelLayout, frames: usize, expected: &mut Expected) -> SampleBlock {
    let mut block = SampleBlock::new(layout, frames);
    let mut eeg = vec![0i32; layout.eeg * frames];
    let mut exg = vec![0i32; layout.exg * frames];
    let mut triggers = vec![0u32; frames];

    for frame in 0..frames {
        for c in 0..layout.eeg {
            let v: i32 = rng.gen_range(-8_388_608..8_388_608);
            eeg[frame * layout.eeg + c] = v << 8;
            expected.channels[c].push(v);
        }
        for c in 0..layout.exg {
            let v: i32 = rng.gen_range(-8_388_608..8_388_608);
            exg[frame * layout.exg + c] = v << 8;
            expected.channels[layout.eeg + c].push(v);
        }
        let t: u16 = rng.gen();
        triggers[frame] = ((t as u32) << 8) | rng.gen_range(0..256);
        expected.channels[layout.eeg + layout.exg].push(t as i32);
    }

    block.eeg_mut().copy_from_slice(&eeg);
    block.exg_mut().copy_from_slice(&exg);
    block.triggers_mut().copy_from_slice(&triggers);
    block.set_len(frames);
    block
}

/// Write a session of random blocks with an event after each one
fn write_session(path: &Path, format: RecordingFormat, seed: u64) -> Expected {
    let layout = ChannelLayout::new(4, 2);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut expected = Expected {
        channels: vec![Vec::new(); layout.total()],
    };

    let mut file: Box<dyn RecordingFile> = Box::new(DataFileWriter::create(path, format).unwrap());
    file.configure(20.0, 0.5, SAMPLES_PER_RECORD).unwrap();
    for channel in describe_channels(layout, &[], &[]) {
        file.add_channel(channel).unwrap();
    }
    file.prepare_for_transfer().unwrap();

    let mut written = 0usize;
    for i in 0..12u32 {
        let frames = rng.gen_range(1..=16);
        let block = random_block(&mut rng, layout, frames, &mut expected);
        file.write_block(&block).unwrap();
        written += frames;
        if file.supports_events() {
            file.add_event(i, written as f64 / 20.0).unwrap();
        }
    }
    file.close().unwrap();
    expected
}

#[test]
fn test_annotated_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("annotated.rec");
    let expected = write_session(&path, RecordingFormat::Annotated, 42);

    let mut reader = RecordingReader::new(File::open(&path).unwrap()).unwrap();
    let report = reader.validate();
    assert!(report.is_valid, "{:?}", report.errors);

    let header = reader.header().clone();
    assert_eq!(header.format, RecordingFormat::Annotated);
    assert_eq!(header.sampling_rate, 20.0);
    let labels: Vec<&str> = header.channels.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(labels, vec!["EEG1", "EEG2", "EEG3", "EEG4", "EXG1", "EXG2", "Status"]);

    let contents = reader.read_contents().unwrap();
    for (c, values) in expected.channels.iter().enumerate() {
        assert_eq!(&contents.channel_samples(c), values, "channel {c}");
    }
    let total = expected.channels[0].len();
    let full_records = total / SAMPLES_PER_RECORD as usize;
    assert!(contents.records[..full_records]
        .iter()
        .all(|r| r.samples == SAMPLES_PER_RECORD));

    let types: Vec<u32> = contents.events.iter().map(|e| e.event_type).collect();
    assert_eq!(types, (0..12).collect::<Vec<_>>());
    assert!(contents.events.windows(2).all(|w| w[0].onset_secs < w[1].onset_secs));

    let footer = reader.read_footer().unwrap();
    assert!(footer.is_complete());
    assert_eq!(footer.total_samples, total as u64);
    assert_eq!(footer.total_events, 12);
    assert_eq!(footer.record_count, contents.records.len() as u64);
}

#[test]
fn test_samples_format_has_no_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("samples.rec");
    let expected = write_session(&path, RecordingFormat::Samples, 7);

    let mut reader = RecordingReader::new(File::open(&path).unwrap()).unwrap();
    assert!(reader.validate().is_valid);
    let contents = reader.read_contents().unwrap();
    assert!(contents.events.is_empty());
    assert_eq!(contents.channel_samples(6), expected.channels[6]);
}

#[test]
fn test_missing_footer_is_reported_but_data_readable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crashed.rec");
    let expected = write_session(&path, RecordingFormat::Annotated, 3);

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 64]).unwrap();

    let mut reader = RecordingReader::new(File::open(&path).unwrap()).unwrap();
    let report = reader.validate();
    assert!(!report.is_valid);
    assert!(report.footer.is_none());
    assert_eq!(report.readable_events, 12);

    let contents = reader.read_contents().unwrap();
    assert_eq!(contents.channel_samples(0), expected.channels[0]);
}

#[test]
fn test_truncated_block_stops_reading() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cut.rec");
    write_session(&path, RecordingFormat::Annotated, 5);

    let mut reader = RecordingReader::new(File::open(&path).unwrap()).unwrap();
    let complete = reader.validate().readable_blocks;

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 64 - 5]).unwrap();

    let mut reader = RecordingReader::new(File::open(&path).unwrap()).unwrap();
    let report = reader.validate();
    assert!(!report.is_valid);
    assert_eq!(report.readable_blocks, complete - 1);
    assert!(report.errors.iter().any(|e| e.starts_with("Damaged block")));
    assert!(reader.read_contents().is_err());
}

#[test]
fn test_flipped_byte_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flipped.rec");
    write_session(&path, RecordingFormat::Annotated, 11);

    let mut bytes = fs::read(&path).unwrap();
    let target = bytes.len() - 64 - 3;
    bytes[target] ^= 0x01;
    fs::write(&path, &bytes).unwrap();

    let mut reader = RecordingReader::new(File::open(&path).unwrap()).unwrap();
    let report = reader.validate();
    assert!(!report.is_valid);
    assert!(!report.errors.is_empty());
}

#[test]
fn test_not_a_recording() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.rec");
    fs::write(&path, b"definitely not a recording").unwrap();
    assert!(RecordingReader::new(File::open(&path).unwrap()).is_err());
}

#[test]
fn test_write_before_prepare_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = DataFileWriter::create(dir.path().join("early.rec"), RecordingFormat::Samples)
        .unwrap();
    let block = SampleBlock::new(ChannelLayout::new(1, 0), 4);
    assert!(matches!(
        file.write_block(&block),
        Err(RecordingError::Setup(_))
    ));
}
