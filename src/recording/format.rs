//! On-disk layout of recording files
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Header                                 │
//! │  - Magic "EEGREC01"                     │
//! │  - u32 LE length + MsgPack header       │
//! ├─────────────────────────────────────────┤
//! │  Block 1                                │
//! │  - u32 LE length + MsgPack RecordBlock  │
//! │    (data record or event annotation)    │
//! ├─────────────────────────────────────────┤
//! │  ...                                    │
//! ├─────────────────────────────────────────┤
//! │  Footer (fixed 64 bytes)                │
//! │  - Magic "EEGEND01", checksum, totals,  │
//! │    completion flag                      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! A data record holds `samples` consecutive samples of every channel,
//! channel after channel. Event annotations are interleaved with data
//! records in the order they were written.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use super::{ChannelInfo, RecordingFormat};

pub const FILE_MAGIC: [u8; 8] = *b"EEGREC01";

pub const FORMAT_VERSION: u32 = 1;

pub const FOOTER_MAGIC: [u8; 8] = *b"EEGEND01";

pub const FOOTER_SIZE: usize = 64;

/// Upper bound accepted for the header or a single block when reading
const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// File format errors
#[derive(Debug, thiserror::Error)]
pub enum FileFormatError {
    #[error("Data too short to contain valid structure")]
    TooShort,

    #[error("Invalid file magic bytes")]
    InvalidMagic,

    #[error("Invalid footer magic bytes")]
    InvalidFooterMagic,

    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Recording header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingHeader {
    pub version: u32,
    pub format: RecordingFormat,
    /// Samples per second, identical for every channel
    pub sampling_rate: f64,
    pub record_duration_secs: f64,
    pub samples_per_record: u32,
    pub channels: Vec<ChannelInfo>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RecordingHeader {
    pub fn new(
        format: RecordingFormat,
        sampling_rate: f64,
        record_duration_secs: f64,
        samples_per_record: u32,
        channels: Vec<ChannelInfo>,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            format,
            sampling_rate,
            record_duration_secs,
            samples_per_record,
            channels,
            start_time: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FileFormatError> {
        let body = rmp_serde::to_vec_named(self)?;
        let mut buf = Vec::with_capacity(FILE_MAGIC.len() + 4 + body.len());
        buf.extend_from_slice(&FILE_MAGIC);
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FileFormatError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(truncation)?;
        if magic != FILE_MAGIC {
            return Err(FileFormatError::InvalidMagic);
        }

        let mut len = [0u8; 4];
        reader.read_exact(&mut len).map_err(truncation)?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_BLOCK_SIZE {
            return Err(FileFormatError::TooShort);
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).map_err(truncation)?;

        let header: RecordingHeader = rmp_serde::from_slice(&body)?;
        if header.version != FORMAT_VERSION {
            return Err(FileFormatError::UnsupportedVersion(header.version));
        }
        Ok(header)
    }
}

fn truncation(e: io::Error) -> FileFormatError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FileFormatError::TooShort
    } else {
        FileFormatError::Io(e)
    }
}

/// One record of samples for all channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Record sequence number, from 0
    pub index: u64,
    /// Samples per channel in this record (the last one may be short)
    pub samples: u32,
    /// Channel-major sample values
    pub data: Vec<i32>,
}

impl DataRecord {
    /// Samples of channel `channel` in this record
    pub fn channel(&self, channel: usize) -> &[i32] {
        let n = self.samples as usize;
        let start = channel * n;
        self.data.get(start..start + n).unwrap_or(&[])
    }
}

/// Software event annotation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventAnnotation {
    pub event_type: u32,
    /// Seconds since the start of the recording
    pub onset_secs: f64,
}

/// Unit written between header and footer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordBlock {
    Data(DataRecord),
    Event(EventAnnotation),
}

impl RecordBlock {
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_msgpack(data: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(data)
    }
}

/// Fixed-size trailer written on close
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FileFooter {
    /// Combined xxHash64 of every block (length prefix included)
    pub data_checksum: u64,
    /// Samples per channel
    pub total_samples: u64,
    pub total_events: u64,
    /// Bytes between header and footer
    pub data_bytes: u64,
    pub record_count: u64,
    /// Unix time in nanoseconds
    pub file_end_time_ns: u64,
    /// 1 once the file was closed cleanly
    pub write_complete: u8,
}

impl Default for FileFooter {
    fn default() -> Self {
        Self::new()
    }
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

impl FileFooter {
    pub fn new() -> Self {
        Self {
            data_checksum: 0,
            total_samples: 0,
            total_events: 0,
            data_bytes: 0,
            record_count: 0,
            file_end_time_ns: 0,
            write_complete: 0,
        }
    }

    /// Mark complete and stamp the end time
    pub fn finalize(&mut self) {
        self.write_complete = 1;
        self.file_end_time_ns = Utc::now()
            .timestamp_nanos_opt()
            .map(|ns| ns.max(0) as u64)
            .unwrap_or_default();
    }

    pub fn is_complete(&self) -> bool {
        self.write_complete == 1
    }

    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(&FOOTER_MAGIC);
        put_u64(&mut buf, 8, self.data_checksum);
        put_u64(&mut buf, 16, self.total_samples);
        put_u64(&mut buf, 24, self.total_events);
        put_u64(&mut buf, 32, self.data_bytes);
        put_u64(&mut buf, 40, self.record_count);
        put_u64(&mut buf, 48, self.file_end_time_ns);
        buf[56] = self.write_complete;
        // 57..64 reserved
        buf
    }

    pub fn from_bytes(buf: &[u8; FOOTER_SIZE]) -> Result<Self, FileFormatError> {
        if buf[0..8] != FOOTER_MAGIC {
            return Err(FileFormatError::InvalidFooterMagic);
        }
        Ok(Self {
            data_checksum: get_u64(buf, 8),
            total_samples: get_u64(buf, 16),
            total_events: get_u64(buf, 24),
            data_bytes: get_u64(buf, 32),
            record_count: get_u64(buf, 40),
            file_end_time_ns: get_u64(buf, 48),
            write_complete: buf[56],
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }
}

/// Running checksum over the block region
///
/// Each update is hashed with xxHash64 and folded into the state; the
/// byte count is mixed in at the end.
#[derive(Debug, Clone, Default)]
pub struct ChecksumCalculator {
    state: u64,
    bytes_processed: u64,
}

impl ChecksumCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.state = self.state.rotate_left(5) ^ xxh64(data, 0);
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(&self) -> u64 {
        self.state ^ self.bytes_processed
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

/// Outcome of [`RecordingReader::validate`]
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// Footer present, complete and checksum matching
    pub is_valid: bool,
    pub footer: Option<FileFooter>,
    /// Blocks that could be decoded before the first damaged one
    pub readable_blocks: usize,
    pub readable_records: usize,
    pub readable_events: usize,
    pub errors: Vec<String>,
}

/// Everything decoded from a recording
#[derive(Debug, Clone, Default)]
pub struct RecordingContents {
    pub records: Vec<DataRecord>,
    pub events: Vec<EventAnnotation>,
}

impl RecordingContents {
    /// All samples of one channel across records
    pub fn channel_samples(&self, channel: usize) -> Vec<i32> {
        self.records
            .iter()
            .flat_map(|r| r.channel(channel).iter().copied())
            .collect()
    }
}

/// Reader with integrity checks
pub struct RecordingReader<R> {
    reader: R,
    header: RecordingHeader,
    header_size: u64,
    file_size: u64,
}

impl<R: Read + Seek> RecordingReader<R> {
    pub fn new(mut reader: R) -> Result<Self, FileFormatError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        let header = RecordingHeader::read_from(&mut reader)?;
        let header_size = reader.stream_position()?;
        Ok(Self {
            reader,
            header,
            header_size,
            file_size,
        })
    }

    pub fn header(&self) -> &RecordingHeader {
        &self.header
    }

    /// Read the trailing footer; fails for files that were never closed
    pub fn read_footer(&mut self) -> Result<FileFooter, FileFormatError> {
        if self.file_size < self.header_size + FOOTER_SIZE as u64 {
            return Err(FileFormatError::TooShort);
        }
        self.reader.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut buf = [0u8; FOOTER_SIZE];
        self.reader.read_exact(&mut buf)?;
        FileFooter::from_bytes(&buf)
    }

    /// End of the block region, assuming a footer if one fits and parses
    fn data_end(&mut self) -> u64 {
        match self.read_footer() {
            Ok(_) => self.file_size - FOOTER_SIZE as u64,
            Err(_) => self.file_size,
        }
    }

    pub fn blocks(&mut self) -> BlockIterator<'_, R> {
        let data_end = self.data_end();
        let start = self.reader.seek(SeekFrom::Start(self.header_size));
        BlockIterator {
            reader: &mut self.reader,
            data_end,
            checksum: ChecksumCalculator::new(),
            done: start.is_err(),
        }
    }

    /// Decode every block, stopping at the first damaged one
    pub fn read_contents(&mut self) -> Result<RecordingContents, FileFormatError> {
        let mut contents = RecordingContents::default();
        for block in self.blocks() {
            match block? {
                RecordBlock::Data(record) => contents.records.push(record),
                RecordBlock::Event(event) => contents.events.push(event),
            }
        }
        Ok(contents)
    }

    pub fn validate(&mut self) -> ValidationReport {
        let mut report = ValidationReport {
            is_valid: false,
            footer: None,
            readable_blocks: 0,
            readable_records: 0,
            readable_events: 0,
            errors: Vec::new(),
        };

        match self.read_footer() {
            Ok(footer) => {
                if !footer.is_complete() {
                    report.errors.push("File incomplete (not closed cleanly)".to_string());
                }
                report.footer = Some(footer);
            }
            Err(e) => report.errors.push(format!("Failed to read footer: {e}")),
        }

        let mut blocks = self.blocks();
        for block in blocks.by_ref() {
            match block {
                Ok(RecordBlock::Data(_)) => report.readable_records += 1,
                Ok(RecordBlock::Event(_)) => report.readable_events += 1,
                Err(e) => {
                    report.errors.push(format!("Damaged block: {e}"));
                    break;
                }
            }
            report.readable_blocks += 1;
        }
        let computed = blocks.checksum();

        if let Some(footer) = report.footer {
            if footer.is_complete() {
                if computed == footer.data_checksum {
                    report.is_valid = report.errors.is_empty();
                } else {
                    report.errors.push(format!(
                        "Checksum mismatch: expected {:016x}, got {:016x}",
                        footer.data_checksum, computed
                    ));
                }
            }
        }
        report
    }
}

/// Iterator over the blocks of a file
pub struct BlockIterator<'a, R> {
    reader: &'a mut R,
    data_end: u64,
    checksum: ChecksumCalculator,
    done: bool,
}

impl<R> BlockIterator<'_, R> {
    /// Checksum over the blocks yielded so far
    pub fn checksum(&self) -> u64 {
        self.checksum.finalize()
    }
}

impl<R: Read + Seek> Iterator for BlockIterator<'_, R> {
    type Item = Result<RecordBlock, FileFormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let pos = match self.reader.stream_position() {
            Ok(p) => p,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };
        if pos + 4 > self.data_end {
            self.done = true;
            return None;
        }

        let mut len_bytes = [0u8; 4];
        if let Err(e) = self.reader.read_exact(&mut len_bytes) {
            self.done = true;
            return Some(Err(truncation(e)));
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 || len > MAX_BLOCK_SIZE || pos + 4 + len as u64 > self.data_end {
            self.done = true;
            return Some(Err(FileFormatError::TooShort));
        }

        let mut data = vec![0u8; len];
        if let Err(e) = self.reader.read_exact(&mut data) {
            self.done = true;
            return Some(Err(truncation(e)));
        }

        match RecordBlock::from_msgpack(&data) {
            Ok(block) => {
                self.checksum.update(&len_bytes);
                self.checksum.update(&data);
                Some(Ok(block))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header() -> RecordingHeader {
        RecordingHeader::new(
            RecordingFormat::Annotated,
            256.0,
            1.0,
            256,
            vec![ChannelInfo::eeg("Fp1"), ChannelInfo::trigger("Status")],
        )
    }

    #[test]
    fn test_header_roundtrip() {
        let mut h = header();
        h.metadata.insert("subject".to_string(), "S01".to_string());
        let bytes = h.to_bytes().unwrap();

        let restored = RecordingHeader::read_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(restored.version, FORMAT_VERSION);
        assert_eq!(restored.sampling_rate, 256.0);
        assert_eq!(restored.channels.len(), 2);
        assert_eq!(restored.channels[1].label, "Status");
        assert_eq!(restored.metadata.get("subject").map(String::as_str), Some("S01"));
    }

    #[test]
    fn test_header_keeps_rate_of_uneven_records() {
        let h = RecordingHeader::new(
            RecordingFormat::Samples,
            2048.0,
            0.3,
            614,
            vec![ChannelInfo::trigger("Status")],
        );
        let bytes = h.to_bytes().unwrap();
        let restored = RecordingHeader::read_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(restored.sampling_rate, 2048.0);
        assert_eq!(restored.samples_per_record, 614);
    }

    #[test]
    fn test_header_length_is_bounded() {
        let mut bytes = FILE_MAGIC.to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        let err = RecordingHeader::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, FileFormatError::TooShort));
    }

    #[test]
    fn test_header_bad_magic() {
        let mut bytes = header().to_bytes().unwrap();
        bytes[0] = b'X';
        let err = RecordingHeader::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, FileFormatError::InvalidMagic));
    }

    #[test]
    fn test_header_truncated() {
        let bytes = header().to_bytes().unwrap();
        let err = RecordingHeader::read_from(&mut Cursor::new(&bytes[..10])).unwrap_err();
        assert!(matches!(err, FileFormatError::TooShort));
    }

    #[test]
    fn test_footer_roundtrip() {
        let mut footer = FileFooter::new();
        footer.data_checksum = 0xDEAD_BEEF_CAFE_BABE;
        footer.total_samples = 2048;
        footer.total_events = 3;
        footer.record_count = 8;
        footer.finalize();

        let restored = FileFooter::from_bytes(&footer.to_bytes()).unwrap();
        assert_eq!(restored, footer);
        assert!(restored.is_complete());
    }

    #[test]
    fn test_footer_bad_magic() {
        let mut bytes = FileFooter::new().to_bytes();
        bytes[3] = 0;
        assert!(matches!(
            FileFooter::from_bytes(&bytes),
            Err(FileFormatError::InvalidFooterMagic)
        ));
    }

    #[test]
    fn test_checksum_depends_on_order() {
        let mut a = ChecksumCalculator::new();
        a.update(b"first");
        a.update(b"second");
        let mut b = ChecksumCalculator::new();
        b.update(b"second");
        b.update(b"first");
        assert_ne!(a.finalize(), b.finalize());
        assert_eq!(a.bytes_processed(), 11);
    }

    #[test]
    fn test_data_record_channel_view() {
        let record = DataRecord {
            index: 0,
            samples: 3,
            data: vec![1, 2, 3, 10, 20, 30],
        };
        assert_eq!(record.channel(0), &[1, 2, 3]);
        assert_eq!(record.channel(1), &[10, 20, 30]);
        assert!(record.channel(2).is_empty());
    }
}
