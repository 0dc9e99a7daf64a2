//! File-backed [`RecordingFile`]

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::format::{
    ChecksumCalculator, DataRecord, EventAnnotation, FileFooter, RecordBlock, RecordingHeader,
};
use super::{ChannelInfo, ChannelKind, RecordingError, RecordingFile, RecordingFormat};
use crate::common::{ChannelLayout, SampleBlock};
use crate::device::trigger_value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Created,
    Configured,
    Prepared,
}

/// Where a recorded channel takes its samples from in a block
#[derive(Debug, Clone, Copy)]
enum Source {
    Eeg(usize),
    Exg(usize),
    Trigger,
}

pub struct DataFileWriter {
    path: PathBuf,
    format: RecordingFormat,
    writer: BufWriter<File>,
    stage: Stage,
    sampling_rate: f64,
    record_duration_secs: f64,
    samples_per_record: u32,
    channels: Vec<ChannelInfo>,
    sources: Vec<Source>,
    layout: ChannelLayout,
    /// Per-channel samples of the record being filled
    pending: Vec<Vec<i32>>,
    checksum: ChecksumCalculator,
    footer: FileFooter,
}

impl DataFileWriter {
    /// Create (truncate) the file at `path`
    pub fn create<P: AsRef<Path>>(path: P, format: RecordingFormat) -> Result<Self, RecordingError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| {
                RecordingError::Setup(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        let file = File::create(&path)
            .map_err(|e| RecordingError::Setup(format!("cannot create {}: {e}", path.display())))?;

        debug!(path = %path.display(), %format, "Created recording file");
        Ok(Self {
            path,
            format,
            writer: BufWriter::with_capacity(64 * 1024, file),
            stage: Stage::Created,
            sampling_rate: 0.0,
            record_duration_secs: 0.0,
            samples_per_record: 0,
            channels: Vec::new(),
            sources: Vec::new(),
            layout: ChannelLayout::default(),
            pending: Vec::new(),
            checksum: ChecksumCalculator::new(),
            footer: FileFooter::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn require(&self, stage: Stage, action: &str) -> Result<(), RecordingError> {
        if self.stage != stage {
            return Err(RecordingError::Setup(format!(
                "cannot {action} in stage {:?}",
                self.stage
            )));
        }
        Ok(())
    }

    fn write_record_block(&mut self, block: &RecordBlock) -> Result<(), RecordingError> {
        let data = block.to_msgpack()?;
        let len_bytes = (data.len() as u32).to_le_bytes();
        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&data))
            .map_err(RecordingError::Write)?;
        self.checksum.update(&len_bytes);
        self.checksum.update(&data);
        Ok(())
    }

    fn flush_record(&mut self) -> Result<(), RecordingError> {
        let samples = self.pending.first().map_or(0, Vec::len);
        if samples == 0 {
            return Ok(());
        }

        let mut data = Vec::with_capacity(samples * self.pending.len());
        for channel in &mut self.pending {
            data.append(channel);
        }
        let record = DataRecord {
            index: self.footer.record_count,
            samples: samples as u32,
            data,
        };
        self.write_record_block(&RecordBlock::Data(record))?;

        self.footer.record_count += 1;
        self.footer.total_samples += samples as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), RecordingError> {
        self.flush_record()?;
        self.footer.data_checksum = self.checksum.finalize();
        self.footer.data_bytes = self.checksum.bytes_processed();
        self.footer.finalize();
        self.footer.write_to(&mut self.writer).map_err(RecordingError::Close)?;
        self.writer.flush().map_err(RecordingError::Close)?;
        self.writer.get_ref().sync_data().map_err(RecordingError::Close)?;
        Ok(())
    }
}

impl RecordingFile for DataFileWriter {
    fn configure(
        &mut self,
        sampling_rate: f64,
        record_duration_secs: f64,
        samples_per_record: u32,
    ) -> Result<(), RecordingError> {
        if self.stage == Stage::Prepared {
            return Err(RecordingError::Setup("file already prepared".to_string()));
        }
        if !(sampling_rate > 0.0) {
            return Err(RecordingError::Setup(format!(
                "invalid sampling rate {sampling_rate}"
            )));
        }
        if !(record_duration_secs > 0.0) || samples_per_record == 0 {
            return Err(RecordingError::Setup(format!(
                "invalid record layout: {samples_per_record} samples in {record_duration_secs} s"
            )));
        }
        self.sampling_rate = sampling_rate;
        self.record_duration_secs = record_duration_secs;
        self.samples_per_record = samples_per_record;
        self.stage = Stage::Configured;
        Ok(())
    }

    fn add_channel(&mut self, channel: ChannelInfo) -> Result<(), RecordingError> {
        self.require(Stage::Configured, "add a channel")?;
        let source = match channel.kind {
            ChannelKind::Eeg => {
                self.layout.eeg += 1;
                Source::Eeg(self.layout.eeg - 1)
            }
            ChannelKind::Exg => {
                self.layout.exg += 1;
                Source::Exg(self.layout.exg - 1)
            }
            ChannelKind::Trigger => {
                if self.sources.iter().any(|s| matches!(s, Source::Trigger)) {
                    return Err(RecordingError::Setup(
                        "only one trigger channel is supported".to_string(),
                    ));
                }
                Source::Trigger
            }
        };
        self.sources.push(source);
        self.channels.push(channel);
        Ok(())
    }

    fn prepare_for_transfer(&mut self) -> Result<(), RecordingError> {
        self.require(Stage::Configured, "prepare")?;
        if self.channels.is_empty() {
            return Err(RecordingError::Setup("no channels defined".to_string()));
        }

        let header = RecordingHeader::new(
            self.format,
            self.sampling_rate,
            self.record_duration_secs,
            self.samples_per_record,
            self.channels.clone(),
        );
        let bytes = header
            .to_bytes()
            .map_err(|e| RecordingError::Setup(e.to_string()))?;
        self.writer
            .write_all(&bytes)
            .map_err(|e| RecordingError::Setup(format!("cannot write header: {e}")))?;

        self.pending = vec![Vec::with_capacity(self.samples_per_record as usize); self.channels.len()];
        self.stage = Stage::Prepared;
        info!(
            path = %self.path.display(),
            channels = self.channels.len(),
            sampling_rate = header.sampling_rate,
            "Recording file prepared"
        );
        Ok(())
    }

    fn write_block(&mut self, block: &SampleBlock) -> Result<(), RecordingError> {
        self.require(Stage::Prepared, "write samples")?;
        let layout = block.layout();
        if layout.eeg < self.layout.eeg || layout.exg < self.layout.exg {
            return Err(RecordingError::LayoutMismatch {
                block: layout,
                file: self.layout,
            });
        }

        let (eeg, exg, triggers) = (block.eeg(), block.exg(), block.triggers());
        let spr = self.samples_per_record as usize;
        for frame in 0..block.len() {
            for (channel, source) in self.sources.iter().enumerate() {
                let value = match *source {
                    // 24-bit data sits in the upper bits
                    Source::Eeg(i) => eeg[frame * layout.eeg + i] >> 8,
                    Source::Exg(i) => exg[frame * layout.exg + i] >> 8,
                    Source::Trigger => trigger_value(triggers[frame]) as i32,
                };
                self.pending[channel].push(value);
            }
            if self.pending[0].len() == spr {
                self.flush_record()?;
            }
        }
        Ok(())
    }

    fn supports_events(&self) -> bool {
        self.format.supports_events()
    }

    fn add_event(&mut self, event_type: u32, onset_secs: f64) -> Result<(), RecordingError> {
        if !self.supports_events() {
            return Err(RecordingError::AnnotationsUnsupported);
        }
        self.require(Stage::Prepared, "add an event")?;
        self.write_record_block(&RecordBlock::Event(EventAnnotation {
            event_type,
            onset_secs,
        }))?;
        self.footer.total_events += 1;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), RecordingError> {
        if self.stage != Stage::Prepared {
            // Never got a header: nothing worth keeping on disk
            drop(self.writer);
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove unused recording file");
            }
            return Ok(());
        }

        self.finish()?;
        info!(
            path = %self.path.display(),
            samples = self.footer.total_samples,
            events = self.footer.total_events,
            records = self.footer.record_count,
            checksum = format!("{:016x}", self.footer.data_checksum),
            "Closed recording file"
        );
        Ok(())
    }
}
