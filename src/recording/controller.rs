//! Recording state and file lock
//!
//! Two locks are involved and they are always taken in the same order:
//! the file lock (around the open [`RecordingFile`]) before the control
//! mutex in [`SharedControl`]. The file lock is held for one write at a
//! time, so a stop request from another thread waits for at most one
//! in-flight write.
//!
//! Every start opens a new session id. Writes and failure handling from
//! the acquisition thread name the session they belong to, and anything
//! addressed to a session that has since ended is ignored.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{ChannelInfo, RecordingError, RecordingFile};
use crate::common::{RecordingState, SharedControl};

/// Parameters applied to a new recording file
#[derive(Debug, Clone)]
pub struct RecordingSetup {
    pub sampling_rate: u32,
    pub record_duration_secs: f64,
    pub channels: Vec<ChannelInfo>,
}

impl RecordingSetup {
    pub fn samples_per_record(&self) -> u32 {
        (self.record_duration_secs * self.sampling_rate as f64).round() as u32
    }
}

struct FileSlot {
    file: Option<Box<dyn RecordingFile>>,
    /// Set by a successful setup, cleared by the first start
    fresh: bool,
    /// Session writing to `file`; `None` until it is started
    session: Option<u64>,
}

pub struct RecordingController {
    control: Arc<SharedControl>,
    slot: Mutex<FileSlot>,
}

impl RecordingController {
    pub fn new(control: Arc<SharedControl>) -> Self {
        Self {
            control,
            slot: Mutex::new(FileSlot {
                file: None,
                fresh: false,
                session: None,
            }),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.control.recording_state()
    }

    pub fn has_file(&self) -> bool {
        self.slot.lock().file.is_some()
    }

    /// Id of the session currently writing, if any
    pub fn active_session(&self) -> Option<u64> {
        self.slot.lock().session
    }

    /// Configure `file` and make it the target of the next recording
    ///
    /// On failure the file is closed and discarded, the state stays
    /// `Paused` and any previously prepared file is kept.
    pub fn setup(
        &self,
        mut file: Box<dyn RecordingFile>,
        setup: &RecordingSetup,
    ) -> Result<(), RecordingError> {
        if self.state().is_saving() {
            discard(file);
            return Err(RecordingError::AlreadyRecording);
        }

        if let Err(e) = configure_file(file.as_mut(), setup) {
            warn!(error = %e, "Recording setup failed");
            discard(file);
            return Err(match e {
                RecordingError::Setup(msg) => RecordingError::Setup(msg),
                other => RecordingError::Setup(other.to_string()),
            });
        }

        let previous = {
            let mut slot = self.slot.lock();
            if self.control.recording_state().is_saving() {
                drop(slot);
                discard(file);
                return Err(RecordingError::AlreadyRecording);
            }
            slot.fresh = true;
            slot.session = None;
            slot.file.replace(file)
        };
        if let Some(previous) = previous {
            if let Err(e) = previous.close() {
                warn!(error = %e, "Failed to close previously prepared file");
            }
        }

        info!(
            channels = setup.channels.len(),
            sampling_rate = setup.sampling_rate,
            "Recording file ready"
        );
        Ok(())
    }

    /// Start saving; no-op if already saving
    ///
    /// Returns the resulting state: `SavingWithReset` on the first start
    /// after a setup, `Saving` otherwise.
    pub fn request_start(&self) -> Result<RecordingState, RecordingError> {
        let mut slot = self.slot.lock();
        if slot.file.is_none() {
            return Err(RecordingError::NoFile);
        }

        let fresh = slot.fresh;
        match self.control.begin_session(fresh) {
            Some(session) => {
                slot.fresh = false;
                slot.session = Some(session);
                let state = if fresh {
                    RecordingState::SavingWithReset
                } else {
                    RecordingState::Saving
                };
                info!(state = %state, session, "Recording started");
                Ok(state)
            }
            None => Ok(self.control.recording_state()),
        }
    }

    /// Stop saving and close the file
    ///
    /// Waits for any write in flight, closes the file under the file lock,
    /// then sets the state to `Paused`. Safe from any thread.
    pub fn request_stop(&self) -> Result<(), RecordingError> {
        let closed = {
            let mut slot = self.slot.lock();
            self.end_session(&mut slot)
        };
        report_close(closed)
    }

    /// [`request_stop`](Self::request_stop) limited to `session`
    ///
    /// Returns `Ok(false)` and leaves everything untouched if `session` has
    /// already ended, including when a newer file has been set up or
    /// started since.
    pub fn stop_session(&self, session: u64) -> Result<bool, RecordingError> {
        let closed = {
            let mut slot = self.slot.lock();
            if slot.session != Some(session) {
                return Ok(false);
            }
            self.end_session(&mut slot)
        };
        report_close(closed).map(|()| true)
    }

    /// Run `write` against the file of `session` while holding the file lock
    ///
    /// Returns `Ok(false)` without calling `write` unless `session` is the
    /// one currently saving.
    pub fn write_with<F>(&self, session: u64, write: F) -> Result<bool, RecordingError>
    where
        F: FnOnce(&mut dyn RecordingFile) -> Result<(), RecordingError>,
    {
        let mut slot = self.slot.lock();
        if slot.session != Some(session) || !self.control.recording_state().is_saving() {
            return Ok(false);
        }
        match slot.file.as_deref_mut() {
            Some(file) => write(file).map(|()| true),
            None => Ok(false),
        }
    }

    /// Close the file and pause; the caller holds the file lock
    fn end_session(&self, slot: &mut FileSlot) -> Option<Result<(), RecordingError>> {
        slot.fresh = false;
        slot.session = None;
        let closed = slot.file.take().map(|file| file.close());
        self.control.set_recording_state(RecordingState::Paused);
        closed
    }
}

impl Drop for RecordingController {
    fn drop(&mut self) {
        if let Some(file) = self.slot.get_mut().file.take() {
            if let Err(e) = file.close() {
                warn!(error = %e, "Failed to close recording file on shutdown");
            }
        }
    }
}

fn discard(file: Box<dyn RecordingFile>) {
    if let Err(e) = file.close() {
        debug!(error = %e, "Failed to discard unused recording file");
    }
}

fn report_close(closed: Option<Result<(), RecordingError>>) -> Result<(), RecordingError> {
    match closed {
        Some(Ok(())) => {
            info!("Recording stopped");
            Ok(())
        }
        Some(Err(e)) => {
            warn!(error = %e, "Recording stopped, file did not close cleanly");
            Err(e)
        }
        None => Ok(()),
    }
}

fn configure_file(file: &mut dyn RecordingFile, setup: &RecordingSetup) -> Result<(), RecordingError> {
    file.configure(
        setup.sampling_rate as f64,
        setup.record_duration_secs,
        setup.samples_per_record(),
    )?;
    for channel in &setup.channels {
        file.add_channel(channel.clone())?;
    }
    file.prepare_for_transfer()
}
