//! In-memory capture backend.
//!
//! Replays a fixed list of frames on a dedicated thread, the same way a live
//! device delivers them. Gives the session a deterministic frame source.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::{CaptureBackend, CaptureDevice, CaptureError, ErrorHandler, FrameHandler, RawFrame};

/// Observes how far a replay has progressed.
#[derive(Clone, Default)]
pub struct ReplayProgress {
    delivered: Arc<AtomicUsize>,
    finished: Arc<AtomicBool>,
}

impl ReplayProgress {
    /// Frames handed to the frame handler so far.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Acquire)
    }

    /// True once the replay thread has run out of frames.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

pub struct ReplayBackend {
    devices: Vec<CaptureDevice>,
    list_error: Option<String>,
    frames: Vec<RawFrame>,
    failure: Option<CaptureError>,
    opened: Option<CaptureDevice>,
    running: Arc<AtomicBool>,
    progress: ReplayProgress,
    handle: Option<JoinHandle<()>>,
}

impl ReplayBackend {
    pub fn new(devices: Vec<CaptureDevice>) -> Self {
        Self {
            devices,
            list_error: None,
            frames: Vec::new(),
            failure: None,
            opened: None,
            running: Arc::new(AtomicBool::new(false)),
            progress: ReplayProgress::default(),
            handle: None,
        }
    }

    /// Frames to deliver, in order, once subscribed.
    pub fn with_frames(mut self, frames: Vec<RawFrame>) -> Self {
        self.frames = frames;
        self
    }

    /// Simulates the device failing after the last frame.
    pub fn with_failure(mut self, err: CaptureError) -> Self {
        self.failure = Some(err);
        self
    }

    /// Makes device enumeration fail.
    pub fn with_list_error(mut self, message: impl Into<String>) -> Self {
        self.list_error = Some(message.into());
        self
    }

    pub fn progress(&self) -> ReplayProgress {
        self.progress.clone()
    }

    /// Device opened by the last `open` call.
    pub fn opened(&self) -> Option<&CaptureDevice> {
        self.opened.as_ref()
    }
}

impl CaptureBackend for ReplayBackend {
    fn name(&self) -> &str {
        "replay"
    }

    fn list_devices(&self) -> Result<Vec<CaptureDevice>, CaptureError> {
        if let Some(message) = &self.list_error {
            return Err(CaptureError::Backend(message.clone()));
        }
        Ok(self.devices.clone())
    }

    fn open(&mut self, device: &CaptureDevice) -> Result<(), CaptureError> {
        if !self.devices.iter().any(|d| d.name == device.name) {
            return Err(CaptureError::DeviceNotFound {
                fragment: device.name.clone(),
            });
        }
        self.opened = Some(device.clone());
        Ok(())
    }

    fn subscribe(
        &mut self,
        mut on_frame: FrameHandler,
        on_error: ErrorHandler,
    ) -> Result<(), CaptureError> {
        if self.opened.is_none() {
            return Err(CaptureError::NotOpen);
        }
        if self.handle.is_some() {
            return Err(CaptureError::AlreadySubscribed);
        }

        let frames = std::mem::take(&mut self.frames);
        let failure = self.failure.take();
        let running = Arc::clone(&self.running);
        let progress = self.progress.clone();
        running.store(true, Ordering::Release);

        let handle = std::thread::Builder::new()
            .name("replay-capture".to_string())
            .spawn(move || {
                for frame in frames {
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    on_frame(frame);
                    progress.delivered.fetch_add(1, Ordering::AcqRel);
                }

                if running.load(Ordering::Acquire) {
                    if let Some(err) = failure {
                        on_error(err);
                    }
                }

                progress.finished.store(true, Ordering::Release);
            })
            .map_err(|e| CaptureError::Backend(format!("spawning replay thread: {e}")))?;

        self.handle = Some(handle);

        Ok(())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(backend = "replay", "capture thread panicked");
            }
        }

        self.opened = None;
    }
}

impl Drop for ReplayBackend {
    fn drop(&mut self) {
        self.close();
    }
}
