use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::capture::listener::{Ingest, PacketListener};
use crate::capture::select::select_device;
use crate::capture::stats::ProtocolStats;
use crate::capture::{CaptureBackend, CaptureDevice};
use crate::config::{BatchConfig, CaptureConfig};
use crate::error::PipelineError;
use crate::export::health::HealthMetrics;
use crate::packet::classify::{Classifier, SizeThreshold};
use crate::pipeline::{FlushHandle, FlushSummary, Flusher};
use crate::report::ErrorReporter;
use crate::store::RecordStore;

/// Lifecycle of a capture session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Capturing = 1,
    Stopped = 2,
}

impl SessionState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Capturing,
            _ => Self::Stopped,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Capturing => "capturing",
            Self::Stopped => "stopped",
        }
    }
}

/// One capture run: owns the device, the batch, and the flush worker.
///
/// Collaborators (backend, store, reporter) are injected. `start` selects and
/// opens the device; `stop` closes it and waits until the final partial batch
/// has been handed to the store. A device failure mid-capture moves the
/// session to Stopped on its own; `stop` still has to run to flush the rest.
pub struct CaptureSession<S: RecordStore> {
    capture_cfg: CaptureConfig,
    batch_cfg: BatchConfig,
    backend: Option<Box<dyn CaptureBackend>>,
    classifier: Option<Box<dyn Classifier>>,
    reporter: Arc<dyn ErrorReporter>,
    health: Option<Arc<HealthMetrics>>,
    stats: Arc<ProtocolStats>,
    flusher: Flusher<S>,
    flush_handle: Option<FlushHandle>,
    listener: Option<PacketListener>,
    device: Option<CaptureDevice>,
    state: Arc<AtomicU8>,
    closed: bool,
    cancel: CancellationToken,
    device_lost: CancellationToken,
}

impl<S: RecordStore> CaptureSession<S> {
    pub fn new(
        capture_cfg: CaptureConfig,
        batch_cfg: BatchConfig,
        backend: Box<dyn CaptureBackend>,
        store: Arc<S>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let flusher = Flusher::new(store, Arc::clone(&reporter), batch_cfg.clone());

        Self {
            capture_cfg,
            batch_cfg,
            backend: Some(backend),
            classifier: Some(Box::new(SizeThreshold::default())),
            reporter,
            health: None,
            stats: Arc::new(ProtocolStats::new()),
            flusher,
            flush_handle: None,
            listener: None,
            device: None,
            state: Arc::new(AtomicU8::new(SessionState::Idle as u8)),
            closed: false,
            cancel: CancellationToken::new(),
            device_lost: CancellationToken::new(),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.flusher = self.flusher.with_health(Arc::clone(&health));
        health.session_state.set(f64::from(self.state.load(Ordering::Acquire)));
        self.health = Some(health);
        self
    }

    /// Replaces the default size-threshold classifier.
    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The device selected by `start`, if any.
    pub fn device(&self) -> Option<&CaptureDevice> {
        self.device.as_ref()
    }

    /// Cancelled when the capture device fails mid-run. The session is then
    /// Stopped; the owner should call `stop` to flush what was captured.
    pub fn device_lost(&self) -> CancellationToken {
        self.device_lost.clone()
    }

    /// Selects the configured device and starts capturing. Idle → Capturing.
    ///
    /// Every failure here is fatal: it is reported, the session moves to
    /// Stopped, and the error is returned.
    pub async fn start(&mut self) -> Result<CaptureDevice, PipelineError> {
        let state = self.state();
        if state != SessionState::Idle {
            return Err(PipelineError::Configuration(format!(
                "capture session cannot start from state {}",
                state.as_str()
            )));
        }

        match self.try_start().await {
            Ok(device) => {
                self.set_state(SessionState::Capturing);
                self.spawn_device_watch();
                self.spawn_stats_reporter();
                info!(
                    device = %device.name,
                    batch_size = self.batch_cfg.size,
                    "capture session started"
                );
                Ok(device)
            }
            Err(e) => {
                self.reporter.report(&e);
                self.flusher.shutdown().await;
                self.cancel.cancel();
                self.closed = true;
                self.set_state(SessionState::Stopped);
                Err(e)
            }
        }
    }

    async fn try_start(&mut self) -> Result<CaptureDevice, PipelineError> {
        let (Some(backend), Some(classifier)) = (self.backend.take(), self.classifier.take())
        else {
            return Err(PipelineError::Configuration(
                "capture session is missing its backend".to_string(),
            ));
        };

        let device = select_device(backend.as_ref(), &self.capture_cfg.device)?;
        info!(
            device = %device.name,
            description = %device.description,
            fragment = %self.capture_cfg.device,
            "selected capture device"
        );

        let handle = self.flusher.start(&self.cancel);

        let ingest = Ingest::new(
            self.batch_cfg.size,
            classifier,
            handle.clone(),
            Arc::clone(&self.reporter),
            Arc::clone(&self.stats),
        )
        .with_health(self.health.clone());

        let mut listener =
            PacketListener::new(backend, Arc::new(ingest), self.device_lost.clone());

        // Opening may block on the platform, keep it off the async workers.
        let opened = tokio::task::spawn_blocking({
            let device = device.clone();
            move || {
                let result = listener.start(&device);
                (listener, result)
            }
        })
        .await;

        let (listener, result) = opened
            .map_err(|e| PipelineError::Device(format!("opening device task failed: {e}")))?;
        result?;

        self.listener = Some(listener);
        self.flush_handle = Some(handle);
        self.device = Some(device.clone());

        Ok(device)
    }

    /// Stops capture and persists everything still buffered. Capturing → Stopped.
    ///
    /// Also valid after a device failure already moved the session to
    /// Stopped. Idempotent: later calls return an empty summary.
    pub async fn stop(&mut self) -> FlushSummary {
        if self.closed {
            return FlushSummary::default();
        }
        self.closed = true;

        if let Some(mut listener) = self.listener.take() {
            // Closing joins the capture thread.
            match tokio::task::spawn_blocking(move || listener.stop()).await {
                Ok(rest) => {
                    if let Some(handle) = &self.flush_handle {
                        debug!(
                            records = rest.len(),
                            spilled = handle.spilled(),
                            "flushing partial batch"
                        );
                        // Also sends records spilled while the queue was full.
                        handle.submit_async(rest).await;
                    }
                }
                Err(e) => error!(error = %e, "capture shutdown task failed"),
            }
        }

        let summary = self.flusher.shutdown().await;
        self.flush_handle = None;
        self.cancel.cancel();
        self.set_state(SessionState::Stopped);

        info!(
            batches = summary.batches,
            records = summary.records,
            failures = summary.failures,
            unpersisted = summary.unpersisted,
            "capture session stopped"
        );

        summary
    }

    fn set_state(&self, state: SessionState) {
        let from = SessionState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        debug!(from = from.as_str(), to = state.as_str(), "session state");
        if let Some(health) = &self.health {
            health.session_state.set(f64::from(state as u8));
        }
    }

    /// Moves Capturing → Stopped when the device fails.
    fn spawn_device_watch(&self) {
        let cancel = self.cancel.clone();
        let device_lost = self.device_lost.clone();
        let state = Arc::clone(&self.state);
        let health = self.health.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = device_lost.cancelled() => {
                    let moved = state.compare_exchange(
                        SessionState::Capturing as u8,
                        SessionState::Stopped as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    if moved.is_ok() {
                        if let Some(health) = &health {
                            health.session_state.set(f64::from(SessionState::Stopped as u8));
                        }
                        error!("capture device lost, session stopped");
                    }
                }
            }
        });
    }

    fn spawn_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let period = self.capture_cfg.stats_interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot();
                        if snapshot.is_empty() {
                            continue;
                        }

                        info!(
                            packets = snapshot.total_packets(),
                            anomalies = snapshot.anomalies,
                            skipped = snapshot.skipped,
                            period = ?period,
                            "capture stats",
                        );

                        for (protocol, count) in &snapshot.packets {
                            debug!(protocol = %protocol, count, "  by protocol");
                        }
                    }
                }
            }
        });
    }
}
