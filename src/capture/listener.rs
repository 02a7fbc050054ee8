use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::export::health::HealthMetrics;
use crate::packet::classify::Classifier;
use crate::packet::decode::decode_frame;
use crate::packet::BatchRecord;
use crate::pipeline::{FlushHandle, RecordBatch};
use crate::report::ErrorReporter;

use super::stats::ProtocolStats;
use super::{CaptureBackend, CaptureDevice, RawFrame};

/// Per-frame processing shared with the capture thread:
/// decode, classify, append, and hand full batches to the flusher.
pub struct Ingest {
    batch: RecordBatch,
    classifier: Box<dyn Classifier>,
    flush: FlushHandle,
    reporter: Arc<dyn ErrorReporter>,
    stats: Arc<ProtocolStats>,
    health: Option<Arc<HealthMetrics>>,
}

impl Ingest {
    pub fn new(
        batch_size: usize,
        classifier: Box<dyn Classifier>,
        flush: FlushHandle,
        reporter: Arc<dyn ErrorReporter>,
        stats: Arc<ProtocolStats>,
    ) -> Self {
        Self {
            batch: RecordBatch::new(batch_size),
            classifier,
            flush,
            reporter,
            stats,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Option<Arc<HealthMetrics>>) -> Self {
        self.health = health;
        self
    }

    /// Handles one frame. Runs on the capture thread.
    pub fn process(&self, frame: RawFrame) {
        if let Some(health) = &self.health {
            health.frames_received.inc();
        }

        let packet = match decode_frame(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.record_skipped();
                self.reporter.report(&PipelineError::Decode(e));
                return;
            }
        };

        let anomalous = self.classifier.is_anomalous(packet.size_bytes);

        tracing::debug!(
            source = %packet.source,
            destination = %packet.destination,
            protocol = %packet.protocol,
            size_bytes = packet.size_bytes,
            "packet captured"
        );

        if anomalous {
            tracing::info!(
                source = %packet.source,
                destination = %packet.destination,
                size_bytes = packet.size_bytes,
                "anomaly detected: packet size exceeds threshold"
            );
        }

        self.stats.record(packet.protocol, anomalous);
        if let Some(health) = &self.health {
            health.packets_decoded.inc();
            if anomalous {
                health.anomalies_detected.inc();
            }
        }

        let record = BatchRecord::new(frame.captured_at, packet, anomalous);
        if let Some(full) = self.batch.append(record) {
            self.flush.submit(full);
        }
    }

    /// Extracts the partial batch.
    pub fn drain(&self) -> Vec<BatchRecord> {
        self.batch.drain()
    }

    pub fn buffered(&self) -> usize {
        self.batch.len()
    }
}

/// Drives a capture backend and feeds its frames through [`Ingest`].
pub struct PacketListener {
    backend: Box<dyn CaptureBackend>,
    ingest: Arc<Ingest>,
    device_lost: CancellationToken,
    device: Option<CaptureDevice>,
}

impl PacketListener {
    /// `device_lost` is cancelled if the device fails mid-capture.
    pub fn new(
        backend: Box<dyn CaptureBackend>,
        ingest: Arc<Ingest>,
        device_lost: CancellationToken,
    ) -> Self {
        Self {
            backend,
            ingest,
            device_lost,
            device: None,
        }
    }

    /// Opens `device` and starts delivering frames on the backend's thread.
    pub fn start(&mut self, device: &CaptureDevice) -> Result<(), PipelineError> {
        self.backend.open(device)?;

        let ingest = Arc::clone(&self.ingest);
        let reporter = Arc::clone(&self.ingest.reporter);
        let device_lost = self.device_lost.clone();
        let name = device.name.clone();

        let subscribed = self.backend.subscribe(
            Box::new(move |frame| ingest.process(frame)),
            Box::new(move |err| {
                reporter.report(&PipelineError::Device(format!("{name}: {err}")));
                device_lost.cancel();
            }),
        );

        if let Err(e) = subscribed {
            self.backend.close();
            return Err(e.into());
        }

        tracing::info!(
            device = %device.name,
            description = %device.description,
            backend = self.backend.name(),
            "capturing packets"
        );

        self.device = Some(device.clone());

        Ok(())
    }

    /// Closes the device and returns the records still buffered.
    ///
    /// Blocks until the capture thread has exited.
    pub fn stop(&mut self) -> Vec<BatchRecord> {
        self.backend.close();

        if let Some(device) = self.device.take() {
            tracing::info!(device = %device.name, "capture stopped");
        }

        self.ingest.drain()
    }

    pub fn device(&self) -> Option<&CaptureDevice> {
        self.device.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant, SystemTime};

    use etherparse::PacketBuilder;
    use parking_lot::Mutex;

    use super::*;
    use crate::capture::replay::ReplayBackend;
    use crate::capture::{CaptureError, LinkType};
    use crate::config::BatchConfig;
    use crate::packet::classify::SizeThreshold;
    use crate::pipeline::Flusher;
    use crate::store::RecordStore;

    #[derive(Default)]
    struct SizesStore {
        inserts: Mutex<Vec<Vec<(u32, bool)>>>,
    }

    impl RecordStore for SizesStore {
        fn name(&self) -> &str {
            "sizes"
        }

        async fn bulk_insert(&self, records: &[BatchRecord]) -> anyhow::Result<()> {
            self.inserts.lock().push(
                records
                    .iter()
                    .map(|r| (r.packet.size_bytes, r.anomalous))
                    .collect(),
            );
            Ok(())
        }
    }

    #[derive(Default)]
    struct KindsReporter {
        kinds: Mutex<Vec<&'static str>>,
    }

    impl ErrorReporter for KindsReporter {
        fn report(&self, err: &PipelineError) {
            self.kinds.lock().push(err.kind().as_str());
        }
    }

    /// Raw IPv4/UDP frame whose IP total length is `ip_len` (at least 28).
    fn udp_frame(ip_len: u16) -> RawFrame {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64).udp(4000, 4001);
        let payload = vec![0u8; usize::from(ip_len) - 28];
        let mut data = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut data, &payload).expect("write packet");
        RawFrame {
            link_type: LinkType::RawIp,
            captured_at: SystemTime::now(),
            data,
        }
    }

    fn garbage_frame() -> RawFrame {
        RawFrame {
            link_type: LinkType::Ethernet,
            captured_at: SystemTime::now(),
            data: vec![0u8; 6],
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_skips_bad_frames_and_flushes_full_batches() {
        let store = Arc::new(SizesStore::default());
        let reporter = Arc::new(KindsReporter::default());
        let mut flusher = Flusher::new(
            Arc::clone(&store),
            reporter.clone(),
            BatchConfig {
                size: 2,
                ..Default::default()
            },
        );
        let handle = flusher.start(&CancellationToken::new());

        let ingest = Arc::new(Ingest::new(
            2,
            Box::new(SizeThreshold::default()),
            handle,
            reporter.clone(),
            Arc::new(ProtocolStats::new()),
        ));

        let device = CaptureDevice::new("eth0", None);
        let backend = ReplayBackend::new(vec![device.clone()]).with_frames(vec![
            udp_frame(100),
            garbage_frame(),
            udp_frame(1600),
            udp_frame(1500),
        ]);
        let progress = backend.progress();

        let lost = CancellationToken::new();
        let mut listener = PacketListener::new(Box::new(backend), Arc::clone(&ingest), lost.clone());
        listener.start(&device).expect("start");
        assert_eq!(listener.device(), Some(&device));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !progress.is_finished() {
            assert!(Instant::now() < deadline, "replay did not finish");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(ingest.buffered(), 1);

        let rest = tokio::task::spawn_blocking(move || listener.stop())
            .await
            .expect("stop");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].packet.size_bytes, 1500);
        assert!(!rest[0].anomalous);
        assert_eq!(ingest.buffered(), 0);

        flusher.shutdown().await;

        assert_eq!(*store.inserts.lock(), vec![vec![(100, false), (1600, true)]]);
        assert_eq!(*reporter.kinds.lock(), vec!["decode"]);
        assert!(!lost.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_device_failure_cancels_token() {
        let reporter = Arc::new(KindsReporter::default());
        let mut flusher = Flusher::new(
            Arc::new(SizesStore::default()),
            reporter.clone(),
            BatchConfig::default(),
        );
        let handle = flusher.start(&CancellationToken::new());
        let ingest = Arc::new(Ingest::new(
            100,
            Box::new(SizeThreshold::default()),
            handle,
            reporter.clone(),
            Arc::new(ProtocolStats::new()),
        ));

        let device = CaptureDevice::new("eth0", None);
        let backend = ReplayBackend::new(vec![device.clone()])
            .with_failure(CaptureError::Backend("interface went down".to_string()));

        let lost = CancellationToken::new();
        let mut listener = PacketListener::new(Box::new(backend), ingest, lost.clone());
        listener.start(&device).expect("start");

        tokio::time::timeout(Duration::from_secs(5), lost.cancelled())
            .await
            .expect("device loss signalled");

        tokio::task::spawn_blocking(move || listener.stop())
            .await
            .expect("stop");
        flusher.shutdown().await;

        assert_eq!(*reporter.kinds.lock(), vec!["device"]);
    }
}
