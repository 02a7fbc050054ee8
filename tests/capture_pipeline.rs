mod common;

use std::sync::Arc;
use std::time::Duration;

use trafficwatch::capture::replay::ReplayBackend;
use trafficwatch::capture::{CaptureDevice, CaptureError, RawFrame};
use trafficwatch::config::{BatchConfig, CaptureConfig};
use trafficwatch::error::ErrorKind;
use trafficwatch::session::{CaptureSession, SessionState};

use common::{ethernet_udp_frame, wait_until, MemoryStore, RecordingReporter};

/// 250 frames whose IP sizes alternate 100, 1600, 100, ...
fn alternating_frames(n: u16) -> Vec<RawFrame> {
    (0..n)
        .map(|i| ethernet_udp_frame(if i % 2 == 0 { 100 } else { 1600 }, i))
        .collect()
}

fn devices() -> Vec<CaptureDevice> {
    vec![
        CaptureDevice::new("lo", Some("Loopback".to_string())),
        CaptureDevice::new("eth0", None),
        CaptureDevice::new("eth1", None),
    ]
}

fn capture_cfg(fragment: &str) -> CaptureConfig {
    CaptureConfig {
        device: fragment.to_string(),
        ..Default::default()
    }
}

fn batch_cfg() -> BatchConfig {
    BatchConfig {
        retry_backoff: Duration::from_millis(1),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_to_end_batches_in_capture_order() {
    let backend = ReplayBackend::new(devices()).with_frames(alternating_frames(250));
    let progress = backend.progress();
    let store = Arc::new(MemoryStore::default());
    let reporter = Arc::new(RecordingReporter::default());

    let mut session = CaptureSession::new(
        capture_cfg("eth0"),
        batch_cfg(),
        Box::new(backend),
        Arc::clone(&store),
        reporter.clone(),
    );

    let device = session.start().await.expect("start session");
    assert_eq!(device.name, "eth0");
    assert_eq!(session.state(), SessionState::Capturing);

    wait_until("replay to finish", || progress.is_finished()).await;
    wait_until("two full batches", || store.calls() == 2).await;

    // Only full batches are flushed while capturing.
    assert_eq!(store.inserts().len(), 2);

    let summary = session.stop().await;
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(summary.records, 250);
    assert_eq!(summary.unpersisted, 0);

    let inserts = store.inserts();
    let lens: Vec<usize> = inserts.iter().map(Vec::len).collect();
    assert_eq!(lens, vec![100, 100, 50]);

    for (i, record) in inserts.iter().flatten().enumerate() {
        let expected = if i % 2 == 0 { 100 } else { 1600 };
        assert_eq!(record.packet.size_bytes, expected, "record {i}");
        assert_eq!(record.anomalous, expected > 1500, "record {i}");
        assert_eq!(
            record.captured_at,
            std::time::UNIX_EPOCH + Duration::from_millis(i as u64),
            "record {i} out of order"
        );
        assert_eq!(record.packet.source.to_string(), "192.168.0.10");
        assert_eq!(record.packet.destination.to_string(), "192.168.0.20");
        assert_eq!(record.packet.protocol.as_str(), "UDP");
    }

    assert!(reporter.kinds().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_flush_is_retried_at_head_of_next_batch() {
    let backend = ReplayBackend::new(devices()).with_frames(alternating_frames(250));
    let progress = backend.progress();
    let store = Arc::new(MemoryStore::failing_first(1));
    let reporter = Arc::new(RecordingReporter::default());

    let mut session = CaptureSession::new(
        capture_cfg("eth0"),
        batch_cfg(),
        Box::new(backend),
        Arc::clone(&store),
        reporter.clone(),
    );
    session.start().await.expect("start session");

    wait_until("replay to finish", || progress.is_finished()).await;
    wait_until("retry flush", || store.calls() == 2).await;

    let summary = session.stop().await;
    assert_eq!(summary.failures, 1);
    assert_eq!(summary.records, 250);

    let inserts = store.inserts();
    let lens: Vec<usize> = inserts.iter().map(Vec::len).collect();
    assert_eq!(lens, vec![200, 50]);

    let order: Vec<Duration> = inserts
        .iter()
        .flatten()
        .map(|r| {
            r.captured_at
                .duration_since(std::time::UNIX_EPOCH)
                .expect("after epoch")
        })
        .collect();
    let expected: Vec<Duration> = (0..250).map(Duration::from_millis).collect();
    assert_eq!(order, expected);

    assert_eq!(reporter.kinds(), vec![ErrorKind::StorageWrite]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_decode_errors_skip_frames() {
    let mut frames = alternating_frames(4);
    let truncated = RawFrame {
        data: vec![0xde, 0xad],
        ..frames[0].clone()
    };
    frames.insert(2, truncated);
    let backend = ReplayBackend::new(devices()).with_frames(frames);
    let progress = backend.progress();
    let store = Arc::new(MemoryStore::default());
    let reporter = Arc::new(RecordingReporter::default());

    let mut session = CaptureSession::new(
        capture_cfg("eth1"),
        batch_cfg(),
        Box::new(backend),
        Arc::clone(&store),
        reporter.clone(),
    );
    assert_eq!(session.start().await.expect("start").name, "eth1");

    wait_until("replay to finish", || progress.is_finished()).await;
    session.stop().await;

    let inserts = store.inserts();
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].len(), 4);
    assert_eq!(reporter.kinds(), vec![ErrorKind::Decode]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_loss_signals_and_final_flush_runs() {
    let backend = ReplayBackend::new(devices())
        .with_frames(alternating_frames(30))
        .with_failure(CaptureError::Backend("interface removed".to_string()));
    let store = Arc::new(MemoryStore::default());
    let reporter = Arc::new(RecordingReporter::default());

    let mut session = CaptureSession::new(
        capture_cfg("eth0"),
        batch_cfg(),
        Box::new(backend),
        Arc::clone(&store),
        reporter.clone(),
    );
    session.start().await.expect("start session");

    tokio::time::timeout(Duration::from_secs(10), session.device_lost().cancelled())
        .await
        .expect("device loss signalled");

    wait_until("session to stop", || session.state() == SessionState::Stopped).await;

    let summary = session.stop().await;
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(summary.records, 30);
    assert_eq!(store.inserts().len(), 1);
    assert_eq!(reporter.kinds(), vec![ErrorKind::Device]);
}

#[tokio::test]
async fn test_missing_device_is_fatal() {
    let backend = ReplayBackend::new(devices()).with_frames(alternating_frames(10));
    let store = Arc::new(MemoryStore::default());
    let reporter = Arc::new(RecordingReporter::default());

    let mut session = CaptureSession::new(
        capture_cfg("wlan"),
        batch_cfg(),
        Box::new(backend),
        Arc::clone(&store),
        reporter.clone(),
    );

    let err = session.start().await.expect_err("no wlan device");
    assert!(err.is_fatal());
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(reporter.kinds(), vec![ErrorKind::DeviceNotFound]);
    assert_eq!(store.calls(), 0);
}
