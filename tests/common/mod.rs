#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};

use etherparse::PacketBuilder;
use parking_lot::Mutex;

use trafficwatch::capture::{LinkType, RawFrame};
use trafficwatch::error::{ErrorKind, PipelineError};
use trafficwatch::packet::BatchRecord;
use trafficwatch::report::ErrorReporter;
use trafficwatch::store::RecordStore;

/// In-memory store keeping every successful bulk insert.
#[derive(Default)]
pub struct MemoryStore {
    inserts: Mutex<Vec<Vec<BatchRecord>>>,
    calls: AtomicUsize,
    fail_first: usize,
}

impl MemoryStore {
    /// Fails the first `n` bulk inserts.
    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Default::default()
        }
    }

    pub fn inserts(&self) -> Vec<Vec<BatchRecord>> {
        self.inserts.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RecordStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn bulk_insert(&self, records: &[BatchRecord]) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            anyhow::bail!("store unavailable");
        }
        self.inserts.lock().push(records.to_vec());
        Ok(())
    }
}

/// Reporter that keeps the kind of every reported error.
#[derive(Default)]
pub struct RecordingReporter {
    kinds: Mutex<Vec<ErrorKind>>,
}

impl RecordingReporter {
    pub fn kinds(&self) -> Vec<ErrorKind> {
        self.kinds.lock().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, err: &PipelineError) {
        self.kinds.lock().push(err.kind());
    }
}

/// Ethernet II frame carrying an IPv4/UDP packet of exactly `ip_len` bytes.
pub fn ethernet_udp_frame(ip_len: u16, seq: u16) -> RawFrame {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([192, 168, 0, 10], [192, 168, 0, 20], 64)
        .udp(40_000 + seq % 1000, 53);
    let payload = vec![0u8; usize::from(ip_len) - 28];
    let mut data = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut data, &payload).expect("write frame");

    RawFrame {
        link_type: LinkType::Ethernet,
        captured_at: SystemTime::UNIX_EPOCH + Duration::from_millis(u64::from(seq)),
        data,
    }
}

/// Polls `cond` until it holds or the deadline passes.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
