use std::sync::atomic::{AtomicU64, Ordering};

use crate::packet::{Protocol, PROTOCOL_SLOTS};

/// Lock-free per-protocol packet counters.
///
/// `snapshot()` reads and resets every counter, so the periodic reporter sees
/// only what arrived since its last tick.
pub struct ProtocolStats {
    packets: [AtomicU64; PROTOCOL_SLOTS],
    anomalies: AtomicU64,
    skipped: AtomicU64,
}

/// Counts accumulated since the previous snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Non-zero protocol counts, in slot order.
    pub packets: Vec<(Protocol, u64)>,
    pub anomalies: u64,
    pub skipped: u64,
}

impl StatsSnapshot {
    pub fn total_packets(&self) -> u64 {
        self.packets.iter().map(|(_, n)| n).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty() && self.anomalies == 0 && self.skipped == 0
    }
}

impl ProtocolStats {
    pub fn new() -> Self {
        Self {
            packets: std::array::from_fn(|_| AtomicU64::new(0)),
            anomalies: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn record(&self, protocol: Protocol, anomalous: bool) {
        self.packets[protocol.slot()].fetch_add(1, Ordering::Relaxed);
        if anomalous {
            self.anomalies.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counts a frame that failed to decode.
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut packets = Vec::new();

        for (slot, counter) in self.packets.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(protocol) = Protocol::from_slot(slot) {
                    packets.push((protocol, v));
                }
            }
        }

        StatsSnapshot {
            packets,
            anomalies: self.anomalies.swap(0, Ordering::Relaxed),
            skipped: self.skipped.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for ProtocolStats {
    fn default() -> Self {
        Self::new()
    }
}
