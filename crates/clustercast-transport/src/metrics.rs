//! Multiplexer metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of multiplexer metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Data packets retransmitted after a loss report.
    pub resent_packets: u64,
    /// Payload bytes retransmitted after a loss report.
    pub resent_bytes: u64,
    /// Loss reports received (master) or emitted (slave).
    pub loss_reports: u64,
    /// Acknowledgments received (master) or emitted (slave).
    pub acknowledgments: u64,
    /// Ping requests received (master) or emitted (slave).
    pub pings: u64,
}

/// Thread-safe metrics collector for one multiplexer instance.
#[derive(Default)]
pub(crate) struct MuxMetrics {
    resent_packets: AtomicU64,
    resent_bytes: AtomicU64,
    loss_reports: AtomicU64,
    acknowledgments: AtomicU64,
    pings: AtomicU64,
}

impl MuxMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resent(&self, packets: u64, bytes: u64) {
        self.resent_packets.fetch_add(packets, Ordering::Relaxed);
        self.resent_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_loss_reports(&self) {
        self.loss_reports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_acknowledgments(&self) {
        self.acknowledgments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pings(&self) {
        self.pings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            resent_packets: self.resent_packets.load(Ordering::Relaxed),
            resent_bytes: self.resent_bytes.load(Ordering::Relaxed),
            loss_reports: self.loss_reports.load(Ordering::Relaxed),
            acknowledgments: self.acknowledgments.load(Ordering::Relaxed),
            pings: self.pings.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MuxMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = MuxMetrics::new();
        metrics.add_resent(3, 4392);
        metrics.add_resent(1, 1000);
        metrics.inc_loss_reports();
        metrics.inc_acknowledgments();
        metrics.inc_acknowledgments();
        metrics.inc_pings();

        let snap = metrics.snapshot();
        assert_eq!(snap.resent_packets, 4);
        assert_eq!(snap.resent_bytes, 5392);
        assert_eq!(snap.loss_reports, 1);
        assert_eq!(snap.acknowledgments, 2);
        assert_eq!(snap.pings, 1);
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = MuxMetrics::new();
        metrics.add_resent(1, 10);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"resent_packets\":1"));
    }
}
