use std::sync::atomic::{AtomicU64, Ordering};

/// Per-device and per-peer byte/packet counters. Every field is an
/// independent relaxed atomic: readers (e.g. a metrics exporter) tolerate
/// torn snapshots across fields, which is the same tradeoff the teacher's
/// `arc_swap`-based last-address field makes for the hot path.
#[derive(Default)]
pub struct Stats {
    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_packets: AtomicU64,
    pub tx_packets: AtomicU64,
    pub rx_errors: AtomicU64,
    pub rx_length_errors: AtomicU64,
    pub rx_frame_errors: AtomicU64,
    pub rx_dropped: AtomicU64,
}

impl Stats {
    pub fn add_rx(&self, bytes: u64) {
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tx(&self, bytes: u64) {
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rx_errors(&self) {
        self.rx_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rx_length_errors(&self) {
        self.rx_length_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rx_frame_errors(&self) {
        self.rx_frame_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            rx_length_errors: self.rx_length_errors.load(Ordering::Relaxed),
            rx_frame_errors: self.rx_frame_errors.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub rx_length_errors: u64,
    pub rx_frame_errors: u64,
    pub rx_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let s = Stats::default();
        s.add_rx(148);
        s.add_rx(92);
        s.inc_rx_errors();
        let snap = s.snapshot();
        assert_eq!(snap.rx_packets, 2);
        assert_eq!(snap.rx_bytes, 240);
        assert_eq!(snap.rx_errors, 1);
    }
}
