//! Session statistics
//!
//! Counters are plain atomics so the forwarding loops never take a lock.
//! They only go up, except for the reset at session start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Shared statistics using atomic counters for lock-free access
#[derive(Debug, Default)]
pub struct SharedStats {
    /// Packets pushed from the interface into the relay
    pub packets_in: AtomicU64,
    pub bytes_in: AtomicU64,
    /// Packets written from the relay back to the interface
    pub packets_out: AtomicU64,
    pub bytes_out: AtomicU64,
    /// Packets dropped in either direction
    pub dropped: AtomicU64,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet accepted by the relay
    pub fn record_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet written to the interface
    pub fn record_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped packet
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter
    pub fn reset(&self) {
        self.packets_in.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.packets_out.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }

    /// Get a snapshot of current stats
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of stats at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
    pub dropped: u64,
}

impl StatsSnapshot {
    /// Get the total bytes transferred
    pub fn total_bytes(&self) -> u64 {
        self.bytes_in + self.bytes_out
    }
}

/// Reference to shared stats
pub type SharedStatsRef = Arc<SharedStats>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reset() {
        let stats = SharedStats::new();
        stats.record_in(100);
        stats.record_in(50);
        stats.record_out(20);
        stats.record_drop();

        let snap = stats.snapshot();
        assert_eq!(snap.packets_in, 2);
        assert_eq!(snap.bytes_in, 150);
        assert_eq!(snap.packets_out, 1);
        assert_eq!(snap.total_bytes(), 170);
        assert_eq!(snap.dropped, 1);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_snapshot_json_fields() {
        let stats = SharedStats::new();
        stats.record_out(40);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["packets_out"], 1);
        assert_eq!(json["bytes_out"], 40);
        assert_eq!(json["dropped"], 0);
    }
}
