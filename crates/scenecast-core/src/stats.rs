//! Transport statistics: lock-free counters shared between the framer,
//! the resource codecs and the coordinator.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct TransportStatistics {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    resources_loaded_from_file: AtomicU64,
    resources_received: AtomicU64,
    resources_sent: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub resources_loaded_from_file: u64,
    pub resources_received: u64,
    pub resources_sent: u64,
}

impl TransportStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One finalized outgoing packet of `size` payload bytes.
    pub fn record_packet_sent(&self, size: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, size: usize) {
        self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_loaded_from_file(&self) {
        self.resources_loaded_from_file.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resources_received(&self, count: usize) {
        self.resources_received.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_resources_sent(&self, count: usize) {
        self.resources_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            resources_loaded_from_file: self.resources_loaded_from_file.load(Ordering::Relaxed),
            resources_received: self.resources_received.load(Ordering::Relaxed),
            resources_sent: self.resources_sent.load(Ordering::Relaxed),
        }
    }
}
