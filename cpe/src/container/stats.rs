use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters updated on every stage call.
#[derive(Debug, Default)]
pub(crate) struct ContainerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    skipped: AtomicU64,
    restarts: AtomicU64,
    batches: AtomicU64,
    processing_micros: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ContainerStats {
    pub fn record_call(&self, elapsed: Duration, traffic: (u64, u64)) {
        self.processing_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(traffic.0, Ordering::Relaxed);
        self.bytes_received.fetch_add(traffic.1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, timeout: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ContainerStatsSnapshot {
        ContainerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            processing_ms: self.processing_micros.load(Ordering::Relaxed) / 1000,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time container statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub timeouts: u64,
    /// Entities that bypassed the stage while it was disabled.
    pub skipped: u64,
    pub restarts: u64,
    pub batches: u64,
    /// Cumulative time spent inside stage calls.
    pub processing_ms: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ContainerStatsSnapshot {
    /// Mean call time in milliseconds, over successful and failed calls.
    pub fn mean_call_ms(&self) -> f64 {
        let calls = self.processed + self.failed;
        if calls == 0 {
            0.0
        } else {
            self.processing_ms as f64 / calls as f64
        }
    }
}
