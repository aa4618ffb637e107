//! Write-Back Metrics
//!
//! Lock-free counters describing write and flush activity.

use crate::writeback::events::FlushTrigger;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of the write-back store
#[derive(Debug, Default)]
pub struct WriteBackMetrics {
    /// Calls to `set_ex_with_reminder` that reached the cache
    pub writes: AtomicU64,
    /// Actions folded into those writes
    pub actions_applied: AtomicU64,
    /// Flushes forced by the action threshold
    pub threshold_flushes: AtomicU64,
    /// Flushes driven by reminder expiry
    pub expiry_flushes: AtomicU64,
    /// Flushes requested explicitly
    pub manual_flushes: AtomicU64,
    /// Flushes that failed for transport or storage reasons
    pub flush_failures: AtomicU64,
    /// Expired reminders whose state was already gone
    pub consistency_violations: AtomicU64,
    /// Expiration events for keys that are not reminders
    pub ignored_expirations: AtomicU64,
    /// Bytes saved to persistent storage
    pub bytes_flushed: AtomicU64,
    /// Last flush timestamp (Unix millis)
    pub last_flush_ms: AtomicU64,
}

impl WriteBackMetrics {
    /// Create new zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a write of `actions` actions
    #[inline]
    pub fn record_write(&self, actions: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.actions_applied.fetch_add(actions, Ordering::Relaxed);
    }

    /// Record a successful flush
    pub fn record_flush(&self, trigger: FlushTrigger, size_bytes: u64) {
        let counter = match trigger {
            FlushTrigger::Threshold => &self.threshold_flushes,
            FlushTrigger::Expiry => &self.expiry_flushes,
            FlushTrigger::Manual => &self.manual_flushes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_flushed.fetch_add(size_bytes, Ordering::Relaxed);
        self.last_flush_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
    }

    /// Record a failed flush
    #[inline]
    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an expired reminder with missing state
    #[inline]
    pub fn record_consistency_violation(&self) {
        self.consistency_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an expiration event that was not a reminder
    #[inline]
    pub fn record_ignored_expiration(&self) {
        self.ignored_expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot
    pub fn snapshot(&self) -> WriteBackStatsSnapshot {
        WriteBackStatsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            actions_applied: self.actions_applied.load(Ordering::Relaxed),
            threshold_flushes: self.threshold_flushes.load(Ordering::Relaxed),
            expiry_flushes: self.expiry_flushes.load(Ordering::Relaxed),
            manual_flushes: self.manual_flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            consistency_violations: self.consistency_violations.load(Ordering::Relaxed),
            ignored_expirations: self.ignored_expirations.load(Ordering::Relaxed),
            bytes_flushed: self.bytes_flushed.load(Ordering::Relaxed),
            last_flush_ms: self.last_flush_ms.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of write-back statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBackStatsSnapshot {
    pub writes: u64,
    pub actions_applied: u64,
    pub threshold_flushes: u64,
    pub expiry_flushes: u64,
    pub manual_flushes: u64,
    pub flush_failures: u64,
    pub consistency_violations: u64,
    pub ignored_expirations: u64,
    pub bytes_flushed: u64,
    pub last_flush_ms: u64,
}

impl WriteBackStatsSnapshot {
    /// Successful flushes of any trigger
    pub fn total_flushes(&self) -> u64 {
        self.threshold_flushes + self.expiry_flushes + self.manual_flushes
    }

    /// Average actions folded into each flush
    pub fn actions_per_flush(&self) -> f64 {
        let flushes = self.total_flushes();
        if flushes == 0 {
            0.0
        } else {
            self.actions_applied as f64 / flushes as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_counters() {
        let metrics = WriteBackMetrics::new();
        metrics.record_write(4);
        metrics.record_write(6);
        metrics.record_flush(FlushTrigger::Threshold, 100);
        metrics.record_flush(FlushTrigger::Expiry, 50);
        metrics.record_flush_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.writes, 2);
        assert_eq!(snapshot.actions_applied, 10);
        assert_eq!(snapshot.threshold_flushes, 1);
        assert_eq!(snapshot.expiry_flushes, 1);
        assert_eq!(snapshot.flush_failures, 1);
        assert_eq!(snapshot.bytes_flushed, 150);
        assert_eq!(snapshot.total_flushes(), 2);
        assert!((snapshot.actions_per_flush() - 5.0).abs() < f64::EPSILON);
        assert!(snapshot.last_flush_ms > 0);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = WriteBackMetrics::new().snapshot();
        assert_eq!(snapshot, WriteBackStatsSnapshot::default());
        assert_eq!(snapshot.actions_per_flush(), 0.0);
    }
}
