//! Organizer throughput metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct OrganizeMetrics {
    checked: AtomicU64,
    accepted: AtomicU64,
    connected: AtomicU64,
    committed: AtomicU64,
    pooled: AtomicU64,
    rejected: AtomicU64,
    validate_us: AtomicU64,
    commit_us: AtomicU64,
}

#[derive(Clone, Debug, Default)]
pub struct OrganizeMetricsSnapshot {
    pub checked: u64,
    pub accepted: u64,
    pub connected: u64,
    pub committed: u64,
    pub pooled: u64,
    pub rejected: u64,
    pub validate_us: u64,
    pub commit_us: u64,
}

impl OrganizeMetrics {
    pub fn record_checked(&self) {
        self.checked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connected(&self, elapsed: Duration) {
        self.connected.fetch_add(1, Ordering::Relaxed);
        self.validate_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_committed(&self, elapsed: Duration) {
        self.committed.fetch_add(1, Ordering::Relaxed);
        self.commit_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_pooled(&self) {
        self.pooled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OrganizeMetricsSnapshot {
        OrganizeMetricsSnapshot {
            checked: self.checked.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            pooled: self.pooled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            validate_us: self.validate_us.load(Ordering::Relaxed),
            commit_us: self.commit_us.load(Ordering::Relaxed),
        }
    }
}
