//! Internal failure and throughput counters.
//!
//! Persistence and delivery failures are never surfaced to unrelated
//! callers; they show up here and in the logs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared across hub components.
#[derive(Debug, Default)]
pub struct HubMetrics {
    /// Events accepted for processing.
    pub events_accepted: AtomicU64,

    /// Publishes acknowledged as duplicates (no-op).
    pub events_duplicate: AtomicU64,

    /// Events committed to the log.
    pub events_persisted: AtomicU64,

    /// Append attempts that were retried.
    pub persist_retries: AtomicU64,

    /// Events that exhausted their persist retry budget (recorded gaps).
    pub persist_failures: AtomicU64,

    /// Notifications pushed to subscriber channels.
    pub notifications_sent: AtomicU64,

    /// Pushes that failed (closed or full channel).
    pub delivery_failures: AtomicU64,

    /// Snapshots written by compaction.
    pub snapshots_created: AtomicU64,

    /// Log entries removed by retention pruning.
    pub events_pruned: AtomicU64,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read all counters at once.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_accepted: self.events_accepted.load(Ordering::Relaxed),
            events_duplicate: self.events_duplicate.load(Ordering::Relaxed),
            events_persisted: self.events_persisted.load(Ordering::Relaxed),
            persist_retries: self.persist_retries.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            snapshots_created: self.snapshots_created.load(Ordering::Relaxed),
            events_pruned: self.events_pruned.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the hub counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_accepted: u64,
    pub events_duplicate: u64,
    pub events_persisted: u64,
    pub persist_retries: u64,
    pub persist_failures: u64,
    pub notifications_sent: u64,
    pub delivery_failures: u64,
    pub snapshots_created: u64,
    pub events_pruned: u64,
}
