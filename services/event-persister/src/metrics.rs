//! Runner counters
//!
//! One `PersisterMetrics` per runner, shared between the poll loop and the
//! sink writer. Counters are monotonic; `export` gives a sorted snapshot for
//! scraping or assertions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PersisterMetrics {
    pub records_polled: AtomicU64,
    pub events_decoded: AtomicU64,
    pub records_skipped: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub events_written: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_attempts: AtomicU64,
    pub flush_failures: AtomicU64,
    pub offsets_committed: AtomicU64,
    pub commit_failures: AtomicU64,
    pub rebalances: AtomicU64,
}

impl PersisterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_polled(&self) {
        self.records_polled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self) {
        self.events_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_attempt(&self) {
        self.flush_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// A batch of `events` was durably written.
    pub fn record_flush(&self, events: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.events_written.fetch_add(events, Ordering::Relaxed);
    }

    /// A flush exhausted its attempts.
    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.offsets_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebalance(&self) {
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }

    /// Export all counters as a sorted map.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters = [
            ("records_polled", &self.records_polled),
            ("events_decoded", &self.events_decoded),
            ("records_skipped", &self.records_skipped),
            ("duplicates_dropped", &self.duplicates_dropped),
            ("events_written", &self.events_written),
            ("flushes", &self.flushes),
            ("flush_attempts", &self.flush_attempts),
            ("flush_failures", &self.flush_failures),
            ("offsets_committed", &self.offsets_committed),
            ("commit_failures", &self.commit_failures),
            ("rebalances", &self.rebalances),
        ];

        counters
            .into_iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect()
    }
}
