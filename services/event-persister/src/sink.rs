//! Sink writer: batching and durable writes to the time-series store
//!
//! Decoded events are buffered into a `Batch` owned by the writer. A flush
//! is due when the batch reaches `max_batch_size` or its oldest event is
//! older than `max_batch_age`. Flushing writes the whole batch through the
//! `StorageClient`, retrying with exponential backoff up to `max_attempts`.
//!
//! A failed flush keeps the batch intact: nothing is dropped, and the caller
//! must not commit offsets until a later flush succeeds.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SinkConfig;
use crate::events::{DomainEvent, StreamKind};
use crate::metrics::PersisterMetrics;

/// Errors reported by a storage client for one write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Batched writer into the time-series store.
///
/// Implementations must be idempotent per `event_id`: writing an event that
/// is already stored replaces it instead of adding a row. They are shared
/// between runners and must be safe for concurrent use.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn write_batch(&self, events: &[DomainEvent]) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("flush of {events} events failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        events: usize,
        attempts: u32,
        last_error: String,
    },
}

/// Result of a successful flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Events written (0 for an empty batch)
    pub events: usize,
    /// Write attempts used
    pub attempts: u32,
}

/// Events awaiting flush, in arrival order, unique by event_id.
#[derive(Debug, Default)]
pub struct Batch {
    events: Vec<DomainEvent>,
    ids: HashSet<String>,
    opened_at: Option<Instant>,
}

impl Batch {
    /// Add an event. Returns false if an event with the same id is
    /// already buffered.
    pub fn push(&mut self, event: DomainEvent, now: Instant) -> bool {
        if !self.ids.insert(event.event_id().to_string()) {
            return false;
        }
        self.opened_at.get_or_insert(now);
        self.events.push(event);
        true
    }

    /// Age of the oldest buffered event.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.opened_at.map(|t| now.saturating_duration_since(t))
    }

    pub fn events(&self) -> &[DomainEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn clear(&mut self) {
        self.events.clear();
        self.ids.clear();
        self.opened_at = None;
    }
}

/// Buffers events for one runner and flushes them to storage.
pub struct SinkWriter {
    stream: StreamKind,
    storage: Arc<dyn StorageClient>,
    config: SinkConfig,
    batch: Batch,
    metrics: Arc<PersisterMetrics>,
}

impl SinkWriter {
    pub fn new(
        stream: StreamKind,
        storage: Arc<dyn StorageClient>,
        config: SinkConfig,
        metrics: Arc<PersisterMetrics>,
    ) -> Self {
        debug!(
            stream = %stream,
            max_batch_size = config.max_batch_size,
            max_batch_age_ms = config.max_batch_age_ms,
            max_attempts = config.max_attempts,
            "SinkWriter initialized"
        );

        Self {
            stream,
            storage,
            config,
            batch: Batch::default(),
            metrics,
        }
    }

    /// Buffer an event. Duplicates of an already buffered event_id are
    /// dropped and reported with `false`.
    pub fn append(&mut self, event: DomainEvent) -> bool {
        let accepted = self.batch.push(event, Instant::now());
        if !accepted {
            self.metrics.record_duplicate();
        }
        accepted
    }

    /// Whether a size or age trigger has fired.
    pub fn should_flush(&self, now: Instant) -> bool {
        self.is_full() || self.is_expired(now)
    }

    pub fn is_full(&self) -> bool {
        self.batch.len() >= self.config.max_batch_size
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.batch
            .age(now)
            .is_some_and(|age| age >= self.config.max_batch_age())
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Write the buffered batch durably.
    ///
    /// Each attempt is bounded by `attempt_timeout`. On success the batch is
    /// discarded; on `RetriesExhausted` it stays buffered for the next call.
    pub async fn flush(&mut self) -> Result<FlushOutcome, SinkError> {
        if self.batch.is_empty() {
            return Ok(FlushOutcome {
                events: 0,
                attempts: 0,
            });
        }

        let events = self.batch.len();
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            self.metrics.record_flush_attempt();

            let write = self.storage.write_batch(self.batch.events());
            let result = tokio::time::timeout(self.config.attempt_timeout(), write).await;
            match result {
                Ok(Ok(())) => {
                    self.batch.clear();
                    self.metrics.record_flush(events as u64);
                    info!(stream = %self.stream, events, attempt, "Batch flushed");
                    return Ok(FlushOutcome {
                        events,
                        attempts: attempt,
                    });
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => {
                    last_error = format!(
                        "write timed out after {}ms",
                        self.config.attempt_timeout_ms
                    )
                }
            }

            warn!(
                stream = %self.stream,
                events,
                attempt,
                max_attempts = self.config.max_attempts,
                error = %last_error,
                "Flush attempt failed"
            );

            if attempt < self.config.max_attempts {
                tokio::time::sleep(backoff_delay(&self.config, attempt)).await;
            }
        }

        self.metrics.record_flush_failure();
        error!(
            stream = %self.stream,
            events,
            attempts = self.config.max_attempts,
            error = %last_error,
            "Flush retries exhausted; batch kept for recovery"
        );
        Err(SinkError::RetriesExhausted {
            events,
            attempts: self.config.max_attempts,
            last_error,
        })
    }
}

/// Delay after the given failed attempt (1-based): the initial backoff
/// doubled per attempt, capped at `max_backoff`.
pub fn backoff_delay(config: &SinkConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = config.initial_backoff().saturating_mul(1u32 << exponent);
    delay.min(config.max_backoff())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MatchEvent, Side};
    use crate::memory::MemoryStore;
    use rust_decimal::Decimal;

    fn make_event(id: &str) -> DomainEvent {
        DomainEvent::Match(MatchEvent {
            event_id: id.to_string(),
            symbol: "BTC/USDT".to_string(),
            timestamp: 1708123456789000000,
            match_id: format!("match-{}", id),
            maker_order_id: "maker".to_string(),
            taker_order_id: "taker".to_string(),
            side: Side::BUY,
            price: Decimal::from(50000),
            quantity: Decimal::ONE,
        })
    }

    fn config() -> SinkConfig {
        SinkConfig {
            max_batch_size: 3,
            max_batch_age_ms: 50,
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            attempt_timeout_ms: 100,
        }
    }

    fn writer(store: Arc<MemoryStore>) -> (SinkWriter, Arc<PersisterMetrics>) {
        let metrics = Arc::new(PersisterMetrics::new());
        let writer = SinkWriter::new(StreamKind::Matches, store, config(), metrics.clone());
        (writer, metrics)
    }

    #[test]
    fn test_backoff_schedule() {
        let config = config();
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(10));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(20));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(40));
        // Capped
        assert_eq!(backoff_delay(&config, 4), Duration::from_millis(40));
        assert_eq!(backoff_delay(&config, 100), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_event_ids_dropped_in_batch() {
        let store = Arc::new(MemoryStore::new());
        let (mut writer, metrics) = writer(store);

        assert!(writer.append(make_event("a")));
        assert!(!writer.append(make_event("a")));
        assert!(writer.append(make_event("b")));

        assert_eq!(writer.len(), 2);
        assert_eq!(metrics.export()["duplicates_dropped"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger() {
        let store = Arc::new(MemoryStore::new());
        let (mut writer, _) = writer(store);

        writer.append(make_event("a"));
        writer.append(make_event("b"));
        assert!(!writer.should_flush(Instant::now()));

        writer.append(make_event("c"));
        assert!(writer.is_full());
        assert!(writer.should_flush(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_trigger_measured_from_oldest_event() {
        let store = Arc::new(MemoryStore::new());
        let (mut writer, _) = writer(store);
        assert!(!writer.is_expired(Instant::now()));

        writer.append(make_event("a"));
        tokio::time::advance(Duration::from_millis(30)).await;
        writer.append(make_event("b"));
        assert!(!writer.should_flush(Instant::now()));

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(writer.is_expired(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_and_clears() {
        let store = Arc::new(MemoryStore::new());
        let (mut writer, metrics) = writer(store.clone());

        writer.append(make_event("a"));
        writer.append(make_event("b"));

        let outcome = writer.flush().await.unwrap();
        assert_eq!(outcome, FlushOutcome { events: 2, attempts: 1 });
        assert!(writer.is_empty());
        assert_eq!(writer.batch().age(Instant::now()), None);
        assert_eq!(store.row_count(), 2);
        assert_eq!(metrics.export()["events_written"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_flush_skips_storage() {
        let store = Arc::new(MemoryStore::new());
        let (mut writer, _) = writer(store.clone());

        let outcome = writer.flush().await.unwrap();
        assert_eq!(outcome.attempts, 0);
        assert_eq!(store.write_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_retries_then_succeeds() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(2);
        let (mut writer, metrics) = writer(store.clone());
        writer.append(make_event("a"));

        let started = Instant::now();
        let outcome = writer.flush().await.unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(store.write_attempts(), 3);
        assert_eq!(store.row_count(), 1);
        // 10ms + 20ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(metrics.export()["flush_attempts"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_keep_batch() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(5);
        let (mut writer, metrics) = writer(store.clone());
        writer.append(make_event("a"));
        writer.append(make_event("b"));

        match writer.flush().await.unwrap_err() {
            SinkError::RetriesExhausted { events, attempts, .. } => {
                assert_eq!(events, 2);
                assert_eq!(attempts, 3);
            }
        }
        assert_eq!(writer.len(), 2);
        assert_eq!(store.row_count(), 0);
        assert_eq!(metrics.export()["flush_failures"], 1);

        // Storage recovers; the same batch goes through
        let outcome = writer.flush().await.unwrap();
        assert_eq!(outcome.events, 2);
        assert_eq!(store.row_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_times_out() {
        let store = Arc::new(MemoryStore::new());
        store.set_latency(Duration::from_secs(1));
        let (mut writer, _) = writer(store.clone());
        writer.append(make_event("a"));

        let err = writer.flush().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(store.write_attempts(), 3);
        assert_eq!(store.row_count(), 0);
    }
}
