//! In-memory broker and store
//!
//! `MemoryBroker` behaves like a single-member consumer group over one
//! topic: it delivers rebalance notifications in-band, honours pause/resume,
//! and rewinds to the last committed offset whenever a partition is
//! (re)assigned, so uncommitted records are redelivered. `MemoryStore`
//! upserts rows by event_id, like the production time-series table.
//!
//! Both expose failure-injection hooks for exercising the retry and
//! shutdown paths.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{BrokerClient, BrokerError, PollEvent};
use crate::events::{DomainEvent, Offset, Partition, RawRecord};
use crate::sink::{StorageClient, StorageError};

/// A broker call observed by `MemoryBroker`, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Subscribe { topic: String, group: String },
    /// A poll that delivered `records` records
    Fetch { records: usize },
    Commit { partition: Partition, offset: Offset },
    Pause(Vec<Partition>),
    Resume(Vec<Partition>),
}

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<RawRecord>,
    /// Index of the next record to deliver
    position: usize,
    committed: Option<Offset>,
    delivered: Option<Offset>,
}

impl PartitionLog {
    /// Rewind to the first record after the committed offset.
    fn rewind(&mut self) {
        let committed = self.committed;
        self.position = self
            .records
            .iter()
            .position(|r| Some(r.offset) > committed)
            .unwrap_or(self.records.len());
    }
}

#[derive(Debug)]
struct BrokerState {
    partitions: BTreeMap<Partition, PartitionLog>,
    assigned: BTreeSet<Partition>,
    paused: BTreeSet<Partition>,
    notifications: VecDeque<PollEvent>,
    max_poll_records: usize,
    subscribe_failure: Option<String>,
    commit_failure: Option<String>,
    closed: bool,
    calls: Vec<BrokerCall>,
}

impl BrokerState {
    fn apply(&mut self, event: &PollEvent) {
        match event {
            PollEvent::Assigned(partitions) => {
                for &p in partitions {
                    self.assigned.insert(p);
                    self.paused.remove(&p);
                    self.partitions.entry(p).or_default().rewind();
                }
            }
            PollEvent::Revoked(partitions) => {
                for p in partitions {
                    self.assigned.remove(p);
                    self.paused.remove(p);
                }
            }
            PollEvent::Records(_) => {}
        }
    }

    fn fetch(&mut self) -> Vec<RawRecord> {
        let mut fetched = Vec::new();
        for (partition, log) in self.partitions.iter_mut() {
            if !self.assigned.contains(partition) || self.paused.contains(partition) {
                continue;
            }
            while fetched.len() < self.max_poll_records && log.position < log.records.len() {
                let record = log.records[log.position].clone();
                log.position += 1;
                log.delivered = Some(record.offset);
                fetched.push(record);
            }
        }
        fetched
    }
}

/// Single-topic, single-member consumer group held in memory.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl MemoryBroker {
    /// A topic with the given partitions, all assigned on subscribe.
    pub fn new(partitions: impl IntoIterator<Item = Partition>) -> Self {
        let partitions = partitions
            .into_iter()
            .map(|p| (p, PartitionLog::default()))
            .collect();

        Self {
            state: Mutex::new(BrokerState {
                partitions,
                assigned: BTreeSet::new(),
                paused: BTreeSet::new(),
                notifications: VecDeque::new(),
                max_poll_records: 500,
                subscribe_failure: None,
                commit_failure: None,
                closed: false,
                calls: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Cap the number of records returned by one poll.
    pub fn with_max_poll_records(self, max: usize) -> Self {
        self.state.lock().max_poll_records = max.max(1);
        self
    }

    /// Append a record to its partition log.
    pub fn push(&self, record: RawRecord) {
        self.state
            .lock()
            .partitions
            .entry(record.partition)
            .or_default()
            .records
            .push(record);
        self.notify.notify_one();
    }

    /// Append a record with the given offset and payload.
    pub fn produce(&self, partition: Partition, offset: Offset, value: impl Into<Bytes>) {
        self.push(RawRecord::new(partition, offset, value));
    }

    /// Queue a revocation; delivered ahead of any further records.
    pub fn revoke(&self, partitions: &[Partition]) {
        self.state
            .lock()
            .notifications
            .push_back(PollEvent::Revoked(partitions.to_vec()));
        self.notify.notify_one();
    }

    /// Queue an assignment; delivered ahead of any further records.
    pub fn assign(&self, partitions: &[Partition]) {
        self.state
            .lock()
            .notifications
            .push_back(PollEvent::Assigned(partitions.to_vec()));
        self.notify.notify_one();
    }

    pub fn fail_subscribe(&self, reason: impl Into<String>) {
        self.state.lock().subscribe_failure = Some(reason.into());
    }

    /// Make offset commits fail (`Some`) or succeed again (`None`).
    pub fn fail_commits(&self, reason: Option<&str>) {
        self.state.lock().commit_failure = reason.map(str::to_string);
    }

    /// Simulate a lost connection: every further poll fails.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn committed(&self, partition: Partition) -> Option<Offset> {
        self.state
            .lock()
            .partitions
            .get(&partition)
            .and_then(|log| log.committed)
    }

    /// Highest offset delivered to the consumer on `partition`.
    pub fn delivered(&self, partition: Partition) -> Option<Offset> {
        self.state
            .lock()
            .partitions
            .get(&partition)
            .and_then(|log| log.delivered)
    }

    pub fn is_paused(&self, partition: Partition) -> bool {
        self.state.lock().paused.contains(&partition)
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.state.lock().calls.clone()
    }

    pub fn commits(&self) -> Vec<(Partition, Offset)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Commit { partition, offset } => Some((*partition, *offset)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn subscribe(&self, topic: &str, group: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.subscribe_failure.clone() {
            return Err(BrokerError::Subscribe {
                topic: topic.to_string(),
                reason,
            });
        }

        state.calls.push(BrokerCall::Subscribe {
            topic: topic.to_string(),
            group: group.to_string(),
        });
        // A fresh member starts from the committed offsets
        state.assigned.clear();
        state.paused.clear();
        state.notifications.clear();
        let all: Vec<Partition> = state.partitions.keys().copied().collect();
        state.notifications.push_back(PollEvent::Assigned(all));
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<PollEvent, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(BrokerError::Closed);
                }
                if let Some(event) = state.notifications.pop_front() {
                    state.apply(&event);
                    return Ok(event);
                }
                let records = state.fetch();
                if !records.is_empty() {
                    state.calls.push(BrokerCall::Fetch {
                        records: records.len(),
                    });
                    return Ok(PollEvent::Records(records));
                }
            }

            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(PollEvent::Records(Vec::new()));
            }
        }
    }

    async fn commit_offset(&self, partition: Partition, offset: Offset) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.commit_failure.clone() {
            return Err(BrokerError::Commit {
                partition,
                offset,
                reason,
            });
        }
        state.partitions.entry(partition).or_default().committed = Some(offset);
        state.calls.push(BrokerCall::Commit { partition, offset });
        Ok(())
    }

    async fn pause(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.paused.extend(partitions.iter().copied());
        state.calls.push(BrokerCall::Pause(partitions.to_vec()));
        Ok(())
    }

    async fn resume(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        for p in partitions {
            state.paused.remove(p);
        }
        state.calls.push(BrokerCall::Resume(partitions.to_vec()));
        drop(state);
        self.notify.notify_one();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreState {
    rows: BTreeMap<String, DomainEvent>,
    /// Sizes of successful writes, in order
    batches: Vec<usize>,
    attempts: u64,
    failures_left: u32,
    latency: Duration,
}

/// Time-series table held in memory, keyed by event_id.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes with `StorageError::Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures_left = count;
    }

    /// Delay every write by `latency` before it is applied.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn rows(&self) -> Vec<DomainEvent> {
        self.state.lock().rows.values().cloned().collect()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.state.lock().rows.contains_key(event_id)
    }

    pub fn batches(&self) -> Vec<usize> {
        self.state.lock().batches.clone()
    }

    pub fn write_attempts(&self) -> u64 {
        self.state.lock().attempts
    }
}

#[async_trait]
impl StorageClient for MemoryStore {
    async fn write_batch(&self, events: &[DomainEvent]) -> Result<(), StorageError> {
        let latency = {
            let mut state = self.state.lock();
            state.attempts += 1;
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(StorageError::Unavailable("injected failure".to_string()));
            }
            state.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        for event in events {
            state.rows.insert(event.event_id().to_string(), event.clone());
        }
        state.batches.push(events.len());
        Ok(())
    }
}
