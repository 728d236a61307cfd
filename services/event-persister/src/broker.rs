//! Stream broker capability
//!
//! The runner never speaks the broker protocol itself. It drives a
//! `BrokerClient` that owns partition assignment, fetching and offset
//! storage. Rebalance notifications are delivered in-band through `poll`,
//! so a revocation is always handled by the poll loop before the next fetch.

use std::time::Duration;

use async_trait::async_trait;

use crate::events::{Offset, Partition, RawRecord};

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    /// Records fetched from assigned partitions, in partition order.
    /// Empty when the poll timed out.
    Records(Vec<RawRecord>),
    /// Partitions newly assigned to this consumer.
    Assigned(Vec<Partition>),
    /// Partitions about to be taken away. Buffered work for them must be
    /// flushed and committed before the next poll.
    Revoked(Vec<Partition>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("poll failed: {0}")]
    Poll(String),

    #[error("commit of offset {offset} on partition {partition} failed: {reason}")]
    Commit {
        partition: Partition,
        offset: Offset,
        reason: String,
    },

    #[error("broker connection closed")]
    Closed,
}

impl BrokerError {
    /// Whether the poll loop may keep going after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Poll(_) | BrokerError::Commit { .. })
    }
}

/// Consumer-group client for one topic.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Join `group` and subscribe to `topic`. Assignment arrives later as
    /// `PollEvent::Assigned`.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for records or a rebalance notification.
    async fn poll(&self, timeout: Duration) -> Result<PollEvent, BrokerError>;

    /// Record `offset` as the last durably processed record of `partition`.
    async fn commit_offset(&self, partition: Partition, offset: Offset) -> Result<(), BrokerError>;

    /// Stop fetching from `partitions` without giving them up.
    async fn pause(&self, partitions: &[Partition]) -> Result<(), BrokerError>;

    async fn resume(&self, partitions: &[Partition]) -> Result<(), BrokerError>;
}
