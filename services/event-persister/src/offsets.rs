//! Per-partition offset tracking
//!
//! Keeps two positions per assigned partition:
//! - `pending`: highest offset processed (decoded or skipped) but not yet
//!   covered by a confirmed flush
//! - `committed`: highest offset covered by a confirmed flush and handed to
//!   the broker
//!
//! `committed <= pending` holds at all times (`None` orders before any
//! offset). Pending offsets never move backwards; a regression means the
//! broker or the runner is broken, and the caller must stop.

use std::collections::BTreeMap;

use tracing::debug;

use crate::events::{Offset, Partition};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OffsetError {
    #[error("offset regression on partition {partition}: pending={pending}, received={received}")]
    Regression {
        partition: Partition,
        pending: Offset,
        received: Offset,
    },

    #[error("partition {0} is not tracked")]
    UnknownPartition(Partition),
}

/// Offset positions for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionState {
    pub partition: Partition,
    pub committed: Option<Offset>,
    pub pending: Option<Offset>,
}

impl PartitionState {
    fn new(partition: Partition) -> Self {
        Self {
            partition,
            committed: None,
            pending: None,
        }
    }

    /// Whether processed offsets are waiting for a commit.
    pub fn has_uncommitted(&self) -> bool {
        self.pending > self.committed
    }
}

/// Offset tracker for the partitions currently owned by one runner.
///
/// Uses BTreeMap so commits are issued in partition order.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: BTreeMap<Partition, PartitionState>,
    /// Set once the broker has announced an assignment
    assignment_seen: bool,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a newly assigned partition with fresh state. A
    /// partition that is already tracked keeps its offsets.
    pub fn assign(&mut self, partition: Partition) {
        self.assignment_seen = true;
        if self.partitions.contains_key(&partition) {
            debug!(partition, "Partition already tracked");
            return;
        }
        self.partitions.insert(partition, PartitionState::new(partition));
        debug!(partition, "Partition assigned");
    }

    /// Record that `offset` has been processed on `partition`.
    ///
    /// Re-processing the current pending offset is allowed (redelivery);
    /// anything lower is an invariant violation. A record for an untracked
    /// partition implicitly assigns it; callers check `owns` first.
    pub fn advance(&mut self, partition: Partition, offset: Offset) -> Result<(), OffsetError> {
        let state = self
            .partitions
            .entry(partition)
            .or_insert_with(|| PartitionState::new(partition));

        if let Some(pending) = state.pending {
            if offset < pending {
                return Err(OffsetError::Regression {
                    partition,
                    pending,
                    received: offset,
                });
            }
        }
        state.pending = Some(offset);
        Ok(())
    }

    /// Mark everything up to `pending` as committed.
    ///
    /// Only call after the sink has confirmed durability of all buffered
    /// events. Returns the offset to hand to the broker, or `None` when
    /// nothing new was processed since the last commit.
    pub fn commit(&mut self, partition: Partition) -> Result<Option<Offset>, OffsetError> {
        let state = self
            .partitions
            .get_mut(&partition)
            .ok_or(OffsetError::UnknownPartition(partition))?;

        if !state.has_uncommitted() {
            return Ok(None);
        }
        state.committed = state.pending;
        Ok(state.committed)
    }

    /// Undo a commit the broker did not acknowledge. The partition is listed
    /// by `committable` again until a later commit succeeds.
    pub fn rollback(
        &mut self,
        partition: Partition,
        committed: Option<Offset>,
    ) -> Result<(), OffsetError> {
        let state = self
            .partitions
            .get_mut(&partition)
            .ok_or(OffsetError::UnknownPartition(partition))?;

        state.committed = state.committed.min(committed);
        debug!(partition, committed = ?state.committed, "Commit rolled back");
        Ok(())
    }

    /// Drop state for a revoked partition.
    pub fn reset(&mut self, partition: Partition) -> Option<PartitionState> {
        let removed = self.partitions.remove(&partition);
        if let Some(state) = &removed {
            debug!(
                partition,
                committed = ?state.committed,
                pending = ?state.pending,
                "Partition state reset"
            );
        }
        removed
    }

    /// Drop all state (consumer stop).
    pub fn clear(&mut self) {
        self.partitions.clear();
        self.assignment_seen = false;
    }

    /// Whether records from `partition` belong to this consumer.
    ///
    /// Before any assignment every partition is accepted. Afterwards only
    /// tracked partitions are, so a late record for a revoked partition is
    /// not committed on behalf of its new owner.
    pub fn owns(&self, partition: Partition) -> bool {
        !self.assignment_seen || self.partitions.contains_key(&partition)
    }

    pub fn state(&self, partition: Partition) -> Option<PartitionState> {
        self.partitions.get(&partition).copied()
    }

    /// Partitions with processed-but-uncommitted offsets, in partition order.
    pub fn committable(&self) -> Vec<Partition> {
        self.partitions
            .values()
            .filter(|s| s.has_uncommitted())
            .map(|s| s.partition)
            .collect()
    }

    pub fn has_uncommitted(&self) -> bool {
        self.partitions.values().any(PartitionState::has_uncommitted)
    }

    /// All tracked partitions, in partition order.
    pub fn partitions(&self) -> Vec<Partition> {
        self.partitions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
