//! Consumer runner: the poll loop for one event stream
//!
//! A runner subscribes to one topic and drives
//! poll → decode → buffer → flush → commit on its own tokio task.
//!
//! Delivery is at-least-once:
//! - offsets are handed to the broker only after the sink confirmed the
//!   batch covering them
//! - a failed flush pauses the assigned partitions and retries the same
//!   batch; nothing is fetched ahead while the sink is down
//! - a revocation flushes and commits buffered work before the partition
//!   state is dropped
//!
//! State machine:
//!
//! ```text
//! Stopped → Starting → Subscribed → Running ⇄ Rebalancing
//!                                      │
//!                                  Draining → Stopped
//!                                      │
//!                                   Failed (fatal error in the loop)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, BrokerError, PollEvent};
use crate::codec::{codec_for, EventCodec};
use crate::config::{PersisterConfig, RunnerConfig, SinkConfig};
use crate::events::{Partition, RawRecord, StreamKind};
use crate::lifecycle::{Consumer, Subscribe};
use crate::metrics::PersisterMetrics;
use crate::offsets::{OffsetError, OffsetTracker};
use crate::sink::{SinkError, SinkWriter, StorageClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerState {
    Stopped,
    Starting,
    Subscribed,
    Running,
    /// Handling an assignment or revocation inside `Running`
    Rebalancing,
    Draining,
    /// The poll loop exited on a fatal error; `stop` reports it
    Failed,
}

impl RunnerState {
    pub fn label(&self) -> &'static str {
        match self {
            RunnerState::Stopped => "stopped",
            RunnerState::Starting => "starting",
            RunnerState::Subscribed => "subscribed",
            RunnerState::Running => "running",
            RunnerState::Rebalancing => "rebalancing",
            RunnerState::Draining => "draining",
            RunnerState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    #[error("subscription failed: {0}")]
    Subscription(BrokerError),

    #[error("offset invariant violated: {0}")]
    OffsetInvariant(#[from] OffsetError),

    #[error("sink flush abandoned after {rounds} rounds: {source}")]
    SinkFlush { rounds: u32, source: SinkError },

    #[error("broker failure: {0}")]
    Broker(BrokerError),

    #[error("{runner} did not drain before the shutdown deadline; uncommitted records will be redelivered")]
    ShutdownTimeout { runner: String },

    #[error("{0} is already started")]
    AlreadyStarted(String),

    #[error("runner task failed: {0}")]
    TaskPanicked(String),
}

fn transition(state: &watch::Sender<RunnerState>, runner: &str, next: RunnerState) {
    let prev = state.send_replace(next);
    if prev != next {
        debug!(runner, from = prev.label(), to = next.label(), "Runner state transition");
    }
}

struct RunnerTask {
    token: CancellationToken,
    handle: JoinHandle<Result<(), RunnerError>>,
}

/// Consumer for one event stream (orders or matches).
pub struct ConsumerRunner {
    name: String,
    stream: StreamKind,
    topic: String,
    group: String,
    runner_config: RunnerConfig,
    sink_config: SinkConfig,
    broker: Arc<dyn BrokerClient>,
    storage: Arc<dyn StorageClient>,
    metrics: Arc<PersisterMetrics>,
    state: Arc<watch::Sender<RunnerState>>,
    task: Option<RunnerTask>,
}

impl ConsumerRunner {
    pub fn new(
        stream: StreamKind,
        config: &PersisterConfig,
        broker: Arc<dyn BrokerClient>,
        storage: Arc<dyn StorageClient>,
    ) -> Self {
        let (state, _) = watch::channel(RunnerState::Stopped);
        let name = format!("{}-consumer", stream.label());
        let topic = config.topic_for(stream).to_string();

        info!(
            runner = %name,
            topic = %topic,
            group = %config.broker.group_id,
            "ConsumerRunner created"
        );

        Self {
            name,
            stream,
            topic,
            group: config.broker.group_id.clone(),
            runner_config: config.runner.clone(),
            sink_config: config.sink.clone(),
            broker,
            storage,
            metrics: Arc::new(PersisterMetrics::new()),
            state: Arc::new(state),
            task: None,
        }
    }

    /// Runner for the orders stream.
    pub fn orders(
        config: &PersisterConfig,
        broker: Arc<dyn BrokerClient>,
        storage: Arc<dyn StorageClient>,
    ) -> Self {
        Self::new(StreamKind::Orders, config, broker, storage)
    }

    /// Runner for the matches stream.
    pub fn matches(
        config: &PersisterConfig,
        broker: Arc<dyn BrokerClient>,
        storage: Arc<dyn StorageClient>,
    ) -> Self {
        Self::new(StreamKind::Matches, config, broker, storage)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> Arc<PersisterMetrics> {
        self.metrics.clone()
    }

    /// Join the consumer group for this runner's topic.
    pub async fn subscribe(&mut self) -> Result<(), RunnerError> {
        match self.state() {
            RunnerState::Subscribed => return Ok(()),
            RunnerState::Stopped => {}
            _ => return Err(RunnerError::AlreadyStarted(self.name.clone())),
        }

        transition(&self.state, &self.name, RunnerState::Starting);
        if let Err(err) = self.broker.subscribe(&self.topic, &self.group).await {
            transition(&self.state, &self.name, RunnerState::Stopped);
            error!(runner = %self.name, topic = %self.topic, error = %err, "Subscription failed");
            return Err(RunnerError::Subscription(err));
        }

        transition(&self.state, &self.name, RunnerState::Subscribed);
        info!(runner = %self.name, topic = %self.topic, group = %self.group, "Subscribed");
        Ok(())
    }

    /// Subscribe if needed and spawn the poll loop.
    ///
    /// Returns once the subscription is confirmed; the loop keeps running
    /// until `stop` is called or `ctx` is cancelled.
    pub async fn start(&mut self, ctx: &CancellationToken) -> Result<(), RunnerError> {
        if self.task.is_some() {
            return Err(RunnerError::AlreadyStarted(self.name.clone()));
        }
        self.subscribe().await?;

        let token = ctx.child_token();
        let poll_loop = PollLoop {
            name: self.name.clone(),
            config: self.runner_config.clone(),
            broker: self.broker.clone(),
            codec: codec_for(self.stream),
            sink: SinkWriter::new(
                self.stream,
                self.storage.clone(),
                self.sink_config.clone(),
                self.metrics.clone(),
            ),
            tracker: OffsetTracker::new(),
            metrics: self.metrics.clone(),
            state: self.state.clone(),
        };

        transition(&self.state, &self.name, RunnerState::Running);
        let handle = tokio::spawn(poll_loop.run(token.clone()));
        self.task = Some(RunnerTask { token, handle });

        info!(runner = %self.name, "Runner started");
        Ok(())
    }

    /// Stop fetching, drain the buffered batch and commit what was flushed.
    ///
    /// If the loop has not finished by `deadline` it is abandoned and
    /// `ShutdownTimeout` is returned; nothing unflushed is committed.
    pub async fn stop(&mut self, deadline: Instant) -> Result<(), RunnerError> {
        let Some(task) = self.task.take() else {
            transition(&self.state, &self.name, RunnerState::Stopped);
            return Ok(());
        };

        info!(runner = %self.name, "Stopping runner");
        task.token.cancel();

        let mut handle = task.handle;
        let joined = tokio::time::timeout_at(deadline, &mut handle).await;
        let result = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(RunnerError::TaskPanicked(join_err.to_string())),
            Err(_) => {
                handle.abort();
                let _ = handle.await;
                error!(runner = %self.name, "Shutdown deadline exceeded; in-flight work abandoned");
                Err(RunnerError::ShutdownTimeout {
                    runner: self.name.clone(),
                })
            }
        };

        transition(&self.state, &self.name, RunnerState::Stopped);
        match &result {
            Ok(()) => info!(runner = %self.name, "Runner stopped"),
            Err(err) => warn!(runner = %self.name, error = %err, "Runner stopped with error"),
        }
        result
    }
}

#[async_trait]
impl Consumer for ConsumerRunner {
    fn name(&self) -> &str {
        ConsumerRunner::name(self)
    }

    fn state(&self) -> RunnerState {
        ConsumerRunner::state(self)
    }

    fn watch_state(&self) -> watch::Receiver<RunnerState> {
        ConsumerRunner::watch_state(self)
    }

    async fn start(&mut self, ctx: &CancellationToken) -> Result<(), RunnerError> {
        ConsumerRunner::start(self, ctx).await
    }

    async fn stop(&mut self, deadline: Instant) -> Result<(), RunnerError> {
        ConsumerRunner::stop(self, deadline).await
    }
}

#[async_trait]
impl Subscribe for ConsumerRunner {
    async fn subscribe(&mut self) -> Result<(), RunnerError> {
        ConsumerRunner::subscribe(self).await
    }
}

/// How a flush-and-commit cycle ended.
enum Cycle {
    Committed,
    /// Cancelled while waiting for the sink to recover
    Interrupted,
}

/// State owned by the spawned task. Nothing else touches the tracker or
/// the batch while the loop runs.
struct PollLoop {
    name: String,
    config: RunnerConfig,
    broker: Arc<dyn BrokerClient>,
    codec: Box<dyn EventCodec>,
    sink: SinkWriter,
    tracker: OffsetTracker,
    metrics: Arc<PersisterMetrics>,
    state: Arc<watch::Sender<RunnerState>>,
}

impl PollLoop {
    async fn run(mut self, token: CancellationToken) -> Result<(), RunnerError> {
        debug!(runner = %self.name, "Poll loop started");

        let result = match self.consume(&token).await {
            Ok(()) => self.drain().await,
            Err(err) => Err(err),
        };
        self.tracker.clear();

        match &result {
            Ok(()) => {
                self.set_state(RunnerState::Stopped);
                info!(runner = %self.name, metrics = ?self.metrics.export(), "Poll loop finished");
            }
            Err(err) => {
                self.set_state(RunnerState::Failed);
                error!(
                    runner = %self.name,
                    error = %err,
                    buffered = self.sink.len(),
                    "Poll loop terminated"
                );
            }
        }
        result
    }

    fn set_state(&self, next: RunnerState) {
        transition(&self.state, &self.name, next);
    }

    /// Poll until cancelled or a fatal error.
    async fn consume(&mut self, token: &CancellationToken) -> Result<(), RunnerError> {
        let mut poll_failures = 0u32;

        loop {
            let polled = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                polled = self.broker.poll(self.config.poll_timeout()) => polled,
            };

            match polled {
                Ok(PollEvent::Records(records)) => {
                    poll_failures = 0;
                    self.process(records)?;
                }
                Ok(PollEvent::Assigned(partitions)) => {
                    poll_failures = 0;
                    self.on_assigned(&partitions);
                }
                Ok(PollEvent::Revoked(partitions)) => {
                    poll_failures = 0;
                    if let Cycle::Interrupted = self.on_revoked(&partitions, token).await? {
                        return Ok(());
                    }
                }
                Err(err) if err.is_retryable() => {
                    poll_failures += 1;
                    if poll_failures >= self.config.max_poll_failures {
                        return Err(RunnerError::Broker(err));
                    }
                    warn!(
                        runner = %self.name,
                        error = %err,
                        poll_failures,
                        "Poll failed; backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.poll_backoff()) => {}
                    }
                    continue;
                }
                Err(err) => return Err(RunnerError::Broker(err)),
            }

            // Progress with nothing buffered (skipped records, a commit the
            // broker did not acknowledge) still needs a commit
            let due = self.sink.should_flush(Instant::now())
                || (self.sink.is_empty() && self.tracker.has_uncommitted());
            if due {
                if let Cycle::Interrupted = self.flush_and_commit(token).await? {
                    return Ok(());
                }
            }
        }
    }

    fn process(&mut self, records: Vec<RawRecord>) -> Result<(), RunnerError> {
        for record in records {
            self.metrics.record_polled();
            if !self.tracker.owns(record.partition) {
                warn!(
                    runner = %self.name,
                    partition = record.partition,
                    offset = record.offset,
                    "Dropping record for a partition not assigned to this consumer"
                );
                continue;
            }
            self.tracker.advance(record.partition, record.offset)?;

            match self.codec.decode(&record) {
                Ok(event) => {
                    self.metrics.record_decoded();
                    if !self.sink.append(event) {
                        debug!(
                            runner = %self.name,
                            partition = record.partition,
                            offset = record.offset,
                            "Duplicate event_id in batch dropped"
                        );
                    }
                }
                Err(err) => {
                    self.metrics.record_skipped();
                    warn!(
                        runner = %self.name,
                        partition = record.partition,
                        offset = record.offset,
                        kind = err.kind(),
                        error = %err,
                        "Skipping malformed record"
                    );
                }
            }
        }
        Ok(())
    }

    fn on_assigned(&mut self, partitions: &[Partition]) {
        self.set_state(RunnerState::Rebalancing);
        self.metrics.record_rebalance();
        for &partition in partitions {
            self.tracker.assign(partition);
        }
        info!(runner = %self.name, ?partitions, "Partitions assigned");
        self.set_state(RunnerState::Running);
    }

    /// Flush and commit everything buffered before giving partitions up.
    async fn on_revoked(
        &mut self,
        partitions: &[Partition],
        token: &CancellationToken,
    ) -> Result<Cycle, RunnerError> {
        self.set_state(RunnerState::Rebalancing);
        self.metrics.record_rebalance();
        info!(
            runner = %self.name,
            ?partitions,
            buffered = self.sink.len(),
            "Partitions revoked; flushing before release"
        );

        let cycle = self.flush_and_commit(token).await?;
        if let Cycle::Committed = cycle {
            for &partition in partitions {
                self.tracker.reset(partition);
            }
            self.set_state(RunnerState::Running);
        }
        Ok(cycle)
    }

    /// Flush the batch, retrying in recovery rounds while the sink is down,
    /// then commit every partition the flush covered.
    async fn flush_and_commit(&mut self, token: &CancellationToken) -> Result<Cycle, RunnerError> {
        let mut rounds = 0u32;
        let mut paused: Vec<Partition> = Vec::new();

        loop {
            let flushed = self.sink.flush().await;
            let err = match flushed {
                Ok(_) => break,
                Err(err) => err,
            };

            rounds += 1;
            if rounds >= self.config.max_recovery_rounds {
                return Err(RunnerError::SinkFlush {
                    rounds,
                    source: err,
                });
            }

            if paused.is_empty() {
                paused = self.tracker.partitions();
                if let Err(pause_err) = self.broker.pause(&paused).await {
                    warn!(runner = %self.name, error = %pause_err, "Failed to pause partitions");
                }
                warn!(
                    runner = %self.name,
                    partitions = ?paused,
                    buffered = self.sink.len(),
                    "Sink unavailable; polling paused until the batch is persisted"
                );
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(Cycle::Interrupted),
                _ = tokio::time::sleep(self.config.recovery_interval()) => {}
            }
            info!(runner = %self.name, round = rounds + 1, "Retrying flush");
        }

        if !paused.is_empty() {
            if let Err(err) = self.broker.resume(&paused).await {
                warn!(runner = %self.name, error = %err, "Failed to resume partitions");
            }
            info!(runner = %self.name, partitions = ?paused, "Sink recovered; partitions resumed");
        }

        self.commit_offsets().await?;
        Ok(Cycle::Committed)
    }

    async fn commit_offsets(&mut self) -> Result<(), RunnerError> {
        for partition in self.tracker.committable() {
            let previous = self.tracker.state(partition).and_then(|s| s.committed);
            let Some(offset) = self.tracker.commit(partition)? else {
                continue;
            };

            match self.broker.commit_offset(partition, offset).await {
                Ok(()) => {
                    self.metrics.record_commit();
                    debug!(runner = %self.name, partition, offset, "Offset committed");
                }
                Err(err) if err.is_retryable() => {
                    self.metrics.record_commit_failure();
                    self.tracker.rollback(partition, previous)?;
                    warn!(
                        runner = %self.name,
                        partition,
                        offset,
                        error = %err,
                        "Broker commit failed; offset will be sent again on the next commit"
                    );
                }
                Err(err) => return Err(RunnerError::Broker(err)),
            }
        }
        Ok(())
    }

    /// Final flush and commit, bounded by the drain timeout.
    async fn drain(&mut self) -> Result<(), RunnerError> {
        self.set_state(RunnerState::Draining);
        info!(runner = %self.name, buffered = self.sink.len(), "Draining");

        let limit = self.config.drain_timeout();
        let drained = tokio::time::timeout(limit, self.final_flush()).await;
        match drained {
            Ok(result) => result,
            Err(_) => {
                error!(runner = %self.name, buffered = self.sink.len(), "Drain timed out");
                Err(RunnerError::ShutdownTimeout {
                    runner: self.name.clone(),
                })
            }
        }
    }

    async fn final_flush(&mut self) -> Result<(), RunnerError> {
        self.sink
            .flush()
            .await
            .map_err(|source| RunnerError::SinkFlush { rounds: 1, source })?;
        self.commit_offsets().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, MemoryStore};
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscription_failure_returns_to_stopped() {
        let broker = Arc::new(MemoryBroker::new([0]));
        broker.fail_subscribe("group coordinator unavailable");
        let store = Arc::new(MemoryStore::new());

        let mut runner = ConsumerRunner::orders(&PersisterConfig::default(), broker, store);
        let err = runner.start(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, RunnerError::Subscription(BrokerError::Subscribe { .. })));
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let broker = Arc::new(MemoryBroker::new([0]));
        let store = Arc::new(MemoryStore::new());
        let mut runner = ConsumerRunner::matches(&PersisterConfig::default(), broker, store);
        let ctx = CancellationToken::new();

        runner.start(&ctx).await.unwrap();
        assert_eq!(runner.state(), RunnerState::Running);
        assert!(matches!(
            runner.start(&ctx).await,
            Err(RunnerError::AlreadyStarted(_))
        ));

        runner
            .stop(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let broker = Arc::new(MemoryBroker::new([0]));
        let store = Arc::new(MemoryStore::new());
        let mut runner = ConsumerRunner::orders(&PersisterConfig::default(), broker, store);

        runner.subscribe().await.unwrap();
        assert_eq!(runner.state(), RunnerState::Subscribed);
        runner.stop(Instant::now()).await.unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    #[tokio::test]
    async fn test_runner_names_follow_stream() {
        let config = PersisterConfig::default();
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let orders =
            ConsumerRunner::orders(&config, Arc::new(MemoryBroker::new([0])), store.clone());
        let matches = ConsumerRunner::matches(&config, Arc::new(MemoryBroker::new([0])), store);

        assert_eq!(orders.name(), "orders-consumer");
        assert_eq!(orders.topic(), "orders");
        assert_eq!(matches.stream(), StreamKind::Matches);
        assert_eq!(matches.topic(), "matches");
    }
}
