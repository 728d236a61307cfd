//! Lifecycle controller: start and stop a set of consumers as one unit
//!
//! Consumers are started concurrently. Stopping fans out to every consumer
//! and waits for all of them, even after one has failed, so every runner
//! gets to drain its buffered batch before the first error is returned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, select_all};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::BrokerClient;
use crate::config::PersisterConfig;
use crate::runner::{ConsumerRunner, RunnerError, RunnerState};
use crate::sink::StorageClient;

/// Start/stop capability shared by the order and match runners.
#[async_trait]
pub trait Consumer: Send {
    fn name(&self) -> &str;

    fn state(&self) -> RunnerState;

    fn watch_state(&self) -> watch::Receiver<RunnerState>;

    /// Begin consuming; returns once the subscription is confirmed.
    async fn start(&mut self, ctx: &CancellationToken) -> Result<(), RunnerError>;

    /// Drain and stop, giving up at `deadline`.
    async fn stop(&mut self, deadline: Instant) -> Result<(), RunnerError>;
}

/// Consumers that can join their group ahead of `start`.
#[async_trait]
pub trait Subscribe: Send {
    async fn subscribe(&mut self) -> Result<(), RunnerError>;
}

pub struct LifecycleController {
    consumers: Vec<Box<dyn Consumer>>,
    ctx: CancellationToken,
    drain_timeout: Duration,
}

impl LifecycleController {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            consumers: Vec::new(),
            ctx: CancellationToken::new(),
            drain_timeout,
        }
    }

    /// Orders and matches runners sharing one storage client.
    pub fn from_config(
        config: &PersisterConfig,
        orders_broker: Arc<dyn BrokerClient>,
        matches_broker: Arc<dyn BrokerClient>,
        storage: Arc<dyn StorageClient>,
    ) -> Self {
        Self::new(config.runner.drain_timeout())
            .with_consumer(ConsumerRunner::orders(config, orders_broker, storage.clone()))
            .with_consumer(ConsumerRunner::matches(config, matches_broker, storage))
    }

    pub fn with_consumer(mut self, consumer: impl Consumer + 'static) -> Self {
        self.add(Box::new(consumer));
        self
    }

    pub fn add(&mut self, consumer: Box<dyn Consumer>) {
        self.consumers.push(consumer);
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Cancelling this token makes every running consumer drain and stop.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.clone()
    }

    pub fn states(&self) -> Vec<(String, RunnerState)> {
        self.consumers
            .iter()
            .map(|c| (c.name().to_string(), c.state()))
            .collect()
    }

    /// Start every consumer concurrently.
    ///
    /// If any fails to start, the ones that did start are stopped again and
    /// the first error is returned.
    pub async fn start(&mut self) -> Result<(), RunnerError> {
        info!(consumers = self.consumers.len(), "Starting consumers");

        let ctx = &self.ctx;
        let results = join_all(self.consumers.iter_mut().map(|c| c.start(ctx))).await;

        let mut first_error = None;
        for (consumer, result) in self.consumers.iter().zip(results) {
            if let Err(err) = result {
                error!(consumer = consumer.name(), error = %err, "Consumer failed to start");
                first_error.get_or_insert(err);
            }
        }

        if let Some(err) = first_error {
            let deadline = Instant::now() + self.drain_timeout;
            if let Err(stop_err) = self.stop(deadline).await {
                warn!(error = %stop_err, "Rollback of started consumers reported an error");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Stop every consumer, waiting for all of them up to `deadline`.
    pub async fn stop(&mut self, deadline: Instant) -> Result<(), RunnerError> {
        info!(consumers = self.consumers.len(), "Stopping consumers");

        let results = join_all(self.consumers.iter_mut().map(|c| c.stop(deadline))).await;

        let mut first_error = None;
        for (consumer, result) in self.consumers.iter().zip(results) {
            match result {
                Ok(()) => info!(consumer = consumer.name(), "Consumer stopped"),
                Err(err) => {
                    error!(consumer = consumer.name(), error = %err, "Consumer stopped with error");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Start everything, run until `shutdown` resolves or a consumer fails,
    /// then stop everything within the drain timeout.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), RunnerError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;

        let watched = self
            .consumers
            .iter()
            .map(|c| (c.name().to_string(), c.watch_state()))
            .collect();

        tokio::select! {
            _ = shutdown => info!("Shutdown requested"),
            name = first_failure(watched) => {
                warn!(consumer = %name, "Consumer failed; stopping all consumers");
            }
        }

        let deadline = Instant::now() + self.drain_timeout;
        self.stop(deadline).await
    }
}

/// Resolves with the name of the first consumer to reach `Failed`.
async fn first_failure(watched: Vec<(String, watch::Receiver<RunnerState>)>) -> String {
    if watched.is_empty() {
        return std::future::pending().await;
    }

    let waits = watched.into_iter().map(|(name, mut rx)| {
        Box::pin(async move {
            let failed = rx.wait_for(|s| *s == RunnerState::Failed).await.is_ok();
            if !failed {
                // Sender dropped: this consumer can no longer fail
                std::future::pending::<()>().await;
            }
            name
        })
    });

    let (name, _, _) = select_all(waits).await;
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, MemoryStore};
    use parking_lot::Mutex;

    /// Consumer double recording the calls it receives.
    struct Recorder {
        name: String,
        state: Arc<watch::Sender<RunnerState>>,
        fail_start: bool,
        stop_result: Result<(), RunnerError>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
            let (state, _) = watch::channel(RunnerState::Stopped);
            Self {
                name: name.to_string(),
                state: Arc::new(state),
                fail_start: false,
                stop_result: Ok(()),
                log,
            }
        }
    }

    #[async_trait]
    impl Consumer for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn state(&self) -> RunnerState {
            *self.state.borrow()
        }

        fn watch_state(&self) -> watch::Receiver<RunnerState> {
            self.state.subscribe()
        }

        async fn start(&mut self, _ctx: &CancellationToken) -> Result<(), RunnerError> {
            self.log.lock().push(format!("start:{}", self.name));
            if self.fail_start {
                return Err(RunnerError::AlreadyStarted(self.name.clone()));
            }
            self.state.send_replace(RunnerState::Running);
            Ok(())
        }

        async fn stop(&mut self, _deadline: Instant) -> Result<(), RunnerError> {
            self.log.lock().push(format!("stop:{}", self.name));
            self.state.send_replace(RunnerState::Stopped);
            self.stop_result.clone()
        }
    }

    #[tokio::test]
    async fn test_stop_waits_for_all_and_returns_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Recorder::new("a", log.clone());
        failing.stop_result = Err(RunnerError::ShutdownTimeout {
            runner: "a".to_string(),
        });
        let mut also_failing = Recorder::new("b", log.clone());
        also_failing.stop_result = Err(RunnerError::TaskPanicked("b".to_string()));

        let mut controller = LifecycleController::new(Duration::from_secs(1))
            .with_consumer(failing)
            .with_consumer(also_failing)
            .with_consumer(Recorder::new("c", log.clone()));

        controller.start().await.unwrap();
        let err = controller.stop(Instant::now()).await.unwrap_err();

        assert!(matches!(err, RunnerError::ShutdownTimeout { .. }));
        let log = log.lock();
        assert!(log.contains(&"stop:a".to_string()));
        assert!(log.contains(&"stop:b".to_string()));
        assert!(log.contains(&"stop:c".to_string()));
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut broken = Recorder::new("broken", log.clone());
        broken.fail_start = true;

        let mut controller = LifecycleController::new(Duration::from_secs(1))
            .with_consumer(Recorder::new("ok", log.clone()))
            .with_consumer(broken);

        assert!(controller.start().await.is_err());
        assert!(log.lock().contains(&"stop:ok".to_string()));
        assert!(controller
            .states()
            .iter()
            .all(|(_, state)| *state == RunnerState::Stopped));
    }

    #[tokio::test]
    async fn test_run_until_stops_when_consumer_fails() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let doomed = Recorder::new("doomed", log.clone());
        let trip = doomed.state.clone();
        let mut controller = LifecycleController::new(Duration::from_secs(1))
            .with_consumer(doomed)
            .with_consumer(Recorder::new("healthy", log.clone()));

        let fail = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trip.send_replace(RunnerState::Failed);
        };
        let (result, ()) = tokio::join!(controller.run_until(std::future::pending()), fail);

        assert!(result.is_ok());
        let log = log.lock();
        assert!(log.contains(&"stop:doomed".to_string()));
        assert!(log.contains(&"stop:healthy".to_string()));
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown_signal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut controller = LifecycleController::new(Duration::from_secs(1))
            .with_consumer(Recorder::new("only", log.clone()));
        let token = CancellationToken::new();
        let shutdown = token.clone();

        let signal = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        };
        let (result, ()) = tokio::join!(
            controller.run_until(async move { shutdown.cancelled().await }),
            signal
        );

        assert!(result.is_ok());
        assert_eq!(*log.lock(), vec!["start:only", "stop:only"]);
    }

    #[tokio::test]
    async fn test_from_config_runs_both_streams() {
        let config = PersisterConfig::default();
        let store = Arc::new(MemoryStore::new());
        let mut controller = LifecycleController::from_config(
            &config,
            Arc::new(MemoryBroker::new([0])),
            Arc::new(MemoryBroker::new([0])),
            store,
        );
        assert_eq!(controller.len(), 2);

        controller.start().await.unwrap();
        let names: Vec<String> = controller.states().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["orders-consumer", "matches-consumer"]);

        controller
            .stop(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        assert!(controller
            .states()
            .iter()
            .all(|(_, state)| *state == RunnerState::Stopped));
    }
}
