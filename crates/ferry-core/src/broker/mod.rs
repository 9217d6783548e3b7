pub mod ack;
pub mod batch;
pub mod batcher;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod dead_letter;
pub mod metrics;
pub mod producer;
pub mod retry;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConsumerError, RouteError, StoreResult};
use crate::message::LeaseToken;
use crate::queue::QueueConfig;
use crate::store::{MemoryStore, QueueStore};

pub use ack::{AckTracker, BatchReport, Decision, InvocationOutcome};
pub use batch::{AckRecord, Batch, Resolution};
pub use batcher::Batcher;
pub use config::{ConsumerConfig, FerryConfig, ProducerConfig};
pub use consumer::{BatchHandler, Consumer, ConsumerState};
pub use controller::{ConcurrencyController, ControllerRegistry, ControllerSnapshot};
pub use dead_letter::{DeadLetterOutcome, DeadLetterRouter};
pub use metrics::Metrics;
pub use producer::{OutgoingMessage, Producer};
pub use retry::RetryScheduler;
pub use stats::QueueStats;

use consumer::ConsumerContext;

/// Wires producers and consumers to one queue store.
///
/// The broker owns the shared pieces: the store, the clock, the per-queue
/// concurrency controllers and the metrics. Producers are cheap clones;
/// each consumer runs its own supervisor task. Dropping the broker signals
/// its consumers to stop.
pub struct Broker {
    config: FerryConfig,
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    controllers: Arc<ControllerRegistry>,
    metrics: Arc<Metrics>,
    router: DeadLetterRouter,
    producer: Producer,
    shutdown_tx: watch::Sender<bool>,
}

impl Broker {
    /// Create a broker over `store` using the system clock and the global
    /// meter provider.
    pub fn new(config: FerryConfig, store: Arc<dyn QueueStore>) -> Result<Self, ConfigError> {
        Self::with_parts(config, store, Arc::new(SystemClock), Arc::new(Metrics::new()))
    }

    /// Create a broker backed by a fresh in-memory store.
    pub fn in_memory(config: FerryConfig) -> Result<Self, ConfigError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::new(Arc::clone(&clock)));
        Self::with_parts(config, store, clock, Arc::new(Metrics::new()))
    }

    #[tracing::instrument(skip_all, fields(queues = config.queues.len()))]
    pub fn with_parts(
        config: FerryConfig,
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let controllers = Arc::new(ControllerRegistry::new(config.consumer.max_concurrency));
        let router = DeadLetterRouter::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&controllers),
            Arc::clone(&metrics),
        );
        let producer = Producer::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&controllers),
            Arc::clone(&metrics),
            config.producer.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        info!("broker started");
        Ok(Self {
            config,
            store,
            clock,
            controllers,
            metrics,
            router,
            producer,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &FerryConfig {
        &self.config
    }

    pub fn producer(&self) -> Producer {
        self.producer.clone()
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.store)
    }

    pub fn controller(&self, queue: &str) -> Arc<ConcurrencyController> {
        self.controllers.controller(queue)
    }

    /// Start consuming a queue declared in the configuration.
    pub fn consume<H: BatchHandler>(
        &self,
        queue: &str,
        handler: H,
    ) -> Result<Consumer, ConsumerError> {
        let config = self
            .config
            .queue(queue)
            .cloned()
            .ok_or_else(|| ConsumerError::UnknownQueue(queue.to_string()))?;
        self.consume_with(config, handler)
    }

    /// Start consuming with an explicit queue configuration.
    /// Must be called from within a Tokio runtime.
    #[tracing::instrument(skip_all, fields(queue = %queue.name))]
    pub fn consume_with<H: BatchHandler>(
        &self,
        queue: QueueConfig,
        handler: H,
    ) -> Result<Consumer, ConsumerError> {
        queue.validate()?;
        let (reports, _) = broadcast::channel(self.config.consumer.report_channel_capacity.max(1));
        let batcher = Batcher::new(
            Arc::clone(&self.store),
            self.router.clone(),
            Arc::clone(&self.metrics),
            self.config.consumer.poll_interval(),
        );
        let tracker = AckTracker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.router.clone(),
            Arc::clone(&self.controllers),
            Arc::clone(&self.metrics),
        );
        let ctx = ConsumerContext {
            retry: RetryScheduler::new(queue.retry.clone()),
            controller: self.controllers.controller(&queue.name),
            queue,
            config: self.config.consumer.clone(),
            store: Arc::clone(&self.store),
            batcher,
            tracker,
            metrics: Arc::clone(&self.metrics),
            handler: Arc::new(handler),
            reports,
        };
        Ok(Consumer::start(ctx, self.shutdown_tx.subscribe()))
    }

    /// Move up to `count` messages from a dead-letter queue back to their
    /// original queues. Messages in transit are held for the dead-letter
    /// queue's visibility timeout.
    pub fn redrive(&self, dead_letter_queue: &str, count: usize) -> Result<usize, RouteError> {
        let lease_window = self
            .config
            .queue(dead_letter_queue)
            .map(QueueConfig::visibility_timeout)
            .unwrap_or(Duration::from_millis(QueueConfig::DEFAULT_VISIBILITY_TIMEOUT_MS));
        self.router.redrive(dead_letter_queue, count, lease_window)
    }

    /// Push a leased message's visibility forward. Inside a handler,
    /// [`Batch::extend_visibility`] does the same for messages of the batch.
    pub fn extend_visibility(&self, lease: &LeaseToken, delay: Duration) -> StoreResult<()> {
        self.store.extend_visibility(lease, delay)
    }

    pub fn stats(&self, queue: &str) -> StoreResult<QueueStats> {
        let depth = self.store.depth(queue)?;
        let concurrency = self.controllers.controller(queue).snapshot();
        self.metrics.set_backlog(queue, concurrency.backlog_estimate);
        Ok(QueueStats {
            queue: queue.to_string(),
            depth,
            concurrency,
        })
    }

    /// Signal every consumer started from this broker to stop. Await each
    /// [`Consumer::shutdown`] to wait for in-flight batches.
    #[tracing::instrument(skip_all)]
    pub fn shutdown(&self) {
        info!("broker shutdown requested");
        self.shutdown_tx.send_replace(true);
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
