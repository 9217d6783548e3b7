//! Consumer runtime.
//!
//! A consumer runs one supervisor task per queue. The supervisor keeps the
//! number of worker tasks equal to the queue's concurrency target; each
//! worker loops through fetch, invoke and resolve on its own batch. User
//! logic runs in a task of its own so panics and timeouts stay contained.

mod worker;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::broker::ack::{AckTracker, BatchReport};
use crate::broker::batch::Batch;
use crate::broker::batcher::Batcher;
use crate::broker::config::ConsumerConfig;
use crate::broker::controller::{ConcurrencyController, ControllerSnapshot};
use crate::broker::metrics::Metrics;
use crate::broker::retry::RetryScheduler;
use crate::error::{ConsumerError, HandlerError};
use crate::queue::QueueConfig;
use crate::store::QueueStore;

use worker::Worker;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'static>>;

/// User processing logic for one queue. Implemented for any
/// `Fn(Batch) -> impl Future<Output = Result<(), HandlerError>>`.
///
/// Returning `Ok` acks every message the logic left unresolved; returning
/// an error retries them with backoff.
pub trait BatchHandler: Send + Sync + 'static {
    fn handle(&self, batch: Batch) -> HandlerFuture;
}

impl<F, Fut> BatchHandler for F
where
    F: Fn(Batch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, batch: Batch) -> HandlerFuture {
        Box::pin(self(batch))
    }
}

/// Where a worker is in its consume cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Fetching,
    Invoking,
    Resolving,
}

/// Everything workers of one consumer share.
pub(crate) struct ConsumerContext {
    pub(crate) queue: QueueConfig,
    pub(crate) config: ConsumerConfig,
    pub(crate) store: Arc<dyn QueueStore>,
    pub(crate) batcher: Batcher,
    pub(crate) tracker: AckTracker,
    pub(crate) retry: RetryScheduler,
    pub(crate) controller: Arc<ConcurrencyController>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) handler: Arc<dyn BatchHandler>,
    pub(crate) reports: broadcast::Sender<BatchReport>,
}

/// Handle to a running consumer. Dropping it signals shutdown without
/// waiting; call [`shutdown`](Consumer::shutdown) to wait for in-flight
/// batches to resolve.
#[derive(Debug)]
pub struct Consumer {
    queue: String,
    stop: Arc<watch::Sender<bool>>,
    reports: broadcast::Sender<BatchReport>,
    controller: Arc<ConcurrencyController>,
    supervisor: Option<JoinHandle<()>>,
}

impl Consumer {
    /// Spawn the supervisor. Must be called from within a Tokio runtime.
    pub(crate) fn start(ctx: ConsumerContext, broker_shutdown: watch::Receiver<bool>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop = Arc::new(stop_tx);
        let queue = ctx.queue.name.clone();
        let reports = ctx.reports.clone();
        let controller = Arc::clone(&ctx.controller);

        ctx.controller.configure(
            ctx.queue.concurrency_limit,
            ctx.config.max_concurrency,
            ctx.config.scale_down_after_empty_polls,
        );

        let supervisor = tokio::spawn(supervise(
            Arc::new(ctx),
            Arc::clone(&stop),
            stop_rx,
            broker_shutdown,
        ));
        info!(%queue, "consumer started");

        Self {
            queue,
            stop,
            reports,
            controller,
            supervisor: Some(supervisor),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Receive a report for every batch closed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchReport> {
        self.reports.subscribe()
    }

    pub fn concurrency(&self) -> ControllerSnapshot {
        self.controller.snapshot()
    }

    /// Stop fetching, let in-flight invocations finish and wait for every
    /// worker to exit.
    #[tracing::instrument(skip_all, fields(queue = %self.queue))]
    pub async fn shutdown(mut self) -> Result<(), ConsumerError> {
        info!("consumer shutting down");
        let _ = self.stop.send(true);
        if let Some(handle) = self.supervisor.take() {
            handle.await.map_err(|_| ConsumerError::SupervisorPanicked)?;
        }
        info!("consumer shutdown complete");
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

async fn supervise(
    ctx: Arc<ConsumerContext>,
    stop: Arc<watch::Sender<bool>>,
    mut stop_rx: watch::Receiver<bool>,
    mut broker_shutdown: watch::Receiver<bool>,
) {
    let queue = ctx.queue.name.clone();
    let mut workers = JoinSet::new();
    let mut tick = tokio::time::interval(ctx.config.supervisor_tick());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        if *stop_rx.borrow() || *broker_shutdown.borrow() {
            break;
        }
        while let Some(slot) = ctx.controller.try_acquire() {
            let worker = Worker::new(Arc::clone(&ctx), slot, stop_rx.clone());
            workers.spawn(worker.run());
        }
        let snapshot = ctx.controller.snapshot();
        ctx.metrics.set_concurrency(&queue, snapshot.target as u64);
        ctx.metrics.set_backlog(&queue, snapshot.backlog_estimate);

        tokio::select! {
            _ = tick.tick() => {}
            Some(joined) = workers.join_next() => log_worker_exit(&queue, joined),
            _ = stop_rx.changed() => {}
            changed = broker_shutdown.changed() => {
                if changed.is_err() {
                    // Broker dropped: nothing left to signal shutdown.
                    break;
                }
            }
        }
    }

    let _ = stop.send(true);
    debug!(%queue, workers = workers.len(), "draining workers");
    while let Some(joined) = workers.join_next().await {
        log_worker_exit(&queue, joined);
    }
    ctx.metrics.set_concurrency(&queue, 0);
}

fn log_worker_exit(queue: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(%queue, error = %err, "consumer worker panicked");
    }
}

#[cfg(test)]
mod tests;
