use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::batch::Batch;
use crate::broker::dead_letter::DeadLetterRouter;
use crate::broker::metrics::Metrics;
use crate::error::StoreError;
use crate::message::Message;
use crate::queue::QueueConfig;
use crate::store::QueueStore;

/// Reason recorded on messages whose leases kept lapsing without a resolution.
pub const LAPSED_REASON: &str = "visibility timeout lapsed";

/// Accumulates leased messages into batches bounded by size and wait time.
#[derive(Clone)]
pub struct Batcher {
    store: Arc<dyn QueueStore>,
    router: DeadLetterRouter,
    metrics: Arc<Metrics>,
    poll_interval: Duration,
}

impl Batcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        router: DeadLetterRouter,
        metrics: Arc<Metrics>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            router,
            metrics,
            poll_interval,
        }
    }

    /// Lease up to `max_size` messages from `queue`, polling until the batch
    /// is full or `max_wait` has elapsed. May return an empty batch.
    pub async fn next_batch(
        &self,
        queue: &QueueConfig,
        max_size: usize,
        max_wait: Duration,
    ) -> Result<Batch, StoreError> {
        self.fill(queue, max_size, max_wait, None).await
    }

    /// Like [`next_batch`](Self::next_batch), but stops waiting as soon as
    /// `shutdown` flips to true. Messages already leased are still returned.
    pub async fn next_batch_until(
        &self,
        queue: &QueueConfig,
        max_size: usize,
        max_wait: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Batch, StoreError> {
        self.fill(queue, max_size, max_wait, Some(shutdown)).await
    }

    async fn fill(
        &self,
        queue: &QueueConfig,
        max_size: usize,
        max_wait: Duration,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<Batch, StoreError> {
        let mut held: Vec<Message> = Vec::with_capacity(max_size);
        if max_size == 0 {
            return Ok(Batch::new(&queue.name, held, Arc::clone(&self.store)));
        }
        let deadline = Instant::now() + max_wait;

        loop {
            let want = max_size - held.len();
            match self
                .store
                .lease_batch(&queue.name, want, queue.visibility_timeout())
            {
                Ok(leased) => self.admit(queue, leased, &mut held),
                Err(err) if held.is_empty() => return Err(err),
                Err(err) => {
                    // Hand over what is already leased rather than strand it.
                    warn!(
                        queue = %queue.name,
                        error = %err,
                        held = held.len(),
                        "lease failed mid-batch"
                    );
                    self.metrics.record_store_error(&queue.name, "lease");
                    break;
                }
            }

            if held.len() >= max_size {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let pause = self.poll_interval.min(deadline - now);

            match shutdown.as_deref_mut() {
                Some(rx) => {
                    if *rx.borrow() {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = rx.changed() => break,
                    }
                }
                None => tokio::time::sleep(pause).await,
            }
        }

        self.refresh(queue, &mut held);
        if !held.is_empty() {
            self.metrics
                .record_delivered(&queue.name, held.len() as u64);
            debug!(queue = %queue.name, size = held.len(), "batch ready");
        }
        Ok(Batch::new(&queue.name, held, Arc::clone(&self.store)))
    }

    /// Restart the visibility window of every held message, so time spent
    /// filling the batch does not come out of processing time. Messages that
    /// changed hands while the batch filled are dropped.
    fn refresh(&self, queue: &QueueConfig, held: &mut Vec<Message>) {
        held.retain(|msg| {
            match self
                .store
                .extend_visibility(&msg.lease(), queue.visibility_timeout())
            {
                Ok(()) => true,
                Err(StoreError::LeaseLost(_) | StoreError::MessageNotFound(_)) => {
                    self.metrics.record_lease_lost(&queue.name);
                    debug!(
                        queue = %queue.name,
                        msg_id = %msg.id,
                        "lease lost before delivery"
                    );
                    false
                }
                Err(err) => {
                    // The original window still holds.
                    warn!(
                        queue = %queue.name,
                        msg_id = %msg.id,
                        error = %err,
                        "lease refresh failed"
                    );
                    self.metrics.record_store_error(&queue.name, "extend_visibility");
                    true
                }
            }
        });
    }

    /// Move freshly leased messages into `held`, diverting any that are past
    /// their delivery budget to the dead-letter router.
    fn admit(&self, queue: &QueueConfig, leased: Vec<Message>, held: &mut Vec<Message>) {
        let allowed = queue.retry.allowed_deliveries();
        for msg in leased {
            if msg.attempts <= allowed {
                held.push(msg);
                continue;
            }
            match self.router.route(
                &msg,
                queue.retry.dead_letter_queue.as_deref(),
                LAPSED_REASON,
            ) {
                Ok(_) => debug!(
                    queue = %queue.name,
                    msg_id = %msg.id,
                    attempts = msg.attempts,
                    "lapsed message removed before delivery"
                ),
                Err(err) => {
                    // Still leased; it comes back after the visibility timeout.
                    warn!(
                        queue = %queue.name,
                        msg_id = %msg.id,
                        error = %err,
                        "dead-letter routing failed"
                    );
                    self.metrics.record_store_error(&queue.name, "dead_letter");
                }
            }
        }
    }
}
