use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use crate::broker::ack::InvocationOutcome;
use crate::broker::batch::{AckRecord, Batch};
use crate::broker::controller::InvocationSlot;
use crate::error::{ExtendError, StoreError};

use super::{ConsumerContext, ConsumerState};

/// One concurrent consume loop. Holds an invocation slot for its lifetime.
pub(super) struct Worker {
    ctx: Arc<ConsumerContext>,
    slot: InvocationSlot,
    shutdown: watch::Receiver<bool>,
    state: ConsumerState,
}

impl Worker {
    pub(super) fn new(
        ctx: Arc<ConsumerContext>,
        slot: InvocationSlot,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            slot,
            shutdown,
            state: ConsumerState::Idle,
        }
    }

    fn transition(&mut self, next: ConsumerState) {
        trace!(queue = %self.ctx.queue.name, from = ?self.state, to = ?next, "worker state");
        self.state = next;
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(super) async fn run(mut self) {
        let ctx = Arc::clone(&self.ctx);
        let queue = &ctx.queue;

        loop {
            self.transition(ConsumerState::Idle);
            if self.stopping() {
                break;
            }
            if ctx.controller.try_retire(&mut self.slot) {
                debug!(queue = %queue.name, "worker retired");
                break;
            }

            self.transition(ConsumerState::Fetching);
            let batch = match ctx
                .batcher
                .next_batch_until(
                    queue,
                    queue.max_batch_size,
                    queue.max_batch_wait(),
                    &mut self.shutdown,
                )
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(queue = %queue.name, error = %err, "lease failed");
                    ctx.metrics.record_store_error(&queue.name, "lease");
                    self.pause(ctx.config.fetch_error_backoff()).await;
                    continue;
                }
            };

            if batch.is_empty() {
                if ctx.controller.observe_empty_poll() {
                    self.resync_backlog();
                }
                continue;
            }
            ctx.controller
                .observe_batch(batch.len(), queue.max_batch_size);

            self.transition(ConsumerState::Invoking);
            let record = batch.record();
            let outcome = self.invoke(batch, &record).await;

            self.transition(ConsumerState::Resolving);
            let report = ctx.tracker.close(&queue.name, &record, outcome, &ctx.retry);
            // No subscribers is fine.
            let _ = ctx.reports.send(report);
        }
    }

    /// Run user logic on its own task under the invocation budget. The
    /// batch's leases are renewed every half visibility timeout until the
    /// invocation ends, so a slow handler keeps its messages.
    async fn invoke(&self, batch: Batch, record: &AckRecord) -> InvocationOutcome {
        let ctx = &self.ctx;
        let queue = ctx.queue.name.as_str();
        let size = batch.len();
        ctx.metrics.record_invocation(queue);

        let handler = Arc::clone(&ctx.handler);
        let mut task = tokio::spawn(async move { handler.handle(batch).await });

        let budget = tokio::time::sleep(ctx.config.invocation_timeout());
        tokio::pin!(budget);
        let period = (ctx.queue.visibility_timeout() / 2).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let joined = loop {
            tokio::select! {
                joined = &mut task => break Some(joined),
                _ = &mut budget => break None,
                _ = heartbeat.tick() => self.renew_leases(record),
            }
        };

        match joined {
            Some(Ok(Ok(()))) => InvocationOutcome::Completed,
            Some(Ok(Err(err))) => {
                ctx.metrics.record_invocation_failed(queue);
                warn!(%queue, size, error = %err, "batch handler failed");
                InvocationOutcome::Failed(err.to_string())
            }
            Some(Err(join_err)) if join_err.is_panic() => {
                ctx.metrics.record_invocation_failed(queue);
                error!(%queue, size, "batch handler panicked");
                InvocationOutcome::Panicked
            }
            Some(Err(join_err)) => {
                ctx.metrics.record_invocation_failed(queue);
                warn!(%queue, size, error = %join_err, "batch handler cancelled");
                InvocationOutcome::Failed(join_err.to_string())
            }
            None => {
                task.abort();
                ctx.metrics.record_invocation_timed_out(queue);
                warn!(
                    %queue,
                    size,
                    budget_ms = ctx.config.invocation_timeout_ms,
                    "batch handler exceeded its budget, aborted"
                );
                InvocationOutcome::TimedOut
            }
        }
    }

    fn renew_leases(&self, record: &AckRecord) {
        let ctx = &self.ctx;
        let queue = ctx.queue.name.as_str();
        let window = ctx.queue.visibility_timeout();
        for msg in record.messages() {
            match record.extend_visibility(ctx.store.as_ref(), &msg.id, window) {
                Ok(()) | Err(ExtendError::BatchClosed) => {}
                Err(ExtendError::Store(StoreError::LeaseLost(_))) => {
                    ctx.metrics.record_lease_lost(queue);
                    warn!(%queue, msg_id = %msg.id, "lease taken over during invocation");
                }
                Err(err) => {
                    ctx.metrics.record_store_error(queue, "extend_visibility");
                    warn!(%queue, msg_id = %msg.id, error = %err, "lease renewal failed");
                }
            }
        }
        trace!(%queue, size = record.messages().len(), "leases renewed");
    }

    /// Re-anchor the backlog estimate on the store's count of ready messages.
    fn resync_backlog(&self) {
        let ctx = &self.ctx;
        match ctx.store.depth(&ctx.queue.name) {
            Ok(depth) => ctx.controller.resync_backlog(depth.ready),
            Err(err) => {
                ctx.metrics.record_store_error(&ctx.queue.name, "depth");
                warn!(queue = %ctx.queue.name, error = %err, "backlog resync failed");
            }
        }
    }

    async fn pause(&mut self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}
