use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::broker::batch::{AckRecord, Resolution};
use crate::broker::controller::ControllerRegistry;
use crate::broker::dead_letter::{DeadLetterOutcome, DeadLetterRouter};
use crate::broker::metrics::Metrics;
use crate::broker::retry::RetryScheduler;
use crate::clock::{after, Clock};
use crate::error::StoreError;
use crate::message::Message;
use crate::store::QueueStore;

/// How an invocation of user processing logic ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Completed,
    Failed(String),
    TimedOut,
    Panicked,
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationOutcome::Completed)
    }

    fn dead_letter_reason(&self) -> String {
        match self {
            InvocationOutcome::Completed => "retry attempts exhausted".to_string(),
            InvocationOutcome::Failed(err) => format!("handler failed: {err}"),
            InvocationOutcome::TimedOut => "invocation timed out".to_string(),
            InvocationOutcome::Panicked => "handler panicked".to_string(),
        }
    }
}

impl fmt::Display for InvocationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationOutcome::Completed => f.write_str("completed"),
            InvocationOutcome::Failed(err) => write!(f, "failed: {err}"),
            InvocationOutcome::TimedOut => f.write_str("timed out"),
            InvocationOutcome::Panicked => f.write_str("panicked"),
        }
    }
}

/// Final per-message decision taken when a batch closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Delete,
    Reschedule(Duration),
    DeadLetter,
}

/// Summary of one closed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub queue: String,
    pub size: usize,
    pub acked: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub discarded: usize,
    /// Messages whose decision could not be applied; they stay leased and
    /// come back after their visibility timeout.
    pub failed_ops: usize,
    /// Messages leased again by another batch after this batch's lease
    /// lapsed. Their decisions were dropped; the newer lease owns them.
    pub lease_lost: usize,
    pub outcome: InvocationOutcome,
}

/// Turns an acknowledgement record into store mutations once the
/// invocation that owned it has ended.
#[derive(Clone)]
pub struct AckTracker {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    router: DeadLetterRouter,
    controllers: Arc<ControllerRegistry>,
    metrics: Arc<Metrics>,
}

impl AckTracker {
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        router: DeadLetterRouter,
        controllers: Arc<ControllerRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            clock,
            router,
            controllers,
            metrics,
        }
    }

    /// Decide what happens to every message of a closed batch. Unresolved
    /// messages follow the invocation outcome; any message headed for
    /// redelivery that has used up its attempts is dead-lettered instead.
    pub fn resolve(
        entries: Vec<(Message, Resolution)>,
        outcome: &InvocationOutcome,
        retry: &RetryScheduler,
    ) -> Vec<(Message, Decision)> {
        entries
            .into_iter()
            .map(|(msg, resolution)| {
                let delay = match resolution {
                    Resolution::Acked => return (msg, Decision::Delete),
                    Resolution::Unresolved if outcome.is_success() => {
                        return (msg, Decision::Delete)
                    }
                    Resolution::Unresolved => None,
                    Resolution::Retried { delay } => delay,
                };
                let decision = if retry.should_dead_letter(msg.attempts) {
                    Decision::DeadLetter
                } else {
                    Decision::Reschedule(delay.unwrap_or_else(|| retry.backoff(msg.attempts)))
                };
                (msg, decision)
            })
            .collect()
    }

    /// Close `record` and apply its decisions. A failure on one message is
    /// logged and counted without affecting the others.
    pub fn close(
        &self,
        queue: &str,
        record: &AckRecord,
        outcome: InvocationOutcome,
        retry: &RetryScheduler,
    ) -> BatchReport {
        let decisions = Self::resolve(record.close(), &outcome, retry);
        let mut report = BatchReport {
            queue: queue.to_string(),
            size: decisions.len(),
            acked: 0,
            retried: 0,
            dead_lettered: 0,
            discarded: 0,
            failed_ops: 0,
            lease_lost: 0,
            outcome,
        };
        let dead_letter_queue = retry.policy().dead_letter_queue.as_deref();

        for (msg, decision) in decisions {
            match decision {
                Decision::Delete => match self.store.delete(&msg.lease()) {
                    Ok(()) => {
                        report.acked += 1;
                        self.metrics.record_acked(queue);
                    }
                    Err(StoreError::LeaseLost(_)) => {
                        report.lease_lost += 1;
                        self.lease_lost(queue, &msg, "delete");
                    }
                    Err(err) => {
                        report.failed_ops += 1;
                        self.store_failure(queue, &msg, "delete", &err);
                    }
                },
                Decision::Reschedule(delay) => {
                    let visible_at = after(self.clock.now_ms(), delay);
                    match self.store.make_visible_at(&msg.lease(), visible_at) {
                        Ok(()) => {
                            report.retried += 1;
                            self.controllers.controller(queue).record_enqueued(1);
                            self.metrics.record_retried(queue);
                            debug!(
                                %queue,
                                msg_id = %msg.id,
                                attempts = msg.attempts,
                                delay_ms = delay.as_millis() as u64,
                                "message rescheduled"
                            );
                        }
                        Err(StoreError::LeaseLost(_)) => {
                            report.lease_lost += 1;
                            self.lease_lost(queue, &msg, "reschedule");
                        }
                        Err(err) => {
                            report.failed_ops += 1;
                            self.store_failure(queue, &msg, "reschedule", &err);
                        }
                    }
                }
                Decision::DeadLetter => {
                    let reason = report.outcome.dead_letter_reason();
                    match self.router.route(&msg, dead_letter_queue, &reason) {
                        Ok(DeadLetterOutcome::Routed { .. }) => report.dead_lettered += 1,
                        Ok(DeadLetterOutcome::Discarded) => report.discarded += 1,
                        Err(err) if err.is_lease_lost() => {
                            report.lease_lost += 1;
                            self.lease_lost(queue, &msg, "dead_letter");
                        }
                        Err(err) => {
                            report.failed_ops += 1;
                            self.store_failure(queue, &msg, "dead_letter", &err);
                        }
                    }
                }
            }
        }

        debug!(
            %queue,
            size = report.size,
            acked = report.acked,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            discarded = report.discarded,
            failed_ops = report.failed_ops,
            lease_lost = report.lease_lost,
            outcome = %report.outcome,
            "batch closed"
        );
        report
    }

    fn store_failure(
        &self,
        queue: &str,
        msg: &Message,
        operation: &'static str,
        err: &dyn std::error::Error,
    ) {
        self.metrics.record_store_error(queue, operation);
        warn!(
            %queue,
            msg_id = %msg.id,
            operation,
            error = %err,
            "failed to apply resolution, message stays leased"
        );
    }

    fn lease_lost(&self, queue: &str, msg: &Message, operation: &'static str) {
        self.metrics.record_lease_lost(queue);
        warn!(
            %queue,
            msg_id = %msg.id,
            attempts = msg.attempts,
            operation,
            "lease lapsed and was taken over, resolution dropped"
        );
    }
}
