use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// Core OTel metrics for producers and consumers. Created once per broker
/// and shared by reference.
#[derive(Clone)]
pub struct Metrics {
    pub messages_sent: Counter<u64>,
    pub messages_delivered: Counter<u64>,
    pub messages_acked: Counter<u64>,
    pub messages_retried: Counter<u64>,
    pub messages_dead_lettered: Counter<u64>,
    pub messages_discarded: Counter<u64>,
    pub invocations_started: Counter<u64>,
    pub invocations_failed: Counter<u64>,
    pub invocations_timed_out: Counter<u64>,
    pub store_errors: Counter<u64>,
    pub leases_lost: Counter<u64>,
    pub consumer_concurrency: Gauge<u64>,
    pub queue_backlog: Gauge<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn queue_attr(queue: &str) -> [KeyValue; 1] {
    [KeyValue::new("queue", queue.to_string())]
}

impl Metrics {
    /// Create metrics from the global meter provider. If no meter provider
    /// is configured, the instruments are no-op.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("ferry");
        Self::from_meter(&meter)
    }

    /// Create metrics from a specific meter (used in tests with in-memory exporter).
    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            messages_sent: meter
                .u64_counter("ferry.messages.sent")
                .with_description("Total messages accepted by producers")
                .build(),
            messages_delivered: meter
                .u64_counter("ferry.messages.delivered")
                .with_description("Total messages delivered inside a batch")
                .build(),
            messages_acked: meter
                .u64_counter("ferry.messages.acked")
                .with_description("Total messages acknowledged, explicitly or implicitly")
                .build(),
            messages_retried: meter
                .u64_counter("ferry.messages.retried")
                .with_description("Total messages rescheduled for redelivery")
                .build(),
            messages_dead_lettered: meter
                .u64_counter("ferry.messages.dead_lettered")
                .with_description("Total exhausted messages moved to a dead-letter queue")
                .build(),
            messages_discarded: meter
                .u64_counter("ferry.messages.discarded")
                .with_description("Total exhausted messages dropped with no dead-letter queue")
                .build(),
            invocations_started: meter
                .u64_counter("ferry.invocations.started")
                .with_description("Total consumer invocations")
                .build(),
            invocations_failed: meter
                .u64_counter("ferry.invocations.failed")
                .with_description("Invocations that returned an error or panicked")
                .build(),
            invocations_timed_out: meter
                .u64_counter("ferry.invocations.timed_out")
                .with_description("Invocations aborted at the time budget")
                .build(),
            store_errors: meter
                .u64_counter("ferry.store.errors")
                .with_description("Queue store operations that failed")
                .build(),
            leases_lost: meter
                .u64_counter("ferry.leases.lost")
                .with_description("Resolutions dropped because the message was leased again")
                .build(),
            consumer_concurrency: meter
                .u64_gauge("ferry.consumer.concurrency")
                .with_description("Current concurrency target per queue")
                .build(),
            queue_backlog: meter
                .u64_gauge("ferry.queue.backlog")
                .with_description("Estimated ready messages per queue")
                .build(),
        }
    }

    pub fn record_sent(&self, queue: &str, count: u64) {
        self.messages_sent.add(count, &queue_attr(queue));
    }

    pub fn record_delivered(&self, queue: &str, count: u64) {
        self.messages_delivered.add(count, &queue_attr(queue));
    }

    pub fn record_acked(&self, queue: &str) {
        self.messages_acked.add(1, &queue_attr(queue));
    }

    pub fn record_retried(&self, queue: &str) {
        self.messages_retried.add(1, &queue_attr(queue));
    }

    pub fn record_dead_lettered(&self, queue: &str) {
        self.messages_dead_lettered.add(1, &queue_attr(queue));
    }

    pub fn record_discarded(&self, queue: &str) {
        self.messages_discarded.add(1, &queue_attr(queue));
    }

    pub fn record_invocation(&self, queue: &str) {
        self.invocations_started.add(1, &queue_attr(queue));
    }

    pub fn record_invocation_failed(&self, queue: &str) {
        self.invocations_failed.add(1, &queue_attr(queue));
    }

    pub fn record_invocation_timed_out(&self, queue: &str) {
        self.invocations_timed_out.add(1, &queue_attr(queue));
    }

    pub fn record_store_error(&self, queue: &str, operation: &'static str) {
        self.store_errors.add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("operation", operation),
            ],
        );
    }

    pub fn record_lease_lost(&self, queue: &str) {
        self.leases_lost.add(1, &queue_attr(queue));
    }

    pub fn set_concurrency(&self, queue: &str, target: u64) {
        self.consumer_concurrency.record(target, &queue_attr(queue));
    }

    pub fn set_backlog(&self, queue: &str, backlog: u64) {
        self.queue_backlog.record(backlog, &queue_attr(queue));
    }
}
