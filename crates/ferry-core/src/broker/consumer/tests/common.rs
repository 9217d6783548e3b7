use super::*;

/// Wall clock driven by Tokio's (pausable) time, so retry backoff and
/// visibility timeouts elapse as paused tests auto-advance.
pub(super) struct TokioClock {
    start: tokio::time::Instant,
    base_ms: u64,
}

impl TokioClock {
    pub(super) fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
            base_ms: 1_700_000_000_000,
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.base_ms + self.start.elapsed().as_millis() as u64
    }
}

pub(super) struct TestBroker {
    pub broker: Broker,
    pub store: Arc<MemoryStore>,
    pub harness: MetricTestHarness,
}

/// Fast timings: 10ms polls, 50ms batch wait, 100ms base backoff and a one
/// second invocation budget.
pub(super) fn test_config() -> FerryConfig {
    FerryConfig {
        consumer: ConsumerConfig {
            poll_interval_ms: 10,
            invocation_timeout_ms: 1_000,
            supervisor_tick_ms: 10,
            fetch_error_backoff_ms: 20,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(super) fn test_queue(name: &str) -> QueueConfig {
    let mut queue = QueueConfig::new(name);
    queue.max_batch_wait_ms = 50;
    queue.visibility_timeout_ms = 5_000;
    queue.retry.base_delay_ms = 100;
    queue.retry.max_delay_ms = 1_000;
    queue
}

pub(super) fn test_setup() -> TestBroker {
    test_setup_with_config(test_config())
}

pub(super) fn test_setup_with_config(config: FerryConfig) -> TestBroker {
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let harness = MetricTestHarness::new();
    let broker = Broker::with_parts(
        config,
        store.clone(),
        clock,
        Arc::new(harness.metrics.clone()),
    )
    .unwrap();
    TestBroker {
        broker,
        store,
        harness,
    }
}

pub(super) fn send_many(broker: &Broker, queue: &str, n: usize) -> Vec<MessageId> {
    let producer = broker.producer();
    (0..n)
        .map(|i| {
            producer
                .send(queue, format!("msg-{i}"), Duration::ZERO)
                .unwrap()
        })
        .collect()
}

/// Receive reports until `done` holds for everything received so far.
pub(super) async fn collect_until(
    rx: &mut broadcast::Receiver<BatchReport>,
    mut done: impl FnMut(&[BatchReport]) -> bool,
) -> Vec<BatchReport> {
    let mut reports = Vec::new();
    tokio::time::timeout(Duration::from_secs(600), async {
        while !done(&reports) {
            match rx.recv().await {
                Ok(report) => reports.push(report),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .expect("timed out waiting for batch reports");
    reports
}

pub(super) fn total_acked(reports: &[BatchReport]) -> usize {
    reports.iter().map(|r| r.acked).sum()
}

pub(super) fn ok() -> Result<(), HandlerError> {
    Ok(())
}
