#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ferry_core::broker::{ConsumerConfig, Metrics};
use ferry_core::{BatchReport, Broker, Clock, FerryConfig, MemoryStore, QueueConfig};
use tokio::sync::broadcast;

/// Clock that follows Tokio's pausable time.
pub struct TokioClock {
    start: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        1_700_000_000_000 + self.start.elapsed().as_millis() as u64
    }
}

pub fn fast_config(queues: Vec<QueueConfig>) -> FerryConfig {
    FerryConfig {
        consumer: ConsumerConfig {
            poll_interval_ms: 10,
            invocation_timeout_ms: 1_000,
            supervisor_tick_ms: 10,
            ..Default::default()
        },
        queues,
        ..Default::default()
    }
}

pub fn fast_queue(name: &str) -> QueueConfig {
    let mut queue = QueueConfig::new(name);
    queue.max_batch_wait_ms = 50;
    queue.retry.base_delay_ms = 100;
    queue.retry.max_delay_ms = 1_000;
    queue
}

/// A broker over an in-memory store whose clock follows Tokio time.
pub fn start_broker(config: FerryConfig) -> (Broker, Arc<MemoryStore>) {
    let clock = Arc::new(TokioClock::new());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let broker =
        Broker::with_parts(config, store.clone(), clock, Arc::new(Metrics::new())).unwrap();
    (broker, store)
}

pub async fn wait_for(
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

pub fn acked(reports: &[BatchReport]) -> usize {
    reports.iter().map(|r| r.acked).sum()
}
