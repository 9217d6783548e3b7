mod helpers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_core::{Batch, HandlerError, MessageId, OutgoingMessage, QueueStore, SendError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    sku: String,
}

/// Send a message, consume it, ack it: gone from the queue.
#[tokio::test(start_paused = true)]
async fn send_consume_ack() {
    let (broker, store) = helpers::start_broker(helpers::fast_config(vec![helpers::fast_queue(
        "orders",
    )]));
    let order = Order {
        id: 7,
        sku: "tea".into(),
    };
    broker
        .producer()
        .send_json("orders", &order, Duration::ZERO)
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let consumer = broker
        .consume("orders", move |batch: Batch| {
            let sink = Arc::clone(&sink);
            async move {
                for msg in &batch {
                    sink.lock().unwrap().push(msg.json::<Order>()?);
                    batch.ack(&msg.id)?;
                }
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    let mut rx = consumer.subscribe();
    helpers::wait_for(&mut rx, |r| helpers::acked(r) >= 1).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(*received.lock().unwrap(), vec![order]);
    assert!(store.messages("orders").unwrap().is_empty());
    let stats = broker.stats("orders").unwrap();
    assert_eq!(stats.depth.total(), 0);
}

/// Fails on the first delivery, succeeds on the second.
#[tokio::test(start_paused = true)]
async fn transient_failure_then_success() {
    let (broker, store) = helpers::start_broker(helpers::fast_config(vec![helpers::fast_queue(
        "orders",
    )]));
    broker
        .producer()
        .send("orders", "flaky", Duration::ZERO)
        .unwrap();

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&attempts);
    let consumer = broker
        .consume("orders", move |batch: Batch| {
            let seen = Arc::clone(&seen);
            async move {
                let msg = &batch.messages()[0];
                seen.lock().unwrap().push(msg.attempts);
                if msg.attempts == 1 {
                    return Err::<(), HandlerError>("not yet".into());
                }
                Ok(())
            }
        })
        .unwrap();
    let mut rx = consumer.subscribe();
    helpers::wait_for(&mut rx, |r| helpers::acked(r) >= 1).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);
    assert!(store.messages("orders").unwrap().is_empty());
}

/// Every message is eventually delivered and acked, and attempt counts only
/// ever grow, even when some invocations fail.
#[tokio::test(start_paused = true)]
async fn at_least_once_under_intermittent_failures() {
    let mut queue = helpers::fast_queue("orders");
    queue.retry.max_attempts = 10;
    let (broker, store) = helpers::start_broker(helpers::fast_config(vec![queue]));
    let producer = broker.producer();
    let sent: Vec<MessageId> = (0..40)
        .map(|i| producer.send("orders", format!("{i}"), Duration::ZERO).unwrap())
        .collect();

    let history: Arc<Mutex<HashMap<MessageId, Vec<u32>>>> = Arc::new(Mutex::new(HashMap::new()));
    let log = Arc::clone(&history);
    let consumer = broker
        .consume("orders", move |batch: Batch| {
            let log = Arc::clone(&log);
            async move {
                for msg in &batch {
                    log.lock().unwrap().entry(msg.id).or_default().push(msg.attempts);
                    let n: u32 = std::str::from_utf8(&msg.body)?.parse()?;
                    // Every third message fails its first two deliveries.
                    if n % 3 == 0 && msg.attempts <= 2 {
                        batch.retry(&msg.id, None)?;
                    } else {
                        batch.ack(&msg.id)?;
                    }
                }
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    let mut rx = consumer.subscribe();
    helpers::wait_for(&mut rx, |r| helpers::acked(r) >= 40).await;
    consumer.shutdown().await.unwrap();

    assert!(store.messages("orders").unwrap().is_empty());
    let history = history.lock().unwrap();
    for id in &sent {
        let attempts = &history[id];
        assert!(attempts.windows(2).all(|w| w[0] < w[1]), "{attempts:?}");
    }
    let retried = history.values().filter(|a| a.len() == 3).count();
    assert_eq!(retried, 14);
}

#[tokio::test(start_paused = true)]
async fn send_batch_reports_each_item() {
    let mut config = helpers::fast_config(vec![]);
    config.producer.max_body_bytes = 16;
    let (broker, store) = helpers::start_broker(config);

    let results = broker
        .producer()
        .send_batch(
            "orders",
            vec![
                OutgoingMessage::new("small"),
                OutgoingMessage::new(vec![b'x'; 64]),
                OutgoingMessage::new("tagged").with_header("tenant", "acme"),
            ],
        )
        .unwrap();

    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(SendError::PayloadTooLarge { size: 64, max: 16 })
    ));
    let tagged = results[2].as_ref().unwrap();
    let stored = store.get(tagged).unwrap().unwrap();
    assert_eq!(stored.headers["tenant"], "acme");
    assert_eq!(store.messages("orders").unwrap().len(), 2);
    assert_eq!(broker.stats("orders").unwrap().concurrency.backlog_estimate, 2);
}
