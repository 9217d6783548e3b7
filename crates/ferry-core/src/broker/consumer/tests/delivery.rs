use super::*;
use std::sync::Mutex;

use crate::error::ResolveError;

#[tokio::test(start_paused = true)]
async fn acks_every_message_on_success() {
    let t = test_setup();
    send_many(&t.broker, "jobs", 5);

    let consumer = t
        .broker
        .consume_with(test_queue("jobs"), |_batch: Batch| async { ok() })
        .unwrap();
    let mut rx = consumer.subscribe();
    let reports = collect_until(&mut rx, |r| total_acked(r) >= 5).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(total_acked(&reports), 5);
    assert!(reports.iter().all(|r| r.outcome == InvocationOutcome::Completed));
    assert!(t.store.messages("jobs").unwrap().is_empty());
    t.harness.assert_counter("ferry.messages.delivered", "jobs", 5);
    t.harness.assert_counter("ferry.messages.acked", "jobs", 5);
}

#[tokio::test(start_paused = true)]
async fn batches_respect_max_size() {
    let t = test_setup();
    send_many(&t.broker, "jobs", 7);
    let mut queue = test_queue("jobs");
    queue.max_batch_size = 3;

    let consumer = t
        .broker
        .consume_with(queue, |_batch: Batch| async { ok() })
        .unwrap();
    let mut rx = consumer.subscribe();
    let reports = collect_until(&mut rx, |r| total_acked(r) >= 7).await;
    consumer.shutdown().await.unwrap();

    assert!(reports.iter().all(|r| r.size <= 3));
    assert_eq!(reports.iter().map(|r| r.size).sum::<usize>(), 7);
}

#[tokio::test(start_paused = true)]
async fn explicit_resolutions_override_batch_outcome() {
    let t = test_setup();
    let ids = send_many(&t.broker, "jobs", 3);
    let (a, b, c) = (ids[0], ids[1], ids[2]);

    let deliveries: Arc<Mutex<Vec<(MessageId, u32, tokio::time::Instant)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&deliveries);
    let consumer = t
        .broker
        .consume_with(test_queue("jobs"), move |batch: Batch| {
            let log = Arc::clone(&log);
            async move {
                let now = tokio::time::Instant::now();
                for msg in &batch {
                    log.lock().unwrap().push((msg.id, msg.attempts, now));
                }
                if batch.iter().all(|m| m.attempts > 1) {
                    return ok();
                }
                batch.ack(&a)?;
                batch.retry(&b, Some(Duration::from_secs(10)))?;
                Err("third message failed".into())
            }
        })
        .unwrap();
    let mut rx = consumer.subscribe();
    let reports = collect_until(&mut rx, |r| total_acked(r) >= 3).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(reports[0].acked, 1);
    assert_eq!(reports[0].retried, 2);

    let deliveries = deliveries.lock().unwrap();
    let of = |id: MessageId| -> Vec<(u32, tokio::time::Instant)> {
        deliveries
            .iter()
            .filter(|(m, _, _)| *m == id)
            .map(|(_, attempts, at)| (*attempts, *at))
            .collect()
    };
    assert_eq!(of(a).len(), 1);

    let b_deliveries = of(b);
    assert_eq!(b_deliveries.len(), 2);
    assert_eq!(b_deliveries[1].0, 2);
    assert!(b_deliveries[1].1 - b_deliveries[0].1 >= Duration::from_secs(10));

    // Implicit retry uses the 100ms base backoff, well before B comes back.
    let c_deliveries = of(c);
    assert_eq!(c_deliveries.len(), 2);
    assert_eq!(c_deliveries[1].0, 2);
    assert!(c_deliveries[1].1 - c_deliveries[0].1 < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn resolution_after_close_is_rejected() {
    let t = test_setup();
    send_many(&t.broker, "jobs", 1);

    let (late_tx, mut late_rx) = tokio::sync::mpsc::unbounded_channel();
    let consumer = t
        .broker
        .consume_with(test_queue("jobs"), move |batch: Batch| {
            let late_tx = late_tx.clone();
            async move {
                // Keep the batch past the end of the invocation.
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let id = batch.messages()[0].id;
                    let _ = late_tx.send(batch.retry(&id, None));
                });
                ok()
            }
        })
        .unwrap();
    let mut rx = consumer.subscribe();
    collect_until(&mut rx, |r| total_acked(r) >= 1).await;

    let late = late_rx.recv().await.unwrap();
    assert_eq!(late, Err(ResolveError::BatchClosed));
    consumer.shutdown().await.unwrap();
    assert!(t.store.messages("jobs").unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn configured_queue_is_consumed_by_name() {
    let mut config = test_config();
    config.queues.push(test_queue("jobs"));
    let t = test_setup_with_config(config);
    send_many(&t.broker, "jobs", 2);

    let consumer = t
        .broker
        .consume("jobs", |_batch: Batch| async { ok() })
        .unwrap();
    let mut rx = consumer.subscribe();
    collect_until(&mut rx, |r| total_acked(r) >= 2).await;
    consumer.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn delayed_message_waits_until_visible() {
    let t = test_setup();
    let started = tokio::time::Instant::now();
    t.broker
        .producer()
        .send("jobs", "later", Duration::from_secs(2))
        .unwrap();

    let delivered_at = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&delivered_at);
    let consumer = t
        .broker
        .consume_with(test_queue("jobs"), move |_batch: Batch| {
            let slot = Arc::clone(&slot);
            async move {
                *slot.lock().unwrap() = Some(tokio::time::Instant::now());
                ok()
            }
        })
        .unwrap();
    let mut rx = consumer.subscribe();
    collect_until(&mut rx, |r| total_acked(r) >= 1).await;
    consumer.shutdown().await.unwrap();

    let at = delivered_at.lock().unwrap().unwrap();
    assert!(at - started >= Duration::from_secs(2));
}
