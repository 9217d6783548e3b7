use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::broker::controller::ControllerRegistry;
use crate::broker::metrics::Metrics;
use crate::clock::Clock;
use crate::error::{RouteError, StoreError};
use crate::message::{DeadLetterInfo, LeaseToken, Message, MessageId, NewMessage};
use crate::store::QueueStore;

/// Where an exhausted message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    Routed { queue: String, id: MessageId },
    Discarded,
}

/// Moves exhausted messages into a dead-letter queue. The DLQ is an
/// ordinary queue: routing is an enqueue plus a delete of the original.
#[derive(Clone)]
pub struct DeadLetterRouter {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    controllers: Arc<ControllerRegistry>,
    metrics: Arc<Metrics>,
}

impl DeadLetterRouter {
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        controllers: Arc<ControllerRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            clock,
            controllers,
            metrics,
        }
    }

    /// Route `message` to `dead_letter_queue`, or discard it when none is
    /// configured. The original is deleted only after the DLQ copy is stored,
    /// so a failed enqueue leaves it leased and eligible for redelivery.
    ///
    /// `message` must be the copy from the caller's lease. If it has been
    /// leased again since, nothing is moved and the error is
    /// `StoreError::LeaseLost`.
    pub fn route(
        &self,
        message: &Message,
        dead_letter_queue: Option<&str>,
        reason: &str,
    ) -> Result<DeadLetterOutcome, RouteError> {
        let lease = message.lease();
        let Some(dlq) = dead_letter_queue else {
            self.store.delete(&lease)?;
            self.metrics.record_discarded(&message.queue);
            warn!(
                queue = %message.queue,
                msg_id = %message.id,
                attempts = message.attempts,
                %reason,
                "exhausted message discarded, no dead-letter queue configured"
            );
            return Ok(DeadLetterOutcome::Discarded);
        };

        match self.store.get(&message.id)? {
            Some(current) if current.attempts != lease.attempt => {
                return Err(StoreError::LeaseLost(message.id).into())
            }
            _ => {}
        }

        let now = self.clock.now_ms();
        let copy = NewMessage {
            headers: message.headers.clone(),
            body: message.body.clone(),
            visible_at: now,
            dead_letter: Some(DeadLetterInfo {
                original_queue: message.queue.clone(),
                original_id: message.id,
                attempts: message.attempts,
                failed_at: now,
                reason: reason.to_string(),
            }),
        };
        let id = self.store.enqueue(dlq, copy).map_err(RouteError::Enqueue)?;
        if let Err(err) = self.store.delete(&lease) {
            // The original stays put, so the copy must go.
            let copy = LeaseToken { id, attempt: 0 };
            if let Err(undo) = self.store.delete(&copy) {
                warn!(
                    dlq = %dlq,
                    dlq_msg_id = %id,
                    error = %undo,
                    "failed to withdraw dead-letter copy"
                );
            }
            return Err(err.into());
        }
        self.controllers.controller(dlq).record_enqueued(1);
        self.metrics.record_dead_lettered(&message.queue);

        debug!(
            queue = %message.queue,
            msg_id = %message.id,
            dlq = %dlq,
            dlq_msg_id = %id,
            attempts = message.attempts,
            "message moved to dead-letter queue"
        );
        Ok(DeadLetterOutcome::Routed {
            queue: dlq.to_string(),
            id,
        })
    }

    /// Move up to `count` messages from a dead-letter queue back to the
    /// queues they came from, as fresh messages. Returns how many moved.
    /// Each message is held under a `lease_window` lease while it moves.
    ///
    /// Messages with no dead-letter metadata are released untouched.
    #[tracing::instrument(skip(self))]
    pub fn redrive(
        &self,
        dlq: &str,
        count: usize,
        lease_window: Duration,
    ) -> Result<usize, RouteError> {
        let mut moved = 0;

        while moved < count {
            let leased = self.store.lease_batch(dlq, count - moved, lease_window)?;
            if leased.is_empty() {
                break;
            }
            let mut progressed = false;
            for msg in leased {
                let Some(info) = msg.dead_letter.as_ref() else {
                    warn!(msg_id = %msg.id, "message has no dead-letter metadata, releasing");
                    self.store.make_visible_at(&msg.lease(), self.clock.now_ms())?;
                    continue;
                };
                let fresh = NewMessage {
                    headers: msg.headers.clone(),
                    body: msg.body.clone(),
                    visible_at: self.clock.now_ms(),
                    dead_letter: None,
                };
                self.store
                    .enqueue(&info.original_queue, fresh)
                    .map_err(RouteError::Enqueue)?;
                self.controllers
                    .controller(&info.original_queue)
                    .record_enqueued(1);
                self.store.delete(&msg.lease())?;
                moved += 1;
                progressed = true;
            }
            // Only unredrivable messages were visible; leasing again would
            // return the same ones.
            if !progressed {
                break;
            }
        }

        info!(moved, "redrive complete");
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        router: DeadLetterRouter,
        controllers: Arc<ControllerRegistry>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(5_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let controllers = Arc::new(ControllerRegistry::default());
        let router = DeadLetterRouter::new(
            store.clone(),
            clock.clone(),
            controllers.clone(),
            Arc::new(Metrics::new()),
        );
        Fixture {
            clock,
            store,
            router,
            controllers,
        }
    }

    fn leased_message(f: &Fixture, queue: &str) -> Message {
        let mut new = NewMessage {
            body: b"boom".to_vec(),
            ..Default::default()
        };
        new.headers.insert("tenant".into(), "acme".into());
        f.store.enqueue(queue, new).unwrap();
        f.store
            .lease_batch(queue, 1, Duration::from_secs(30))
            .unwrap()
            .remove(0)
    }

    #[test]
    fn routes_with_metadata_and_removes_original() {
        let f = fixture();
        let msg = leased_message(&f, "orders");

        let outcome = f.router.route(&msg, Some("orders-dlq"), "handler failed").unwrap();
        let DeadLetterOutcome::Routed { queue, id } = outcome else {
            panic!("expected routed outcome");
        };
        assert_eq!(queue, "orders-dlq");
        assert!(f.store.get(&msg.id).unwrap().is_none());

        let dead = f.store.get(&id).unwrap().unwrap();
        assert_eq!(dead.queue, "orders-dlq");
        assert_eq!(dead.body, b"boom");
        assert_eq!(dead.headers.get("tenant").map(String::as_str), Some("acme"));
        let info = dead.dead_letter.unwrap();
        assert_eq!(info.original_queue, "orders");
        assert_eq!(info.original_id, msg.id);
        assert_eq!(info.attempts, 1);
        assert_eq!(info.failed_at, 5_000);
        assert_eq!(info.reason, "handler failed");
        assert_eq!(f.controllers.controller("orders-dlq").backlog_estimate(), 1);
    }

    #[test]
    fn discards_without_dlq() {
        let f = fixture();
        let msg = leased_message(&f, "orders");
        let outcome = f.router.route(&msg, None, "handler failed").unwrap();
        assert_eq!(outcome, DeadLetterOutcome::Discarded);
        assert!(f.store.get(&msg.id).unwrap().is_none());
    }

    #[test]
    fn store_outage_keeps_original() {
        let f = fixture();
        let msg = leased_message(&f, "orders");
        f.store.set_unavailable(true);
        let err = f.router.route(&msg, Some("orders-dlq"), "x").unwrap_err();
        assert!(matches!(err, RouteError::Store(StoreError::Unavailable(_))));
        assert!(!err.is_lease_lost());
        f.store.set_unavailable(false);
        assert!(f.store.get(&msg.id).unwrap().is_some());
    }

    #[test]
    fn stale_copy_is_not_routed() {
        let f = fixture();
        let stale = leased_message(&f, "orders");
        f.clock.advance(Duration::from_secs(31));
        let live = f
            .store
            .lease_batch("orders", 1, Duration::from_secs(30))
            .unwrap()
            .remove(0);

        let err = f.router.route(&stale, Some("orders-dlq"), "x").unwrap_err();
        assert!(err.is_lease_lost());
        let err = f.router.route(&stale, None, "x").unwrap_err();
        assert!(err.is_lease_lost());

        assert!(f.store.messages("orders-dlq").unwrap().is_empty());
        assert_eq!(f.store.get(&live.id).unwrap().unwrap().attempts, 2);
        assert_eq!(f.controllers.controller("orders-dlq").backlog_estimate(), 0);
    }

    #[test]
    fn redrive_returns_messages_to_origin() {
        let f = fixture();
        for _ in 0..3 {
            let msg = leased_message(&f, "orders");
            f.router.route(&msg, Some("orders-dlq"), "x").unwrap();
        }

        let moved = f.router.redrive("orders-dlq", 2, Duration::from_secs(30)).unwrap();
        assert_eq!(moved, 2);
        assert_eq!(f.store.messages("orders-dlq").unwrap().len(), 1);

        let back = f.store.messages("orders").unwrap();
        assert_eq!(back.len(), 2);
        for msg in back {
            assert_eq!(msg.attempts, 0);
            assert!(msg.dead_letter.is_none());
            assert_eq!(msg.headers.get("tenant").map(String::as_str), Some("acme"));
        }
    }

    #[test]
    fn redrive_releases_messages_without_metadata() {
        let f = fixture();
        f.store
            .enqueue(
                "orders-dlq",
                NewMessage {
                    body: b"stray".to_vec(),
                    ..Default::default()
                },
            )
            .unwrap();

        let moved = f.router.redrive("orders-dlq", 10, Duration::from_secs(30)).unwrap();
        assert_eq!(moved, 0);
        let stray = f.store.messages("orders-dlq").unwrap();
        assert_eq!(stray.len(), 1);
        assert_eq!(stray[0].visible_at, f.clock.now_ms());
    }
}
