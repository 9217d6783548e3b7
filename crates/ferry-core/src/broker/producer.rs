use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::broker::config::ProducerConfig;
use crate::broker::controller::ControllerRegistry;
use crate::broker::metrics::Metrics;
use crate::clock::{after, Clock};
use crate::error::SendError;
use crate::message::{MessageId, NewMessage};
use crate::store::QueueStore;

/// One item of a `send_batch` call.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub delay: Duration,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Appends messages to named queues. Cheap to clone; all clones share the
/// store and the backlog counters.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    controllers: Arc<ControllerRegistry>,
    metrics: Arc<Metrics>,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        controllers: Arc<ControllerRegistry>,
        metrics: Arc<Metrics>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            controllers,
            metrics,
            config,
        }
    }

    /// Enqueue a single message, visible after `delay`.
    pub fn send(
        &self,
        queue: &str,
        body: impl Into<Vec<u8>>,
        delay: Duration,
    ) -> Result<MessageId, SendError> {
        self.send_message(queue, OutgoingMessage::new(body).with_delay(delay))
    }

    /// Serialize `value` as JSON and enqueue it.
    pub fn send_json<T: Serialize>(
        &self,
        queue: &str,
        value: &T,
        delay: Duration,
    ) -> Result<MessageId, SendError> {
        let body = serde_json::to_vec(value)?;
        self.send(queue, body, delay)
    }

    pub fn send_message(
        &self,
        queue: &str,
        message: OutgoingMessage,
    ) -> Result<MessageId, SendError> {
        validate_queue_name(queue)?;
        let new = self.prepare(message)?;
        let id = self.store.enqueue(queue, new)?;
        self.accepted(queue, 1);
        debug!(%queue, msg_id = %id, "message sent");
        Ok(id)
    }

    /// Enqueue several messages. Each item succeeds or fails on its own: an
    /// oversized body or bad delay fails only that item. The call as a whole
    /// fails, with nothing written, only when it carries more than
    /// `max_batch_items` items or names an invalid queue.
    pub fn send_batch(
        &self,
        queue: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<Vec<Result<MessageId, SendError>>, SendError> {
        validate_queue_name(queue)?;
        if messages.len() > self.config.max_batch_items {
            return Err(SendError::BatchTooLarge {
                count: messages.len(),
                max: self.config.max_batch_items,
            });
        }

        let results: Vec<Result<MessageId, SendError>> = messages
            .into_iter()
            .map(|message| {
                let new = self.prepare(message)?;
                Ok(self.store.enqueue(queue, new)?)
            })
            .collect();

        let accepted = results.iter().filter(|r| r.is_ok()).count() as u64;
        if accepted > 0 {
            self.accepted(queue, accepted);
        }
        debug!(%queue, accepted, rejected = results.len() as u64 - accepted, "batch sent");
        Ok(results)
    }

    fn prepare(&self, message: OutgoingMessage) -> Result<NewMessage, SendError> {
        if message.body.len() > self.config.max_body_bytes {
            return Err(SendError::PayloadTooLarge {
                size: message.body.len(),
                max: self.config.max_body_bytes,
            });
        }
        let delay_ms = u64::try_from(message.delay.as_millis()).unwrap_or(u64::MAX);
        if delay_ms > self.config.max_delay_ms {
            return Err(SendError::InvalidDelay {
                delay_ms,
                max_ms: self.config.max_delay_ms,
            });
        }
        Ok(NewMessage {
            headers: message.headers,
            body: message.body,
            visible_at: after(self.clock.now_ms(), message.delay),
            dead_letter: None,
        })
    }

    fn accepted(&self, queue: &str, count: u64) {
        self.controllers.controller(queue).record_enqueued(count);
        self.metrics.record_sent(queue, count);
    }
}

fn validate_queue_name(queue: &str) -> Result<(), SendError> {
    if queue.trim().is_empty() {
        return Err(SendError::InvalidQueueName(queue.to_string()));
    }
    Ok(())
}
