use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type MessageId = Uuid;

/// Core message domain type, as held by the queue store and handed to
/// consumers inside a `Batch`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub queue: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Unix millis, set once by the store.
    pub enqueued_at: u64,
    /// Unix millis after which the message may be leased.
    pub visible_at: u64,
    /// Delivery count: 0 until first leased, then 1, 2, ...
    pub attempts: u32,
    pub dead_letter: Option<DeadLetterInfo>,
}

impl Message {
    /// Generate a new UUIDv7 message ID.
    pub fn new_id() -> MessageId {
        Uuid::now_v7()
    }

    /// Token for the lease this copy of the message was delivered under.
    pub fn lease(&self) -> LeaseToken {
        LeaseToken {
            id: self.id,
            attempt: self.attempts,
        }
    }

    /// Decode a JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Names one lease of a message: its id plus the delivery number the lease
/// was taken at. Every lease bumps `attempts`, so a token stops matching as
/// soon as the message is leased again. Store mutations are checked against
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken {
    pub id: MessageId,
    pub attempt: u32,
}

/// Metadata attached to a message moved into a dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterInfo {
    pub original_queue: String,
    pub original_id: MessageId,
    pub attempts: u32,
    /// Unix millis of the final failed delivery.
    pub failed_at: u64,
    pub reason: String,
}

/// A message as handed to `QueueStore::enqueue`. The store assigns the id
/// and `enqueued_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewMessage {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub visible_at: u64,
    pub dead_letter: Option<DeadLetterInfo>,
}

/// Counts of messages in a queue by visibility state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Visible and eligible for delivery now.
    pub ready: u64,
    /// Not yet visible and not leased (delayed sends, retry backoff).
    pub delayed: u64,
    /// Leased by a batch whose visibility window has not lapsed.
    pub in_flight: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.ready + self.delayed + self.in_flight
    }
}
