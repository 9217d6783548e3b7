use std::time::Duration;

use crate::error::StoreResult;
use crate::message::{LeaseToken, Message, MessageId, NewMessage, QueueDepth};

/// The queue store: durable (or not) storage of messages keyed by queue name.
///
/// Implementations must be thread-safe and must serialize mutations of a
/// single message, so that two batches never hold the same lease. Every
/// mutation of a leased message names the lease it acts under and fails with
/// `StoreError::LeaseLost` once the message has been leased again. All calls
/// are expected to be short; none of them wait for messages to arrive.
pub trait QueueStore: Send + Sync {
    /// Store a new message in `queue`, assigning its id and `enqueued_at`.
    fn enqueue(&self, queue: &str, message: NewMessage) -> StoreResult<MessageId>;

    /// Lease up to `max_size` messages whose `visible_at <= now`.
    ///
    /// Each leased message has `attempts` incremented and `visible_at`
    /// pushed to `now + visibility_window`. Returns immediately, possibly
    /// with an empty vector.
    fn lease_batch(
        &self,
        queue: &str,
        max_size: usize,
        visibility_window: Duration,
    ) -> StoreResult<Vec<Message>>;

    /// Permanently remove a message. Deleting an unknown id is a no-op.
    fn delete(&self, lease: &LeaseToken) -> StoreResult<()>;

    /// Push a leased message's `visible_at` to `now + delay`. A lapsed lease
    /// that nobody has taken over is renewed.
    fn extend_visibility(&self, lease: &LeaseToken, delay: Duration) -> StoreResult<()>;

    /// Release a message so it becomes visible at `timestamp_ms`.
    fn make_visible_at(&self, lease: &LeaseToken, timestamp_ms: u64) -> StoreResult<()>;

    /// Read a message without leasing it.
    fn get(&self, id: &MessageId) -> StoreResult<Option<Message>>;

    /// Count messages in `queue` by visibility state.
    fn depth(&self, queue: &str) -> StoreResult<QueueDepth>;
}
