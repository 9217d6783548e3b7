use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{ExtendError, ResolveError};
use crate::message::{Message, MessageId};
use crate::store::QueueStore;

/// Explicit per-message resolution recorded while a batch is being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Unresolved,
    Acked,
    /// `delay = None` means the queue's backoff for the current attempt.
    Retried { delay: Option<Duration> },
}

#[derive(Debug)]
struct RecordState {
    resolutions: HashMap<MessageId, Resolution>,
    closed: bool,
}

/// Acknowledgement record for one in-flight batch.
///
/// Shared between the `Batch` handed to user logic and the runtime, which
/// closes it and reads the final resolutions even if the invocation was
/// aborted while still holding its `Batch`.
#[derive(Debug)]
pub struct AckRecord {
    messages: Vec<Message>,
    state: Mutex<RecordState>,
}

impl AckRecord {
    pub fn new(messages: Vec<Message>) -> Self {
        let resolutions = messages
            .iter()
            .map(|m| (m.id, Resolution::Unresolved))
            .collect();
        Self {
            messages,
            state: Mutex::new(RecordState {
                resolutions,
                closed: false,
            }),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    fn state(&self) -> MutexGuard<'_, RecordState> {
        // The lock is never held across user code, so a poisoned lock still
        // guards a consistent map.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a resolution. The first explicit resolution of a message is
    /// final; repeating the same kind is a no-op.
    pub fn resolve(&self, id: &MessageId, resolution: Resolution) -> Result<(), ResolveError> {
        let mut state = self.state();
        if state.closed {
            return Err(ResolveError::BatchClosed);
        }
        let current = state
            .resolutions
            .get_mut(id)
            .ok_or(ResolveError::NotInBatch(*id))?;
        match (*current, resolution) {
            (_, Resolution::Unresolved) => Ok(()),
            (Resolution::Unresolved, r) => {
                *current = r;
                Ok(())
            }
            (Resolution::Acked, Resolution::Acked) => Ok(()),
            (Resolution::Retried { .. }, Resolution::Retried { .. }) => Ok(()),
            _ => Err(ResolveError::AlreadyResolved(*id)),
        }
    }

    /// Apply `resolution` to every message still unresolved.
    pub fn resolve_remaining(&self, resolution: Resolution) -> Result<(), ResolveError> {
        let mut state = self.state();
        if state.closed {
            return Err(ResolveError::BatchClosed);
        }
        for r in state.resolutions.values_mut() {
            if *r == Resolution::Unresolved {
                *r = resolution;
            }
        }
        Ok(())
    }

    /// Push the visibility of one message forward while the record is open.
    /// The record lock is held across the store call, so the batch cannot
    /// close in between.
    pub fn extend_visibility(
        &self,
        store: &dyn QueueStore,
        id: &MessageId,
        delay: Duration,
    ) -> Result<(), ExtendError> {
        let state = self.state();
        if state.closed {
            return Err(ExtendError::BatchClosed);
        }
        let msg = self
            .messages
            .iter()
            .find(|m| m.id == *id)
            .ok_or(ExtendError::NotInBatch(*id))?;
        store.extend_visibility(&msg.lease(), delay)?;
        Ok(())
    }

    pub fn resolution(&self, id: &MessageId) -> Option<Resolution> {
        self.state().resolutions.get(id).copied()
    }

    /// Close the record and return each message with its resolution, in
    /// batch order. Later `resolve` calls fail with `BatchClosed`.
    pub fn close(&self) -> Vec<(Message, Resolution)> {
        let mut state = self.state();
        state.closed = true;
        self.messages
            .iter()
            .map(|m| {
                let r = state
                    .resolutions
                    .get(&m.id)
                    .copied()
                    .unwrap_or(Resolution::Unresolved);
                (m.clone(), r)
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// A bounded group of leased messages handed to one invocation of user
/// processing logic.
///
/// Messages the logic neither acks nor retries get the batch-level outcome:
/// acked if the invocation returns `Ok`, retried with backoff otherwise.
pub struct Batch {
    queue_name: String,
    messages: Vec<Message>,
    record: Arc<AckRecord>,
    store: Arc<dyn QueueStore>,
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("queue_name", &self.queue_name)
            .field("messages", &self.messages)
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl Batch {
    /// Wrap messages leased from `store`.
    pub fn new(
        queue_name: impl Into<String>,
        messages: Vec<Message>,
        store: Arc<dyn QueueStore>,
    ) -> Self {
        let record = Arc::new(AckRecord::new(messages.clone()));
        Self {
            queue_name: queue_name.into(),
            messages,
            record,
            store,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Mark a message durably processed. Acking twice is a no-op.
    pub fn ack(&self, id: &MessageId) -> Result<(), ResolveError> {
        self.record.resolve(id, Resolution::Acked)
    }

    /// Mark a message for redelivery after `delay`, or after the queue's
    /// backoff when `None`.
    pub fn retry(&self, id: &MessageId, delay: Option<Duration>) -> Result<(), ResolveError> {
        self.record.resolve(id, Resolution::Retried { delay })
    }

    /// Keep a message hidden for another `delay`, for processing that runs
    /// past the queue's visibility timeout. Fails with
    /// `StoreError::LeaseLost` if the lease already lapsed and another batch
    /// took the message.
    pub fn extend_visibility(&self, id: &MessageId, delay: Duration) -> Result<(), ExtendError> {
        self.record.extend_visibility(self.store.as_ref(), id, delay)
    }

    pub fn ack_all(&self) -> Result<(), ResolveError> {
        self.record.resolve_remaining(Resolution::Acked)
    }

    pub fn retry_all(&self, delay: Option<Duration>) -> Result<(), ResolveError> {
        self.record.resolve_remaining(Resolution::Retried { delay })
    }

    /// Handle on the acknowledgement record, kept by the runtime.
    pub fn record(&self) -> Arc<AckRecord> {
        Arc::clone(&self.record)
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
