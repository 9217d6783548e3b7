//! In-memory queue store.
//!
//! Fully functional reference implementation of [`QueueStore`]: delays,
//! visibility timeouts and attempt counting behave exactly as the trait
//! describes. Nothing survives a restart. Used by tests and by embedders
//! that only need an in-process queue.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::clock::{after, Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::message::{LeaseToken, Message, MessageId, NewMessage, QueueDepth};
use crate::store::traits::QueueStore;

struct Entry {
    message: Message,
    /// Set by `lease_batch`, cleared by `make_visible_at`.
    leased: bool,
}

#[derive(Default)]
struct State {
    messages: HashMap<MessageId, Entry>,
    by_queue: HashMap<String, HashSet<MessageId>>,
}

impl State {
    /// The entry `lease` still owns.
    fn owned(&mut self, lease: &LeaseToken) -> StoreResult<&mut Entry> {
        let entry = self
            .messages
            .get_mut(&lease.id)
            .ok_or(StoreError::MessageNotFound(lease.id))?;
        if entry.message.attempts != lease.attempt {
            return Err(StoreError::LeaseLost(lease.id));
        }
        Ok(entry)
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: while set, every operation fails with
    /// `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every message in `queue`, leased or not, ordered by
    /// enqueue time.
    pub fn messages(&self, queue: &str) -> StoreResult<Vec<Message>> {
        let state = self.state()?;
        let mut out: Vec<Message> = state
            .by_queue
            .get(queue)
            .into_iter()
            .flatten()
            .filter_map(|id| state.messages.get(id))
            .map(|e| e.message.clone())
            .collect();
        out.sort_by_key(|m| (m.enqueued_at, m.id));
        Ok(out)
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("store state lock poisoned".into()))
    }
}

impl QueueStore for MemoryStore {
    fn enqueue(&self, queue: &str, message: NewMessage) -> StoreResult<MessageId> {
        let mut state = self.state()?;
        let id = Message::new_id();
        let msg = Message {
            id,
            queue: queue.to_string(),
            headers: message.headers,
            body: message.body,
            enqueued_at: self.clock.now_ms(),
            visible_at: message.visible_at,
            attempts: 0,
            dead_letter: message.dead_letter,
        };
        state.messages.insert(
            id,
            Entry {
                message: msg,
                leased: false,
            },
        );
        state
            .by_queue
            .entry(queue.to_string())
            .or_default()
            .insert(id);
        Ok(id)
    }

    fn lease_batch(
        &self,
        queue: &str,
        max_size: usize,
        visibility_window: Duration,
    ) -> StoreResult<Vec<Message>> {
        let mut state = self.state()?;
        let now = self.clock.now_ms();

        let Some(ids) = state.by_queue.get(queue) else {
            return Ok(Vec::new());
        };
        let mut eligible: Vec<(u64, u64, MessageId)> = ids
            .iter()
            .filter_map(|id| state.messages.get(id))
            .filter(|e| e.message.visible_at <= now)
            .map(|e| (e.message.visible_at, e.message.enqueued_at, e.message.id))
            .collect();
        eligible.sort_unstable();
        eligible.truncate(max_size);

        let visible_at = after(now, visibility_window);
        let mut leased = Vec::with_capacity(eligible.len());
        for (_, _, id) in eligible {
            if let Some(entry) = state.messages.get_mut(&id) {
                entry.message.attempts = entry.message.attempts.saturating_add(1);
                entry.message.visible_at = visible_at;
                entry.leased = true;
                leased.push(entry.message.clone());
            }
        }
        if !leased.is_empty() {
            debug!(%queue, count = leased.len(), "leased messages");
        }
        Ok(leased)
    }

    fn delete(&self, lease: &LeaseToken) -> StoreResult<()> {
        let mut state = self.state()?;
        let queue = match state.owned(lease) {
            Ok(entry) => entry.message.queue.clone(),
            Err(StoreError::MessageNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        state.messages.remove(&lease.id);
        if let Some(ids) = state.by_queue.get_mut(&queue) {
            ids.remove(&lease.id);
        }
        Ok(())
    }

    fn extend_visibility(&self, lease: &LeaseToken, delay: Duration) -> StoreResult<()> {
        let mut state = self.state()?;
        let now = self.clock.now_ms();
        let entry = state.owned(lease)?;
        entry.message.visible_at = after(now, delay);
        entry.leased = true;
        Ok(())
    }

    fn make_visible_at(&self, lease: &LeaseToken, timestamp_ms: u64) -> StoreResult<()> {
        let mut state = self.state()?;
        let entry = state.owned(lease)?;
        entry.message.visible_at = timestamp_ms;
        entry.leased = false;
        Ok(())
    }

    fn get(&self, id: &MessageId) -> StoreResult<Option<Message>> {
        let state = self.state()?;
        Ok(state.messages.get(id).map(|e| e.message.clone()))
    }

    fn depth(&self, queue: &str) -> StoreResult<QueueDepth> {
        let state = self.state()?;
        let now = self.clock.now_ms();
        let mut depth = QueueDepth::default();
        for entry in state
            .by_queue
            .get(queue)
            .into_iter()
            .flatten()
            .filter_map(|id| state.messages.get(id))
        {
            if entry.message.visible_at <= now {
                depth.ready += 1;
            } else if entry.leased {
                depth.in_flight += 1;
            } else {
                depth.delayed += 1;
            }
        }
        Ok(depth)
    }
}
