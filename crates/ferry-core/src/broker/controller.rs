//! Backlog-driven concurrency control.
//!
//! One `ConcurrencyController` exists per queue, handed out by a shared
//! `ControllerRegistry`. Producers bump the backlog estimate; consumer
//! workers hold an `InvocationSlot` each and report poll results, which is
//! where scaling decisions are made.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

/// Default ceiling on concurrent invocations when a queue sets no limit.
pub const DEFAULT_MAX_CONCURRENCY: usize = 250;

#[derive(Debug)]
struct ScalingState {
    consecutive_empty_polls: u32,
    last_backlog: u64,
}

#[derive(Debug)]
pub struct ConcurrencyController {
    queue: String,
    active_invocations: AtomicUsize,
    backlog_estimate: AtomicU64,
    target: AtomicUsize,
    concurrency_limit: RwLock<Option<usize>>,
    max_concurrency: AtomicUsize,
    scale_down_after: AtomicU64,
    scaling: Mutex<ScalingState>,
}

/// Snapshot of a controller, for stats and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub active_invocations: usize,
    pub backlog_estimate: u64,
    pub target: usize,
    pub ceiling: usize,
}

impl ConcurrencyController {
    pub fn new(queue: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            queue: queue.into(),
            active_invocations: AtomicUsize::new(0),
            backlog_estimate: AtomicU64::new(0),
            target: AtomicUsize::new(1),
            concurrency_limit: RwLock::new(None),
            max_concurrency: AtomicUsize::new(max_concurrency.max(1)),
            scale_down_after: AtomicU64::new(3),
            scaling: Mutex::new(ScalingState {
                consecutive_empty_polls: 0,
                last_backlog: 0,
            }),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Apply a consumer's settings. Called when a consumer starts.
    pub fn configure(
        &self,
        concurrency_limit: Option<usize>,
        max_concurrency: usize,
        scale_down_after_empty_polls: u32,
    ) {
        if let Ok(mut limit) = self.concurrency_limit.write() {
            *limit = concurrency_limit;
        }
        self.max_concurrency
            .store(max_concurrency.max(1), Ordering::SeqCst);
        self.scale_down_after
            .store(u64::from(scale_down_after_empty_polls.max(1)), Ordering::SeqCst);
        let ceiling = self.ceiling();
        self.target.fetch_min(ceiling, Ordering::SeqCst);
    }

    /// Upper bound on the target: the queue's limit if set, else the
    /// auto-scaling ceiling.
    pub fn ceiling(&self) -> usize {
        let limit = self.concurrency_limit.read().ok().and_then(|l| *l);
        limit
            .unwrap_or_else(|| self.max_concurrency.load(Ordering::SeqCst))
            .max(1)
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    pub fn active_invocations(&self) -> usize {
        self.active_invocations.load(Ordering::SeqCst)
    }

    pub fn backlog_estimate(&self) -> u64 {
        self.backlog_estimate.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            active_invocations: self.active_invocations(),
            backlog_estimate: self.backlog_estimate(),
            target: self.target(),
            ceiling: self.ceiling(),
        }
    }

    pub fn record_enqueued(&self, count: u64) {
        self.backlog_estimate.fetch_add(count, Ordering::SeqCst);
    }

    pub fn record_dequeued(&self, count: u64) {
        let _ = self
            .backlog_estimate
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| {
                Some(b.saturating_sub(count))
            });
    }

    /// Replace the estimate with an authoritative count from the store.
    pub fn resync_backlog(&self, ready: u64) {
        self.backlog_estimate.store(ready, Ordering::SeqCst);
    }

    /// Claim a slot if fewer slots are held than the target allows.
    pub fn try_acquire(self: &Arc<Self>) -> Option<InvocationSlot> {
        let target = self.target();
        self.active_invocations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < target).then_some(active + 1)
            })
            .ok()
            .map(|_| InvocationSlot {
                controller: Arc::clone(self),
                released: false,
            })
    }

    /// Give a slot back if more slots are held than the target allows.
    /// Returns true when the slot was released and its worker should stop.
    pub fn try_retire(&self, slot: &mut InvocationSlot) -> bool {
        if slot.released {
            return true;
        }
        let target = self.target();
        let retired = self
            .active_invocations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active > target).then(|| active - 1)
            })
            .is_ok();
        if retired {
            slot.released = true;
        }
        retired
    }

    /// A poll returned `delivered` messages (at least one). Grows the target
    /// when the backlog is not shrinking and more full batches are waiting
    /// than there are workers to take them.
    pub fn observe_batch(&self, delivered: usize, max_batch_size: usize) {
        self.record_dequeued(delivered as u64);
        let backlog = self.backlog_estimate();
        let ceiling = self.ceiling();

        let Ok(mut scaling) = self.scaling.lock() else {
            return;
        };
        scaling.consecutive_empty_polls = 0;
        let growing = backlog >= scaling.last_backlog;
        scaling.last_backlog = backlog;

        let waiting = backlog.div_ceil(max_batch_size.max(1) as u64);
        let needed = usize::try_from(waiting).unwrap_or(usize::MAX);
        let target = self.target();
        if growing && needed > target && target < ceiling {
            let next = needed.min(target.saturating_mul(2)).max(target + 1).min(ceiling);
            self.target.store(next, Ordering::SeqCst);
            debug!(queue = %self.queue, from = target, to = next, backlog, "scaling up");
        }
    }

    /// A poll came back empty. After enough consecutive empty polls the
    /// target halves (never below 1). Returns true when it scaled down.
    pub fn observe_empty_poll(&self) -> bool {
        let Ok(mut scaling) = self.scaling.lock() else {
            return false;
        };
        scaling.consecutive_empty_polls += 1;
        if u64::from(scaling.consecutive_empty_polls) < self.scale_down_after.load(Ordering::SeqCst)
        {
            return false;
        }
        scaling.consecutive_empty_polls = 0;
        scaling.last_backlog = 0;

        let target = self.target();
        let next = (target / 2).max(1);
        if next == target {
            return false;
        }
        self.target.store(next, Ordering::SeqCst);
        debug!(queue = %self.queue, from = target, to = next, "scaling down");
        true
    }
}

/// One concurrent consume cycle's claim on its controller. Released on drop.
#[derive(Debug)]
pub struct InvocationSlot {
    controller: Arc<ConcurrencyController>,
    released: bool,
}

impl Drop for InvocationSlot {
    fn drop(&mut self) {
        if !self.released {
            self.controller
                .active_invocations
                .fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Shared, injectable map of per-queue controllers.
#[derive(Debug)]
pub struct ControllerRegistry {
    controllers: RwLock<HashMap<String, Arc<ConcurrencyController>>>,
    max_concurrency: usize,
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl ControllerRegistry {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            controllers: RwLock::new(HashMap::new()),
            max_concurrency,
        }
    }

    /// Controller for `queue`, created on first use.
    pub fn controller(&self, queue: &str) -> Arc<ConcurrencyController> {
        if let Some(existing) = self
            .controllers
            .read()
            .ok()
            .and_then(|map| map.get(queue).cloned())
        {
            return existing;
        }
        match self.controllers.write() {
            Ok(mut map) => Arc::clone(map.entry(queue.to_string()).or_insert_with(|| {
                Arc::new(ConcurrencyController::new(queue, self.max_concurrency))
            })),
            // Poisoned: hand out a detached controller rather than failing the caller.
            Err(_) => Arc::new(ConcurrencyController::new(queue, self.max_concurrency)),
        }
    }
}
