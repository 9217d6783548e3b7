use crate::broker::controller::ControllerSnapshot;
use crate::message::QueueDepth;

/// Aggregate stats for a single queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: String,
    /// Authoritative counts from the store.
    pub depth: QueueDepth,
    /// In-process view: backlog estimate, active invocations and target.
    pub concurrency: ControllerSnapshot,
}
