use crate::message::MessageId;

/// Low-level queue store errors.
/// This is the error type for the `QueueStore` trait: store operations can only
/// fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// The message was leased again after the caller's lease lapsed.
    #[error("lease lost on message {0}")]
    LeaseLost(MessageId),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// --- Per-operation error types ---
//
// Each operation returns only the errors it can produce. All embed
// `StoreError` via `#[from]` so `?` works on store calls.

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("payload too large: {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid delay: {delay_ms}ms exceeds maximum of {max_ms}ms")]
    InvalidDelay { delay_ms: u64, max_ms: u64 },

    #[error("batch too large: {count} items exceeds limit of {max}")]
    BatchTooLarge { count: usize, max: usize },

    #[error("invalid queue name: {0:?}")]
    InvalidQueueName(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by `Batch::ack` / `Batch::retry`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("message {0} is not part of this batch")]
    NotInBatch(MessageId),

    #[error("message {0} already has a different resolution")]
    AlreadyResolved(MessageId),

    #[error("batch is closed")]
    BatchClosed,
}

/// Errors returned by `Batch::extend_visibility`.
#[derive(Debug, thiserror::Error)]
pub enum ExtendError {
    #[error("message {0} is not part of this batch")]
    NotInBatch(MessageId),

    #[error("batch is closed")]
    BatchClosed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("dead-letter enqueue failed: {0}")]
    Enqueue(StoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("no configuration for queue: {0}")]
    UnknownQueue(String),

    #[error("consumer task panicked")]
    SupervisorPanicked,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl RouteError {
    /// True when the message changed hands before it could be routed.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, RouteError::Store(StoreError::LeaseLost(_)))
    }
}

/// Error type user processing logic returns from a batch invocation.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
