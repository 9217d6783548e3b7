pub mod broker;
pub mod clock;
pub mod error;
pub mod message;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use broker::{
    Batch, BatchHandler, BatchReport, Broker, Consumer, FerryConfig, InvocationOutcome,
    OutgoingMessage, Producer, QueueStats,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{
    ConfigError, ConsumerError, ExtendError, HandlerError, ResolveError, RouteError, SendError,
    StoreError, StoreResult,
};
pub use message::{DeadLetterInfo, LeaseToken, Message, MessageId, NewMessage, QueueDepth};
pub use queue::{QueueConfig, RetryPolicy};
pub use store::{MemoryStore, QueueStore};
