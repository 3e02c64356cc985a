//! Background job execution core.
//!
//! This crate provides:
//! - A queue backend over Redis Streams, with an in-process fallback
//! - The job record store and the buffered job log sink
//! - The job event bus (Redis Pub/Sub or in-process)
//! - The processor registry and progress handle given to processors

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod logs;
pub mod metrics;
pub mod processor;
pub mod progress;
pub mod retry;
pub mod shutdown;
pub mod store;

pub use backend::{connect, FallbackBackend, QueueBackend, RedisBackend, SharedQueue};
pub use config::{ProcessRole, QueueConfig, QueueMode};
pub use dispatch::{Execution, JobCore};
pub use error::{QueueError, QueueResult};
pub use events::{EventBus, EventPredicate, EventStream, EventSubscription, LocalEventBus, RedisEventBus};
pub use logs::{JobLogSink, JobLogStore, MemoryLogStore, RedisLogStore};
pub use processor::{JobProcessor, ProcessorError, ProcessorRegistry, ValidationError};
pub use progress::ProgressHandle;
pub use store::{JobOutcome, JobStore, MemoryJobStore, RedisJobStore};
