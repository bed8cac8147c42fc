//! # Outreach Queue
//! One durable queue per channel, with a detectable "backend unavailable"
//! state so callers can fall back to direct dispatch.
//!
//! Delivery is at-least-once: a job may run again after a crash or retry, so
//! handlers must be idempotent on the attempt they carry.

pub mod backend;
pub mod consumer;
pub mod job;
pub mod memory;
pub mod queue;
pub mod redis_backend;
pub mod retry;

pub use backend::{QueueBackend, QueueCounts};
pub use consumer::{ChannelConsumer, ConsumerStats, JobContext, JobError, JobHandler, RateLimiter};
pub use job::QueuedJob;
pub use memory::MemoryBackend;
pub use queue::{ChannelQueueStats, JobQueue, QueueHandle};
pub use redis_backend::RedisBackend;
pub use retry::RetryPolicy;
