//! Storage seam behind `JobQueue`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_core::error::Result;
use serde::Serialize;

use crate::job::QueuedJob;

/// Jobs waiting in one named queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Connectivity probe.
    async fn ping(&self) -> Result<()>;

    async fn push(&self, queue: &str, job: &QueuedJob) -> Result<()>;

    /// Park a job until `run_at`; `promote_due` moves it back to waiting.
    async fn push_delayed(&self, queue: &str, job: &QueuedJob, run_at: DateTime<Utc>) -> Result<()>;

    /// Move delayed jobs whose time has come to the waiting list.
    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<usize>;

    /// Take the oldest waiting job.
    async fn pop(&self, queue: &str) -> Result<Option<QueuedJob>>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts>;

    /// Drop connections. A later call reconnects lazily.
    async fn close(&self);
}
