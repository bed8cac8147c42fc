//! Channel consumers: bounded concurrency plus an arrival-rate cap.
//!
//! The semaphore bounds how many jobs of one channel run at once; the rate
//! limiter spaces job starts independently of concurrency. Both live here,
//! not in the adapters.

use async_trait::async_trait;
use chrono::Utc;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use outreach_core::config::ChannelLimit;
use outreach_core::error::{OutreachError, Result};
use outreach_core::types::{Channel, ChannelJob};
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};

use crate::job::QueuedJob;
use crate::queue::JobQueue;

/// Handler failure, telling the consumer whether another delivery may help.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("retryable: {0}")]
    Retry(String),
    #[error("non-retryable: {0}")]
    NonRetry(String),
}

/// Delivery metadata handed to the handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    /// 1-based delivery number.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobContext {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ChannelJob, ctx: &JobContext) -> std::result::Result<(), JobError>;
}

/// Spaces successive starts at least `1s / per_second` apart. Zero means
/// no cap.
pub struct RateLimiter {
    inner: Option<governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimiter {
    pub fn per_second(per_second: u32) -> Self {
        let inner = NonZeroU32::new(per_second)
            .map(|rate| governor::RateLimiter::direct(Quota::per_second(rate).allow_burst(NonZeroU32::MIN)));
        Self { inner }
    }

    pub async fn wait(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready().await;
        }
    }
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    active: AtomicU64,
}

/// Consumer counters for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStats {
    pub channel: Channel,
    pub concurrency: usize,
    pub per_second: u32,
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub active: u64,
}

pub struct ChannelConsumer {
    channel: Channel,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    limit: ChannelLimit,
    semaphore: Arc<Semaphore>,
    rate: RateLimiter,
    counters: Counters,
    poll_interval: Duration,
}

impl ChannelConsumer {
    pub fn new(channel: Channel, queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>, limit: ChannelLimit) -> Self {
        let concurrency = limit.concurrency.max(1);
        Self {
            channel,
            queue,
            handler,
            limit: ChannelLimit {
                concurrency,
                per_second: limit.per_second,
            },
            semaphore: Arc::new(Semaphore::new(concurrency)),
            rate: RateLimiter::per_second(limit.per_second),
            counters: Counters::default(),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            channel: self.channel,
            concurrency: self.limit.concurrency,
            per_second: self.limit.per_second,
            processed: self.counters.processed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
        }
    }

    /// Consume until `shutdown` flips to true, then wait for in-flight jobs.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "👷 Consumer for {} started (concurrency={}, rate={}/s)",
            self.channel.queue_name(),
            self.limit.concurrency,
            self.limit.per_second
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.next_job().await {
                Ok(Some(job)) => {
                    self.rate.wait().await;
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.execute(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.idle(&mut shutdown).await;
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!("⚠️ Consumer {} poll failed: {e}", self.channel.queue_name());
                    self.idle(&mut shutdown).await;
                }
            }
        }

        // Wait for in-flight jobs
        let _ = self.semaphore.acquire_many(self.limit.concurrency as u32).await;
        tracing::info!("👷 Consumer for {} stopped", self.channel.queue_name());
    }

    /// Take and run one job inline. Returns whether a job was found.
    pub async fn process_one(&self) -> Result<bool> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| OutreachError::Queue(format!("consumer closed: {e}")))?;
        match self.next_job().await? {
            Some(job) => {
                self.rate.wait().await;
                self.execute(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn next_job(&self) -> Result<Option<QueuedJob>> {
        let backend = self
            .queue
            .backend()
            .ok_or_else(|| OutreachError::Queue("no queue backend".into()))?;
        let name = self.channel.queue_name();
        let promoted = backend.promote_due(name, Utc::now()).await?;
        if promoted > 0 {
            tracing::debug!("⏰ {} delayed job(s) due on {}", promoted, name);
        }
        backend.pop(name).await
    }

    async fn execute(&self, mut job: QueuedJob) {
        job.attempts_made += 1;
        let ctx = JobContext {
            job_id: job.id.clone(),
            attempt: job.attempts_made,
            max_attempts: job.max_attempts,
        };
        let attempt_id = job.payload.attempt_id.clone();
        self.counters.active.fetch_add(1, Ordering::Relaxed);

        match self.handler.handle(&job.payload, &ctx).await {
            Ok(()) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(JobError::Retry(msg)) if job.retry_policy().can_retry(job.attempts_made) => {
                let delay = job.retry_policy().delay_after(job.attempts_made);
                tracing::warn!(
                    "🔁 attempt={} channel={} delivery {}/{} failed, retrying in {:?}: {}",
                    attempt_id,
                    self.channel,
                    ctx.attempt,
                    ctx.max_attempts,
                    delay,
                    msg
                );
                match self.queue.requeue_delayed(self.channel, &job, delay).await {
                    Ok(()) => {
                        self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::error!("❌ attempt={} requeue failed: {e}", attempt_id);
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    "❌ attempt={} channel={} job {} failed: {}",
                    attempt_id,
                    self.channel,
                    ctx.job_id,
                    e
                );
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.counters.active.fetch_sub(1, Ordering::Relaxed);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }
}
