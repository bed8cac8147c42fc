//! Job Queue Abstraction: availability probing, lazy per-channel queues, enqueue.

use chrono::Utc;
use outreach_core::config::QueueConfig;
use outreach_core::error::Result;
use outreach_core::types::{Channel, ChannelJob};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::backend::{QueueBackend, QueueCounts};
use crate::job::QueuedJob;
use crate::redis_backend::RedisBackend;
use crate::retry::RetryPolicy;

/// A channel's queue, created on first successful use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub channel: Channel,
    pub name: &'static str,
}

/// Per-channel queue depth.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelQueueStats {
    pub channel: Channel,
    pub queue: &'static str,
    #[serde(flatten)]
    pub counts: QueueCounts,
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    available: bool,
    checked_at: Instant,
}

pub struct JobQueue {
    backend: Option<Arc<dyn QueueBackend>>,
    probe_ttl: Duration,
    retry: RetryPolicy,
    probe: Mutex<Option<Probe>>,
    handles: Mutex<HashMap<Channel, QueueHandle>>,
}

impl JobQueue {
    pub fn new(backend: Option<Arc<dyn QueueBackend>>, probe_ttl: Duration, retry: RetryPolicy) -> Self {
        Self {
            backend,
            probe_ttl,
            retry,
            probe: Mutex::new(None),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Redis-backed when a URL is configured, otherwise direct-send only.
    pub fn from_config(config: &QueueConfig) -> Self {
        let backend = config
            .redis_url
            .as_deref()
            .map(|url| Arc::new(RedisBackend::new(url)) as Arc<dyn QueueBackend>);
        if backend.is_none() {
            tracing::info!("📭 No queue backend configured, sends go direct");
        }
        Self::new(
            backend,
            Duration::from_secs(config.probe_ttl_secs),
            RetryPolicy::from_config(config),
        )
    }

    /// A queue with no backend: always unavailable.
    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(30), RetryPolicy::default())
    }

    pub fn backend(&self) -> Option<&Arc<dyn QueueBackend>> {
        self.backend.as_ref()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Probe connectivity; the answer is trusted for `probe_ttl`.
    pub async fn is_backend_available(&self) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        let mut probe = self.probe.lock().await;
        if let Some(p) = *probe {
            if p.checked_at.elapsed() < self.probe_ttl {
                return p.available;
            }
        }
        let available = match backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("⚠️ Queue backend '{}' unavailable: {e}", backend.name());
                false
            }
        };
        *probe = Some(Probe {
            available,
            checked_at: Instant::now(),
        });
        available
    }

    /// The channel's queue, or `None` while the backend is unavailable.
    pub async fn queue_for_channel(&self, channel: Channel) -> Option<QueueHandle> {
        if !self.is_backend_available().await {
            return None;
        }
        let mut handles = self.handles.lock().await;
        let handle = handles.entry(channel).or_insert_with(|| {
            tracing::debug!("📬 Queue '{}' opened", channel.queue_name());
            QueueHandle {
                channel,
                name: channel.queue_name(),
            }
        });
        Some(handle.clone())
    }

    /// Enqueue with the bounded retry policy. `false` means the caller must
    /// fall back; this never returns an error.
    pub async fn enqueue(&self, channel: Channel, job: ChannelJob) -> bool {
        let Some(handle) = self.queue_for_channel(channel).await else {
            return false;
        };
        let Some(backend) = &self.backend else {
            return false;
        };
        let attempt_id = job.attempt_id.clone();
        let queued = QueuedJob::new(job, &self.retry);
        match backend.push(handle.name, &queued).await {
            Ok(()) => {
                tracing::debug!("📥 Enqueued attempt {} on {}", attempt_id, handle.name);
                true
            }
            Err(e) => {
                tracing::warn!("⚠️ Enqueue failed for attempt {} on {}: {e}", attempt_id, handle.name);
                self.mark_unavailable().await;
                false
            }
        }
    }

    /// Park a job for a later delivery.
    pub async fn requeue_delayed(&self, channel: Channel, job: &QueuedJob, delay: Duration) -> Result<()> {
        match &self.backend {
            Some(backend) => {
                let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                backend.push_delayed(channel.queue_name(), job, Utc::now() + delay).await
            }
            None => Err(outreach_core::OutreachError::Queue("no queue backend".into())),
        }
    }

    pub async fn stats(&self) -> Vec<ChannelQueueStats> {
        let mut stats = Vec::new();
        let Some(backend) = &self.backend else {
            return stats;
        };
        if !self.is_backend_available().await {
            return stats;
        }
        for channel in Channel::ALL {
            match backend.counts(channel.queue_name()).await {
                Ok(counts) => stats.push(ChannelQueueStats {
                    channel,
                    queue: channel.queue_name(),
                    counts,
                }),
                Err(e) => tracing::warn!("⚠️ Queue stats for {} failed: {e}", channel.queue_name()),
            }
        }
        stats
    }

    /// Close queues and the backend connection and forget the probe result,
    /// so the next use re-probes.
    pub async fn shutdown(&self) {
        self.handles.lock().await.clear();
        *self.probe.lock().await = None;
        if let Some(backend) = &self.backend {
            backend.close().await;
        }
        tracing::info!("🛑 Job queues closed");
    }

    async fn mark_unavailable(&self) {
        *self.probe.lock().await = Some(Probe {
            available: false,
            checked_at: Instant::now(),
        });
    }

    #[cfg(test)]
    pub(crate) async fn open_handles(&self) -> usize {
        self.handles.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn job(attempt: &str, channel: Channel) -> ChannelJob {
        ChannelJob {
            attempt_id: attempt.into(),
            channel,
            lead_id: "l".into(),
            script_id: "s".into(),
            campaign_id: None,
            campaign_meta: None,
        }
    }

    fn queue_with(backend: Arc<MemoryBackend>) -> JobQueue {
        JobQueue::new(Some(backend), Duration::from_secs(30), RetryPolicy::new(3, 2000))
    }

    #[tokio::test]
    async fn test_no_backend_never_available() {
        let queue = JobQueue::disabled();
        assert!(!queue.is_backend_available().await);
        assert!(queue.queue_for_channel(Channel::Sms).await.is_none());
        assert!(!queue.enqueue(Channel::Sms, job("a", Channel::Sms)).await);
    }

    #[tokio::test]
    async fn test_enqueue_sets_retry_policy_and_creates_queue_lazily() {
        let backend = Arc::new(MemoryBackend::new());
        let queue = queue_with(backend.clone());
        assert_eq!(queue.open_handles().await, 0);

        assert!(queue.enqueue(Channel::Email, job("a1", Channel::Email)).await);
        assert_eq!(queue.open_handles().await, 1);

        let waiting = backend.waiting("outreach-email");
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].max_attempts, 3);
        assert_eq!(waiting[0].backoff_base_ms, 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_result_is_cached_for_ttl() {
        let backend = Arc::new(MemoryBackend::new());
        let queue = queue_with(backend.clone());

        assert!(queue.is_backend_available().await);
        backend.set_available(false);
        // Cached
        assert!(queue.is_backend_available().await);
        assert_eq!(backend.ping_count(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!queue.is_backend_available().await);
        assert_eq!(backend.ping_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_push_returns_false_and_marks_unavailable() {
        let backend = Arc::new(MemoryBackend::new());
        let queue = queue_with(backend.clone());
        assert!(queue.is_backend_available().await);

        backend.set_available(false);
        assert!(!queue.enqueue(Channel::Sms, job("a", Channel::Sms)).await);
        assert!(!queue.is_backend_available().await);
    }

    #[tokio::test]
    async fn test_shutdown_resets_state() {
        let backend = Arc::new(MemoryBackend::new());
        let queue = queue_with(backend.clone());
        assert!(queue.enqueue(Channel::Push, job("a", Channel::Push)).await);
        queue.shutdown().await;

        assert_eq!(queue.open_handles().await, 0);
        assert!(queue.is_backend_available().await);
        assert_eq!(backend.ping_count(), 2);
    }

    #[tokio::test]
    async fn test_stats_cover_every_channel() {
        let backend = Arc::new(MemoryBackend::new());
        let queue = queue_with(backend);
        assert!(queue.enqueue(Channel::Sms, job("a", Channel::Sms)).await);
        let stats = queue.stats().await;
        assert_eq!(stats.len(), 4);
        let sms = stats.iter().find(|s| s.channel == Channel::Sms).unwrap();
        assert_eq!(sms.counts.waiting, 1);
    }
}
