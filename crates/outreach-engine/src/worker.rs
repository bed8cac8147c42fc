//! Worker pool: one queue consumer per channel with an active adapter.

use outreach_core::config::ChannelLimitsConfig;
use outreach_core::error::Result;
use outreach_core::types::Channel;
use outreach_queue::{ChannelConsumer, ConsumerStats, JobHandler, JobQueue};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::dispatch::Dispatcher;

pub struct WorkerPool {
    consumers: Vec<Arc<ChannelConsumer>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Consumers for every channel the dispatcher has an adapter for.
    pub fn new(queue: Arc<JobQueue>, dispatcher: Arc<Dispatcher>, limits: &ChannelLimitsConfig) -> Self {
        let handler: Arc<dyn JobHandler> = dispatcher.clone();
        let consumers = dispatcher
            .adapters()
            .channels()
            .into_iter()
            .map(|channel| {
                Arc::new(ChannelConsumer::new(
                    channel,
                    queue.clone(),
                    handler.clone(),
                    limits.for_channel(channel),
                ))
            })
            .collect();
        let (shutdown, _) = watch::channel(false);
        Self {
            consumers,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.consumers.iter().map(|c| c.channel()).collect()
    }

    /// Spawn every consumer loop.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        for consumer in &self.consumers {
            handles.push(tokio::spawn(consumer.clone().run(self.shutdown.subscribe())));
        }
        tracing::info!("👷 Worker pool started for {} channels", self.consumers.len());
    }

    /// Run at most one waiting job per channel inline. Returns how many ran.
    pub async fn drain_once(&self) -> Result<usize> {
        let mut ran = 0;
        for consumer in &self.consumers {
            if consumer.process_one().await? {
                ran += 1;
            }
        }
        Ok(ran)
    }

    pub fn stats(&self) -> Vec<ConsumerStats> {
        self.consumers.iter().map(|c| c.stats()).collect()
    }

    /// Signal every consumer and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("❌ Consumer task ended abnormally: {e}");
            }
        }
        tracing::info!("👷 Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{ChannelRouter, ContactRequest, RouteMode};
    use crate::testing::{Fixture, MockAdapter};
    use outreach_core::types::AttemptStatus;
    use outreach_queue::{MemoryBackend, RetryPolicy};
    use std::time::Duration;

    struct Setup {
        fx: Fixture,
        router: ChannelRouter,
        pool: WorkerPool,
        sms: Arc<MockAdapter>,
    }

    fn setup() -> Setup {
        let fx = Fixture::new();
        let sms = MockAdapter::ok(Channel::Sms, "SM-1");
        let backend = Arc::new(MemoryBackend::new());
        let queue = Arc::new(JobQueue::new(
            Some(backend),
            Duration::from_secs(30),
            RetryPolicy::default(),
        ));
        let dispatcher = Arc::new(fx.dispatcher(vec![sms.clone()]));
        let router = ChannelRouter::new(fx.store.clone(), queue.clone(), dispatcher.clone(), fx.ab());
        let pool = WorkerPool::new(queue, dispatcher, &ChannelLimitsConfig::default());
        fx.default_script(Channel::Sms, "Hi {{first_name}}");
        Setup { fx, router, pool, sms }
    }

    #[tokio::test]
    async fn test_pool_covers_registered_channels() {
        let s = setup();
        assert_eq!(s.pool.channels(), vec![Channel::Sms]);
        assert_eq!(s.pool.drain_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queued_job_is_dispatched_by_consumer() {
        let s = setup();
        let lead = s.fx.lead_with_phone("Ana");
        let out = s.router.route_contact(&ContactRequest::new(&lead.id, Channel::Sms)).await.unwrap();
        assert_eq!(out.mode, RouteMode::Queued);

        assert_eq!(s.pool.drain_once().await.unwrap(), 1);
        let attempt = s.fx.store.get_attempt(&out.attempt_id).unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::InProgress);
        assert_eq!(attempt.provider_ref.as_deref(), Some("SM-1"));
        assert_eq!(s.sms.sent_bodies(), vec!["Hi Ana".to_string()]);

        let stats = s.pool.stats();
        assert_eq!((stats[0].processed, stats[0].succeeded), (1, 1));
    }

    #[tokio::test]
    async fn test_started_pool_consumes_and_stops() {
        let s = setup();
        s.pool.start().await;
        let lead = s.fx.lead_with_phone("Ana");
        let out = s.router.route_contact(&ContactRequest::new(&lead.id, Channel::Sms)).await.unwrap();

        for _ in 0..100 {
            if s.sms.calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        s.pool.shutdown().await;
        let attempt = s.fx.store.get_attempt(&out.attempt_id).unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::InProgress);
    }
}
