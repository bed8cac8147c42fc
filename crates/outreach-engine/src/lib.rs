//! # Outreach Engine
//!
//! Routing, dispatch, sequences, A/B evaluation and the periodic scheduler
//! for the Outreach retention core.
//!
//! [`Engine`] wires every service from an [`OutreachConfig`]. The HTTP
//! gateway and the CLI both drive the system through it.

pub mod abtest;
pub mod background;
pub mod callsync;
pub mod cleanup;
pub mod cron;
pub mod dispatch;
pub mod enrollment;
pub mod events;
pub mod lock;
pub mod router;
pub mod rules;
pub mod scheduled;
pub mod scoring;
pub mod sequence;
pub mod worker;

#[cfg(test)]
mod testing;

pub use abtest::{AbEvaluation, AbEvaluator};
pub use background::spawn_detached;
pub use cron::{CRON_LOCK, CronReport, CronRunner, CronSteps, StepOutcome};
pub use dispatch::{DeliveryMode, DispatchOutcome, Dispatcher};
pub use enrollment::{EnrollOutcome, Enrollments};
pub use events::{ConversionOutcome, EventOutcome, ProviderEvents};
pub use lock::{LockGuard, LockInfo, LockService};
pub use router::{ChannelRouter, ContactRequest, DrainReport, RouteMode, RouteOutcome};
pub use scheduled::ScheduledContacts;
pub use sequence::{SequenceProcessor, SequenceSweep};
pub use worker::WorkerPool;

use outreach_channels::{AdapterRegistry, CallLog, VapiAdapter};
use outreach_core::OutreachConfig;
use outreach_core::error::Result;
use outreach_queue::JobQueue;
use outreach_store::Store;
use std::sync::Arc;
use std::time::Duration;

use callsync::CallLogSync;
use cleanup::RetentionCleaner;
use rules::RuleLearner;
use scoring::LeadScorer;

/// Every long-lived service, built once per process.
pub struct Engine {
    pub config: OutreachConfig,
    pub store: Arc<Store>,
    pub queue: Arc<JobQueue>,
    pub lock: Arc<LockService>,
    pub dispatcher: Arc<Dispatcher>,
    pub router: Arc<ChannelRouter>,
    pub ab: Arc<AbEvaluator>,
    pub enrollments: Arc<Enrollments>,
    pub events: Arc<ProviderEvents>,
    pub scheduled: Arc<ScheduledContacts>,
    pub sequences: Arc<SequenceProcessor>,
    pub cron: Arc<CronRunner>,
}

impl Engine {
    /// Open the database, connect the queue backend and build adapters for
    /// every active provider integration.
    pub fn from_config(config: OutreachConfig) -> Result<Self> {
        let store = Arc::new(Store::open(&config.database_path())?);
        let adapters = AdapterRegistry::from_config(&config.providers);
        let queue = Arc::new(JobQueue::from_config(&config.queue));
        let call_log = VapiAdapter::from_config(config.providers.vapi.as_ref())
            .map(|vapi| Arc::new(vapi) as Arc<dyn CallLog>);
        Ok(Self::build(config, store, adapters, queue, call_log))
    }

    pub fn build(
        config: OutreachConfig,
        store: Arc<Store>,
        adapters: AdapterRegistry,
        queue: Arc<JobQueue>,
        call_log: Option<Arc<dyn CallLog>>,
    ) -> Self {
        let lock = Arc::new(LockService::new());
        let ab = Arc::new(AbEvaluator::new(store.clone(), config.ab_testing.clone()));
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), adapters));
        let router = Arc::new(
            ChannelRouter::new(store.clone(), queue.clone(), dispatcher.clone(), ab.clone()).with_drain(
                Duration::from_secs(config.cron.stale_pending_secs),
                config.cron.drain_batch,
            ),
        );
        let enrollments = Arc::new(Enrollments::new(store.clone()));
        let events = Arc::new(ProviderEvents::new(store.clone(), enrollments.clone(), ab.clone()));
        let scheduled = Arc::new(ScheduledContacts::new(store.clone(), router.clone()));
        let sequences = Arc::new(SequenceProcessor::new(store.clone(), router.clone(), &config.sequences));

        let steps = CronSteps {
            scheduled: scheduled.clone(),
            sequences: sequences.clone(),
            router: router.clone(),
            scorer: Arc::new(LeadScorer::new(store.clone(), config.cron.scoring_batch)),
            call_sync: Arc::new(CallLogSync::new(events.clone(), call_log)),
            rules: Arc::new(RuleLearner::new(store.clone())),
            ab: ab.clone(),
            cleaner: Arc::new(RetentionCleaner::new(store.clone(), config.cron.retention_days)),
        };
        let cron = Arc::new(CronRunner::new(lock.clone(), steps, &config.cron));

        Self {
            config,
            store,
            queue,
            lock,
            dispatcher,
            router,
            ab,
            enrollments,
            events,
            scheduled,
            sequences,
            cron,
        }
    }

    /// Queue consumers for every channel with an active adapter.
    pub fn workers(&self) -> WorkerPool {
        WorkerPool::new(self.queue.clone(), self.dispatcher.clone(), &self.config.queue.limits)
    }

    /// Close queue connections. Consumers must be stopped first.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAdapter, registry};
    use outreach_core::types::{AttemptStatus, Channel, LeadStatus};

    #[tokio::test]
    async fn test_engine_wires_router_and_cron() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let sms = MockAdapter::ok(Channel::Sms, "SM-1");
        let engine = Engine::build(
            OutreachConfig::default(),
            store.clone(),
            registry(vec![sms.clone()]),
            Arc::new(JobQueue::disabled()),
            None,
        );

        let mut lead = outreach_core::types::Lead::new("Ana");
        lead.phone = Some("+15550100".into());
        store.insert_lead(&lead).unwrap();
        let mut script = outreach_core::types::Script::new("d", Channel::Sms, "Hi {{first_name}}");
        script.is_default = true;
        store.upsert_script(&script).unwrap();

        let out = engine
            .router
            .route_contact(&ContactRequest::new(&lead.id, Channel::Sms))
            .await
            .unwrap();
        assert_eq!(out.mode, RouteMode::Direct);
        assert_eq!(out.status, AttemptStatus::InProgress);

        let report = engine.cron.run().await.unwrap();
        assert_eq!(report.failed_steps(), 0);
        assert_eq!(engine.workers().channels(), vec![Channel::Sms]);

        engine.events.convert_lead(&lead.id, chrono::Utc::now()).unwrap();
        assert_eq!(store.get_lead(&lead.id).unwrap().unwrap().status, LeadStatus::Converted);
    }
}
