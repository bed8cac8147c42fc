//! Test fixtures: in-memory store, recording adapters.

use async_trait::async_trait;
use chrono::Utc;
use outreach_channels::AdapterRegistry;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::{ChannelAdapter, ConnectionCheck, OutboundMessage, SendContext, SendReceipt};
use outreach_core::types::{
    Channel, ContactAttempt, DelayUnit, Lead, RetentionSequence, Script, SequenceStatus, SequenceStep,
    StepCondition, TriggerType, new_id,
};
use outreach_core::config::AbTestingConfig;
use outreach_queue::{JobQueue, MemoryBackend, RetryPolicy};
use outreach_store::Store;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::abtest::AbEvaluator;
use crate::dispatch::Dispatcher;
use crate::router::ChannelRouter;

enum Reply {
    Ok(String),
    Err(OutreachError),
}

/// Records every send; answers with a fixed receipt or a fixed error.
pub struct MockAdapter {
    channel: Channel,
    reply: Reply,
    calls: AtomicUsize,
    sent: Mutex<Vec<(String, OutboundMessage)>>,
}

impl MockAdapter {
    /// Succeeds; the first ref is `provider_ref`, later ones get a `-n` suffix.
    pub fn ok(channel: Channel, provider_ref: &str) -> Arc<Self> {
        Arc::new(Self::with(channel, Reply::Ok(provider_ref.to_string())))
    }

    pub fn failing(channel: Channel, error: OutreachError) -> Arc<Self> {
        Arc::new(Self::with(channel, Reply::Err(error)))
    }

    fn with(channel: Channel, reply: Reply) -> Self {
        Self {
            channel,
            reply,
            calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn sent_bodies(&self) -> Vec<String> {
        self.sent_messages().into_iter().map(|m| m.body).collect()
    }

    pub fn sent_leads(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(l, _)| l.clone()).collect()
    }
}

fn copy_error(e: &OutreachError) -> OutreachError {
    match e {
        OutreachError::Transient(m) => OutreachError::Transient(m.clone()),
        OutreachError::Config(m) => OutreachError::Config(m.clone()),
        other => OutreachError::Provider(other.to_string()),
    }
}

#[async_trait]
impl ChannelAdapter for MockAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn provider(&self) -> &str {
        "mock"
    }

    async fn send(&self, lead: &Lead, message: &OutboundMessage, _ctx: &SendContext) -> Result<SendReceipt> {
        // Let a concurrent delivery of the same job run mid-send.
        tokio::task::yield_now().await;
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent.lock().unwrap().push((lead.id.clone(), message.clone()));
        match &self.reply {
            Reply::Ok(base) => Ok(SendReceipt {
                provider: "mock".into(),
                provider_ref: if n == 1 { base.clone() } else { format!("{base}-{n}") },
            }),
            Reply::Err(e) => Err(copy_error(e)),
        }
    }

    async fn test_connection(&self) -> ConnectionCheck {
        match &self.reply {
            Reply::Ok(_) => ConnectionCheck::ok(),
            Reply::Err(e) => ConnectionCheck::failed(e.to_string()),
        }
    }
}

pub fn registry(adapters: Vec<Arc<MockAdapter>>) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter);
    }
    registry
}

pub struct Fixture {
    pub store: Arc<Store>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store::open_in_memory().unwrap()),
        }
    }

    pub fn dispatcher(&self, adapters: Vec<Arc<MockAdapter>>) -> Dispatcher {
        Dispatcher::new(self.store.clone(), registry(adapters))
    }

    /// Router over a memory queue; `queue_up: false` forces direct sends.
    pub fn router(&self, adapters: Vec<Arc<MockAdapter>>, queue_up: bool) -> (Arc<ChannelRouter>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_available(queue_up);
        let queue = Arc::new(JobQueue::new(
            Some(backend.clone()),
            std::time::Duration::from_secs(30),
            RetryPolicy::default(),
        ));
        let dispatcher = Arc::new(self.dispatcher(adapters));
        let router = ChannelRouter::new(self.store.clone(), queue, dispatcher, self.ab());
        (Arc::new(router), backend)
    }

    pub fn ab(&self) -> Arc<AbEvaluator> {
        Arc::new(AbEvaluator::new(self.store.clone(), AbTestingConfig::default()))
    }

    pub fn lead_with_phone(&self, name: &str) -> Lead {
        let mut lead = Lead::new(name);
        lead.phone = Some("+15550100".into());
        self.store.insert_lead(&lead).unwrap();
        lead
    }

    pub fn lead_with_email(&self, name: &str) -> Lead {
        let mut lead = Lead::new(name);
        lead.email = Some(format!("{}@example.com", name.to_lowercase()));
        self.store.insert_lead(&lead).unwrap();
        lead
    }

    /// A lead reachable on every channel.
    pub fn lead_everywhere(&self, name: &str) -> Lead {
        let mut lead = Lead::new(name);
        lead.phone = Some("+15550100".into());
        lead.email = Some(format!("{}@example.com", name.to_lowercase()));
        lead.push_token = Some("push-token".into());
        self.store.insert_lead(&lead).unwrap();
        lead
    }

    pub fn script(&self, channel: Channel, content: &str) -> Script {
        let script = Script::new("script", channel, content);
        self.store.upsert_script(&script).unwrap();
        script
    }

    pub fn default_script(&self, channel: Channel, content: &str) -> Script {
        let mut script = Script::new("default", channel, content);
        script.is_default = true;
        self.store.upsert_script(&script).unwrap();
        script
    }

    pub fn pending_attempt(&self, lead: &Lead, channel: Channel, script_id: Option<&str>) -> ContactAttempt {
        let attempt = ContactAttempt::pending(&lead.id, channel, None, script_id);
        self.store.insert_attempt(&attempt).unwrap();
        attempt
    }
}

/// A DRAFT sequence with one immediate inline step per channel.
pub fn draft(name: &str, channels: &[Channel], trigger: Option<TriggerType>) -> RetentionSequence {
    let id = new_id();
    RetentionSequence {
        id: id.clone(),
        name: name.into(),
        status: SequenceStatus::Draft,
        campaign_id: None,
        trigger_type: trigger,
        exit_on_conversion: true,
        created_at: Utc::now(),
        steps: channels
            .iter()
            .enumerate()
            .map(|(order, &channel)| SequenceStep {
                id: new_id(),
                sequence_id: id.clone(),
                step_order: order as i64,
                channel,
                delay_value: 0,
                delay_unit: DelayUnit::Hours,
                script_id: None,
                subject: None,
                content: Some(format!("step {order} for {{{{first_name}}}}")),
                condition: StepCondition::Always,
            })
            .collect(),
    }
}
