//! Worker dispatch: turn one channel job into one provider call and record
//! the result on its attempt.

use async_trait::async_trait;
use chrono::Utc;
use outreach_channels::AdapterRegistry;
use outreach_channels::template::{lead_vars, render};
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::{OutboundMessage, SendContext, SendReceipt};
use outreach_core::types::{AttemptStatus, Channel, ChannelJob, Lead, Script};
use outreach_queue::{JobContext, JobError, JobHandler};
use outreach_store::Store;
use std::sync::Arc;

/// Who is running the job; decides what a transient provider fault means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// A queue consumer. Transient faults are retried until the final attempt.
    Queued { final_attempt: bool },
    /// Router fallback or the stale drain. Every fault is terminal.
    Direct,
}

impl DeliveryMode {
    fn retries_transient(&self) -> bool {
        matches!(self, DeliveryMode::Queued { final_attempt: false })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Provider accepted; attempt is IN_PROGRESS.
    Sent(SendReceipt),
    /// Attempt marked FAILED with this reason.
    Failed(String),
    /// Attempt was no longer PENDING; nothing was sent.
    Skipped(AttemptStatus),
    /// Transient fault on a retryable delivery; attempt back to PENDING.
    Retry(String),
}

pub struct Dispatcher {
    store: Arc<Store>,
    adapters: AdapterRegistry,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, adapters: AdapterRegistry) -> Self {
        Self { store, adapters }
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Execute one job. Missing references and configuration faults fail the
    /// attempt outright since no retry can fix them.
    pub async fn process_channel_job(&self, job: &ChannelJob, mode: DeliveryMode) -> Result<DispatchOutcome> {
        let attempt = self
            .store
            .get_attempt(&job.attempt_id)?
            .ok_or_else(|| OutreachError::NotFound(format!("attempt {}", job.attempt_id)))?;
        if attempt.status != AttemptStatus::Pending {
            tracing::debug!(
                "⏭️ Attempt {} already {}, skipping {} job",
                attempt.id,
                attempt.status,
                job.channel
            );
            return Ok(DispatchOutcome::Skipped(attempt.status));
        }

        let Some(lead) = self.store.get_lead(&job.lead_id)? else {
            return self.fail(job, None, format!("lead {} not found", job.lead_id));
        };
        let Some(script) = self.store.get_script(&job.script_id)? else {
            return self.fail(job, None, format!("script {} not found", job.script_id));
        };
        // The lead may have opted out after the job was queued.
        if let Err(e) = lead.check_reachable(job.channel) {
            return self.fail(job, None, e.to_string());
        }
        let Some(adapter) = self.adapters.get(job.channel) else {
            let e = OutreachError::Config(format!("no active integration for {}", job.channel));
            return self.fail(job, None, e.to_string());
        };

        let ctx = self.send_context(job)?;
        let message = self.build_message(job.channel, &lead, &script, ctx.campaign_meta.as_ref())?;

        // The stale drain and a queue worker may both hold this job.
        if !self.store.claim_attempt(&job.attempt_id, adapter.provider(), Utc::now())? {
            let status = self
                .store
                .get_attempt(&job.attempt_id)?
                .map(|a| a.status)
                .unwrap_or(AttemptStatus::InProgress);
            tracing::debug!("⏭️ Attempt {} claimed elsewhere ({status}), not sending", job.attempt_id);
            return Ok(DispatchOutcome::Skipped(status));
        }

        match adapter.send(&lead, &message, &ctx).await {
            Ok(receipt) => {
                let now = Utc::now();
                if self
                    .store
                    .mark_attempt_dispatched(&job.attempt_id, &receipt.provider, &receipt.provider_ref, now)?
                {
                    tracing::info!(
                        "📤 Attempt {} sent via {} ({}), ref {}",
                        job.attempt_id,
                        job.channel,
                        receipt.provider,
                        receipt.provider_ref
                    );
                } else {
                    tracing::warn!(
                        "⚠️ Attempt {} moved on while {} ({}) was sending, ref {} not recorded",
                        job.attempt_id,
                        job.channel,
                        receipt.provider,
                        receipt.provider_ref
                    );
                }
                Ok(DispatchOutcome::Sent(receipt))
            }
            Err(e) if e.is_transient() && mode.retries_transient() => {
                tracing::warn!(
                    "🔁 Attempt {} on {} ({}) hit a transient fault, will retry: {e}",
                    job.attempt_id,
                    job.channel,
                    adapter.provider()
                );
                self.store.release_attempt_claim(&job.attempt_id)?;
                Ok(DispatchOutcome::Retry(e.to_string()))
            }
            Err(e) => self.fail(job, Some(adapter.provider()), e.to_string()),
        }
    }

    fn fail(&self, job: &ChannelJob, provider: Option<&str>, reason: String) -> Result<DispatchOutcome> {
        tracing::error!(
            "❌ Attempt {} on {} ({}) failed: {reason}",
            job.attempt_id,
            job.channel,
            provider.unwrap_or("-")
        );
        self.store
            .mark_attempt_failed(&job.attempt_id, provider, &reason, Utc::now())?;
        Ok(DispatchOutcome::Failed(reason))
    }

    fn send_context(&self, job: &ChannelJob) -> Result<SendContext> {
        let campaign = match &job.campaign_id {
            Some(id) => self.store.get_campaign(id)?,
            None => None,
        };
        let campaign_meta = match &job.campaign_meta {
            Some(raw) => match serde_json::from_str(raw) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    tracing::warn!("⚠️ Attempt {}: unreadable campaign meta: {e}", job.attempt_id);
                    None
                }
            },
            None => campaign.as_ref().and_then(|c| c.meta.clone()),
        };
        Ok(SendContext {
            attempt_id: Some(job.attempt_id.clone()),
            campaign_id: job.campaign_id.clone(),
            instantly_campaign_id: campaign.and_then(|c| c.instantly_campaign_id),
            campaign_meta,
        })
    }

    /// Render the script for this lead. Email prefers the linked template and
    /// falls back to the raw script content.
    fn build_message(
        &self,
        channel: Channel,
        lead: &Lead,
        script: &Script,
        campaign_meta: Option<&serde_json::Value>,
    ) -> Result<OutboundMessage> {
        let vars = lead_vars(lead, campaign_meta);
        let mut message = OutboundMessage {
            subject: script.subject.as_deref().map(|s| render(s, &vars)),
            body: render(&script.content, &vars),
            html_body: None,
            script_id: Some(script.id.clone()),
            assistant_id: script.assistant_id.clone(),
        };

        if channel == Channel::Email {
            if let Some(template_id) = &script.template_id {
                match self.store.get_template(template_id)? {
                    Some(template) => {
                        message.subject = Some(render(&template.subject, &vars));
                        message.html_body = Some(render(&template.html_body, &vars));
                        if let Some(text) = &template.text_body {
                            message.body = render(text, &vars);
                        }
                    }
                    None => tracing::warn!(
                        "⚠️ Template {template_id} missing for script {}, sending raw content",
                        script.id
                    ),
                }
            }
        }
        Ok(message)
    }
}

#[async_trait]
impl JobHandler for Dispatcher {
    async fn handle(&self, job: &ChannelJob, ctx: &JobContext) -> std::result::Result<(), JobError> {
        let mode = DeliveryMode::Queued {
            final_attempt: ctx.is_final_attempt(),
        };
        match self.process_channel_job(job, mode).await {
            Ok(DispatchOutcome::Retry(reason)) => Err(JobError::Retry(reason)),
            Ok(_) => Ok(()),
            Err(OutreachError::NotFound(what)) => Err(JobError::NonRetry(format!("{what} not found"))),
            Err(e) if ctx.is_final_attempt() => {
                self.store
                    .mark_attempt_failed(&job.attempt_id, None, &e.to_string(), Utc::now())
                    .map_err(|se| JobError::NonRetry(se.to_string()))?;
                Err(JobError::NonRetry(e.to_string()))
            }
            Err(e) => Err(JobError::Retry(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, MockAdapter};
    use outreach_core::types::{Campaign, ContactAttempt, EmailTemplate};

    fn job_for(attempt: &ContactAttempt, script_id: &str) -> ChannelJob {
        ChannelJob {
            attempt_id: attempt.id.clone(),
            channel: attempt.channel,
            lead_id: attempt.lead_id.clone(),
            script_id: script_id.to_string(),
            campaign_id: attempt.campaign_id.clone(),
            campaign_meta: None,
        }
    }

    #[tokio::test]
    async fn test_success_marks_in_progress_with_ref() {
        let fx = Fixture::new();
        let sms = MockAdapter::ok(Channel::Sms, "SM123");
        let dispatcher = fx.dispatcher(vec![sms.clone()]);
        let lead = fx.lead_with_phone("Ana");
        let script = fx.script(Channel::Sms, "Hi {{first_name}}");
        let attempt = fx.pending_attempt(&lead, Channel::Sms, Some(&script.id));

        let out = dispatcher
            .process_channel_job(&job_for(&attempt, &script.id), DeliveryMode::Direct)
            .await
            .unwrap();
        assert!(matches!(out, DispatchOutcome::Sent(_)));

        let stored = fx.store.get_attempt(&attempt.id).unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::InProgress);
        assert_eq!(stored.provider_ref.as_deref(), Some("SM123"));
        assert_eq!(sms.sent_bodies(), vec!["Hi Ana".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_script_fails_without_sending() {
        let fx = Fixture::new();
        let sms = MockAdapter::ok(Channel::Sms, "SM1");
        let dispatcher = fx.dispatcher(vec![sms.clone()]);
        let lead = fx.lead_with_phone("Ana");
        let attempt = fx.pending_attempt(&lead, Channel::Sms, None);

        let out = dispatcher
            .process_channel_job(&job_for(&attempt, "gone"), DeliveryMode::Direct)
            .await
            .unwrap();
        assert!(matches!(out, DispatchOutcome::Failed(ref r) if r.contains("script gone")));
        assert_eq!(fx.store.get_attempt(&attempt.id).unwrap().unwrap().status, AttemptStatus::Failed);
        assert_eq!(sms.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_adapter_is_a_config_failure() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(vec![]);
        let lead = fx.lead_with_phone("Ana");
        let script = fx.script(Channel::Call, "hello");
        let attempt = fx.pending_attempt(&lead, Channel::Call, Some(&script.id));

        let out = dispatcher
            .process_channel_job(&job_for(&attempt, &script.id), DeliveryMode::Direct)
            .await
            .unwrap();
        assert!(matches!(out, DispatchOutcome::Failed(ref r) if r.contains("no active integration")));
        let stored = fx.store.get_attempt(&attempt.id).unwrap().unwrap();
        assert!(stored.notes.unwrap().contains("Configuration error"));
    }

    #[tokio::test]
    async fn test_transient_fault_retries_only_when_queued() {
        let fx = Fixture::new();
        let sms = MockAdapter::failing(Channel::Sms, OutreachError::Transient("503".into()));
        let dispatcher = fx.dispatcher(vec![sms]);
        let lead = fx.lead_with_phone("Ana");
        let script = fx.script(Channel::Sms, "x");

        let queued = fx.pending_attempt(&lead, Channel::Sms, Some(&script.id));
        let out = dispatcher
            .process_channel_job(&job_for(&queued, &script.id), DeliveryMode::Queued { final_attempt: false })
            .await
            .unwrap();
        assert!(matches!(out, DispatchOutcome::Retry(_)));
        assert_eq!(fx.store.get_attempt(&queued.id).unwrap().unwrap().status, AttemptStatus::Pending);

        let out = dispatcher
            .process_channel_job(&job_for(&queued, &script.id), DeliveryMode::Queued { final_attempt: true })
            .await
            .unwrap();
        assert!(matches!(out, DispatchOutcome::Failed(_)));

        let direct = fx.pending_attempt(&lead, Channel::Sms, Some(&script.id));
        let out = dispatcher
            .process_channel_job(&job_for(&direct, &script.id), DeliveryMode::Direct)
            .await
            .unwrap();
        assert!(matches!(out, DispatchOutcome::Failed(_)));
        let stored = fx.store.get_attempt(&direct.id).unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Failed);
        assert_eq!(stored.provider.as_deref(), Some("mock"));
    }

    #[tokio::test]
    async fn test_non_pending_attempt_is_skipped() {
        let fx = Fixture::new();
        let sms = MockAdapter::ok(Channel::Sms, "SM1");
        let dispatcher = fx.dispatcher(vec![sms.clone()]);
        let lead = fx.lead_with_phone("Ana");
        let script = fx.script(Channel::Sms, "x");
        let attempt = fx.pending_attempt(&lead, Channel::Sms, Some(&script.id));
        fx.store.force_attempt_status(&attempt.id, AttemptStatus::Success).unwrap();

        let out = dispatcher
            .process_channel_job(&job_for(&attempt, &script.id), DeliveryMode::Direct)
            .await
            .unwrap();
        assert_eq!(out, DispatchOutcome::Skipped(AttemptStatus::Success));
        assert_eq!(sms.calls(), 0);
    }

    #[tokio::test]
    async fn test_drain_and_worker_send_once() {
        let fx = Fixture::new();
        let sms = MockAdapter::ok(Channel::Sms, "SM1");
        let dispatcher = fx.dispatcher(vec![sms.clone()]);
        let lead = fx.lead_with_phone("Ana");
        let script = fx.script(Channel::Sms, "x");
        let attempt = fx.pending_attempt(&lead, Channel::Sms, Some(&script.id));
        let job = job_for(&attempt, &script.id);

        let (worker, drain) = tokio::join!(
            dispatcher.process_channel_job(&job, DeliveryMode::Queued { final_attempt: false }),
            dispatcher.process_channel_job(&job, DeliveryMode::Direct),
        );
        let outcomes = [worker.unwrap(), drain.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| matches!(o, DispatchOutcome::Sent(_))).count(), 1);
        assert!(outcomes.contains(&DispatchOutcome::Skipped(AttemptStatus::InProgress)));
        assert_eq!(sms.calls(), 1);

        let stored = fx.store.get_attempt(&attempt.id).unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::InProgress);
        assert_eq!(stored.provider_ref.as_deref(), Some("SM1"));
    }

    #[tokio::test]
    async fn test_email_renders_template_with_campaign_meta() {
        let fx = Fixture::new();
        let email = MockAdapter::ok(Channel::Email, "pm-1");
        let dispatcher = fx.dispatcher(vec![email.clone()]);

        let mut campaign = Campaign::new("Winback");
        campaign.meta = Some(serde_json::json!({"offer": "20%"}));
        fx.store.insert_campaign(&campaign).unwrap();
        let template = EmailTemplate {
            id: "t1".into(),
            name: "winback".into(),
            subject: "{{first_name}}, {{campaign.offer}} off".into(),
            html_body: "<p>Hi {{first_name}}</p>".into(),
            text_body: None,
        };
        fx.store.insert_template(&template).unwrap();
        let mut script = Script::new("email", Channel::Email, "raw {{first_name}}");
        script.template_id = Some("t1".into());
        fx.store.upsert_script(&script).unwrap();

        let lead = fx.lead_with_email("Bo");
        let attempt = ContactAttempt::pending(&lead.id, Channel::Email, Some(&campaign.id), Some(&script.id));
        fx.store.insert_attempt(&attempt).unwrap();

        dispatcher
            .process_channel_job(&job_for(&attempt, &script.id), DeliveryMode::Direct)
            .await
            .unwrap();
        let sent = email.sent_messages();
        assert_eq!(sent[0].subject.as_deref(), Some("Bo, 20% off"));
        assert_eq!(sent[0].html_body.as_deref(), Some("<p>Hi Bo</p>"));
        assert_eq!(sent[0].body, "raw Bo");
    }

    #[tokio::test]
    async fn test_job_handler_maps_outcomes() {
        let fx = Fixture::new();
        let sms = MockAdapter::failing(Channel::Sms, OutreachError::Transient("timeout".into()));
        let dispatcher = fx.dispatcher(vec![sms]);
        let lead = fx.lead_with_phone("Ana");
        let script = fx.script(Channel::Sms, "x");
        let attempt = fx.pending_attempt(&lead, Channel::Sms, Some(&script.id));
        let job = job_for(&attempt, &script.id);

        let first = JobContext { job_id: "j".into(), attempt: 1, max_attempts: 3 };
        assert!(matches!(dispatcher.handle(&job, &first).await, Err(JobError::Retry(_))));

        let last = JobContext { job_id: "j".into(), attempt: 3, max_attempts: 3 };
        assert!(dispatcher.handle(&job, &last).await.is_ok());
        assert_eq!(fx.store.get_attempt(&attempt.id).unwrap().unwrap().status, AttemptStatus::Failed);

        let mut orphan = job.clone();
        orphan.attempt_id = "missing".into();
        assert!(matches!(dispatcher.handle(&orphan, &first).await, Err(JobError::NonRetry(_))));
    }
}
