//! Channel Router: "contact this lead on this channel" becomes a durable
//! attempt that is either queued for a worker or sent in place.

use chrono::{DateTime, Duration, Utc};
use outreach_core::error::{OutreachError, Result};
use outreach_core::types::{AttemptStatus, Channel, ChannelJob, ContactAttempt, Variant};
use outreach_queue::JobQueue;
use outreach_store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::abtest::AbEvaluator;
use crate::dispatch::{DeliveryMode, DispatchOutcome, Dispatcher};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequest {
    pub lead_id: String,
    pub channel: Channel,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub script_id: Option<String>,
}

impl ContactRequest {
    pub fn new(lead_id: &str, channel: Channel) -> Self {
        Self {
            lead_id: lead_id.to_string(),
            channel,
            campaign_id: None,
            script_id: None,
        }
    }

    pub fn campaign(mut self, campaign_id: Option<&str>) -> Self {
        self.campaign_id = campaign_id.map(String::from);
        self
    }

    pub fn script(mut self, script_id: Option<&str>) -> Self {
        self.script_id = script_id.map(String::from);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    Queued,
    Direct,
}

/// Where the attempt stands when `route_contact` returns.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOutcome {
    pub attempt_id: String,
    pub mode: RouteMode,
    pub status: AttemptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RouteOutcome {
    pub fn failed(&self) -> bool {
        self.status == AttemptStatus::Failed
    }
}

/// Stale-PENDING drain summary.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub found: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct ChannelRouter {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    dispatcher: Arc<Dispatcher>,
    ab: Arc<AbEvaluator>,
    stale_after: Duration,
    drain_batch: usize,
}

impl ChannelRouter {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<JobQueue>,
        dispatcher: Arc<Dispatcher>,
        ab: Arc<AbEvaluator>,
    ) -> Self {
        Self {
            store,
            queue,
            dispatcher,
            ab,
            stale_after: Duration::seconds(600),
            drain_batch: 50,
        }
    }

    /// Age at which a PENDING attempt is considered lost, and drain batch size.
    pub fn with_drain(mut self, stale_after: std::time::Duration, batch: usize) -> Self {
        self.stale_after = Duration::from_std(stale_after).unwrap_or(self.stale_after);
        self.drain_batch = batch.max(1);
        self
    }

    /// Validate, record a PENDING attempt, then queue it or send it in place.
    ///
    /// Precondition failures return `Err` and leave no attempt behind. Once the
    /// attempt exists, provider failures are reported in the outcome with the
    /// attempt marked FAILED.
    pub async fn route_contact(&self, req: &ContactRequest) -> Result<RouteOutcome> {
        let lead = self
            .store
            .get_lead(&req.lead_id)?
            .ok_or_else(|| OutreachError::NotFound(format!("lead {}", req.lead_id)))?;
        lead.check_reachable(req.channel)?;

        let campaign = match &req.campaign_id {
            Some(id) => Some(
                self.store
                    .get_campaign(id)?
                    .ok_or_else(|| OutreachError::NotFound(format!("campaign {id}")))?,
            ),
            None => None,
        };
        let (script_id, ab_assignment) = self.resolve_script(req)?;

        let mut attempt =
            ContactAttempt::pending(&lead.id, req.channel, req.campaign_id.as_deref(), Some(&script_id));
        if let Some((test_id, variant)) = &ab_assignment {
            attempt.ab_test_id = Some(test_id.clone());
            attempt.ab_variant = Some(*variant);
        }
        self.store.insert_attempt(&attempt)?;
        if let Some((test_id, variant)) = &ab_assignment {
            if let Err(e) = self.ab.record_outcome(test_id, *variant, false) {
                tracing::warn!("⚠️ A/B {test_id}: could not count send for attempt {}: {e}", attempt.id);
            }
        }

        let campaign_meta = campaign
            .as_ref()
            .and_then(|c| c.meta.as_ref())
            .map(|m| m.to_string());
        let job = ChannelJob {
            attempt_id: attempt.id.clone(),
            channel: req.channel,
            lead_id: lead.id.clone(),
            script_id,
            campaign_id: req.campaign_id.clone(),
            campaign_meta,
        };

        if self.queue.enqueue(req.channel, job.clone()).await {
            tracing::debug!("📬 Attempt {} queued on {}", attempt.id, req.channel);
            return Ok(RouteOutcome {
                attempt_id: attempt.id,
                mode: RouteMode::Queued,
                status: AttemptStatus::Pending,
                provider_ref: None,
                error: None,
            });
        }

        tracing::info!("↪️ Queue unavailable, sending attempt {} on {} directly", attempt.id, req.channel);
        let outcome = self.dispatcher.process_channel_job(&job, DeliveryMode::Direct).await?;
        Ok(direct_outcome(attempt.id, outcome))
    }

    /// Re-dispatch PENDING attempts older than the staleness threshold through
    /// the direct path.
    pub async fn process_queue(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let stale = self
            .store
            .stale_pending_attempts(now - self.stale_after, self.drain_batch)?;
        let mut report = DrainReport {
            found: stale.len(),
            ..DrainReport::default()
        };
        if !stale.is_empty() {
            tracing::info!("🧹 Draining {} stale PENDING attempts", stale.len());
        }

        for attempt in stale {
            let Some(script_id) = attempt.script_id.clone() else {
                self.store
                    .mark_attempt_failed(&attempt.id, None, "no script recorded on attempt", now)?;
                report.failed += 1;
                continue;
            };
            let campaign_meta = match &attempt.campaign_id {
                Some(id) => self
                    .store
                    .get_campaign(id)?
                    .and_then(|c| c.meta)
                    .map(|m| m.to_string()),
                None => None,
            };
            let job = ChannelJob {
                attempt_id: attempt.id.clone(),
                channel: attempt.channel,
                lead_id: attempt.lead_id.clone(),
                script_id,
                campaign_id: attempt.campaign_id.clone(),
                campaign_meta,
            };
            match self.dispatcher.process_channel_job(&job, DeliveryMode::Direct).await {
                Ok(DispatchOutcome::Sent(_)) => report.sent += 1,
                Ok(DispatchOutcome::Failed(_)) => report.failed += 1,
                Ok(DispatchOutcome::Skipped(_)) | Ok(DispatchOutcome::Retry(_)) => report.skipped += 1,
                Err(e) => {
                    tracing::error!("❌ Drain of attempt {} on {} failed: {e}", attempt.id, attempt.channel);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Explicit script, else a running A/B test for the campaign and channel,
    /// else the channel default.
    fn resolve_script(&self, req: &ContactRequest) -> Result<(String, Option<(String, Variant)>)> {
        if let Some(id) = &req.script_id {
            if self.store.get_script(id)?.is_none() {
                return Err(OutreachError::Precondition(format!("script {id} does not exist")));
            }
            return Ok((id.clone(), None));
        }
        if let Some(campaign_id) = &req.campaign_id {
            if let Some(test) = self.store.running_ab_test(campaign_id, req.channel)? {
                let (variant, script_id) = self.ab.select_variant(&test.id)?;
                tracing::debug!("🧪 A/B {} picked variant {variant}", test.id);
                return Ok((script_id, Some((test.id, variant))));
            }
        }
        match self.store.default_script(req.campaign_id.as_deref(), req.channel)? {
            Some(script) => Ok((script.id, None)),
            None => Err(OutreachError::Precondition(format!(
                "no script given and no default {} script",
                req.channel
            ))),
        }
    }
}

fn direct_outcome(attempt_id: String, outcome: DispatchOutcome) -> RouteOutcome {
    let (status, provider_ref, error) = match outcome {
        DispatchOutcome::Sent(receipt) => (AttemptStatus::InProgress, Some(receipt.provider_ref), None),
        DispatchOutcome::Failed(reason) | DispatchOutcome::Retry(reason) => {
            (AttemptStatus::Failed, None, Some(reason))
        }
        DispatchOutcome::Skipped(status) => (status, None, None),
    };
    RouteOutcome {
        attempt_id,
        mode: RouteMode::Direct,
        status,
        provider_ref,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, MockAdapter};
    use outreach_core::types::{AbTest, Campaign, LeadStatus};
    use outreach_queue::{MemoryBackend, QueueBackend};

    struct Harness {
        fx: Fixture,
        backend: Arc<MemoryBackend>,
        router: Arc<ChannelRouter>,
    }

    fn harness(adapters: Vec<Arc<MockAdapter>>, queue_up: bool) -> Harness {
        let fx = Fixture::new();
        let (router, backend) = fx.router(adapters, queue_up);
        Harness { fx, backend, router }
    }

    #[tokio::test]
    async fn test_sms_without_phone_creates_no_attempt() {
        let h = harness(vec![MockAdapter::ok(Channel::Sms, "SM1")], true);
        let lead = h.fx.lead_with_email("NoPhone");
        h.fx.default_script(Channel::Sms, "hi");

        let err = h
            .router
            .route_contact(&ContactRequest::new(&lead.id, Channel::Sms))
            .await
            .unwrap_err();
        assert!(matches!(err, OutreachError::Precondition(_)));
        assert_eq!(h.fx.store.count_attempts().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_do_not_contact_rejected() {
        let h = harness(vec![MockAdapter::ok(Channel::Email, "e1")], true);
        let lead = h.fx.lead_with_email("Opted");
        h.fx.store.update_lead_status(&lead.id, LeadStatus::DoNotContact).unwrap();
        h.fx.default_script(Channel::Email, "hi");

        let err = h
            .router
            .route_contact(&ContactRequest::new(&lead.id, Channel::Email))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("DO_NOT_CONTACT"));
        assert_eq!(h.fx.store.count_attempts().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_available_queue_leaves_attempt_pending() {
        let sms = MockAdapter::ok(Channel::Sms, "SM1");
        let h = harness(vec![sms.clone()], true);
        let lead = h.fx.lead_with_phone("Ana");
        let script = h.fx.default_script(Channel::Sms, "hi");

        let out = h
            .router
            .route_contact(&ContactRequest::new(&lead.id, Channel::Sms))
            .await
            .unwrap();
        assert_eq!(out.mode, RouteMode::Queued);
        assert_eq!(out.status, AttemptStatus::Pending);
        assert_eq!(sms.calls(), 0);

        let waiting = h.backend.waiting("outreach-sms");
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].payload.attempt_id, out.attempt_id);
        assert_eq!(waiting[0].payload.script_id, script.id);
    }

    #[tokio::test]
    async fn test_unavailable_queue_sends_directly() {
        let sms = MockAdapter::ok(Channel::Sms, "SM9");
        let h = harness(vec![sms.clone()], false);
        let lead = h.fx.lead_with_phone("Ana");
        h.fx.default_script(Channel::Sms, "hi");

        let out = h
            .router
            .route_contact(&ContactRequest::new(&lead.id, Channel::Sms))
            .await
            .unwrap();
        assert_eq!(out.mode, RouteMode::Direct);
        assert_eq!(out.status, AttemptStatus::InProgress);
        assert_eq!(out.provider_ref.as_deref(), Some("SM9"));

        let stored = h.fx.store.get_attempt(&out.attempt_id).unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::InProgress);
    }

    #[tokio::test]
    async fn test_direct_send_failure_is_terminal() {
        let sms = MockAdapter::failing(Channel::Sms, OutreachError::Transient("503".into()));
        let h = harness(vec![sms.clone()], false);
        let lead = h.fx.lead_with_phone("Ana");
        h.fx.default_script(Channel::Sms, "hi");

        let out = h
            .router
            .route_contact(&ContactRequest::new(&lead.id, Channel::Sms))
            .await
            .unwrap();
        assert!(out.failed());
        assert!(out.error.unwrap().contains("503"));
        assert_eq!(sms.calls(), 1);
        let stored = h.fx.store.get_attempt(&out.attempt_id).unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Failed);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_script_is_a_precondition() {
        let h = harness(vec![MockAdapter::ok(Channel::Push, "p1")], true);
        let lead = h.fx.lead_everywhere("Ana");

        let err = h
            .router
            .route_contact(&ContactRequest::new(&lead.id, Channel::Push))
            .await
            .unwrap_err();
        assert!(err.is_client_fault());
        let err = h
            .router
            .route_contact(&ContactRequest::new(&lead.id, Channel::Push).script(Some("ghost")))
            .await
            .unwrap_err();
        assert!(err.is_client_fault());
        assert_eq!(h.fx.store.count_attempts().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_running_ab_test_assigns_variant_and_counts_send() {
        let h = harness(vec![MockAdapter::ok(Channel::Email, "e1")], true);
        let lead = h.fx.lead_with_email("Ana");
        let campaign = Campaign::new("Spring");
        h.fx.store.insert_campaign(&campaign).unwrap();
        let a = h.fx.script(Channel::Email, "A");
        let b = h.fx.script(Channel::Email, "B");
        let test = AbTest::new(&campaign.id, Channel::Email, &a.id, &b.id);
        h.fx.store.insert_ab_test(&test).unwrap();

        let out = h
            .router
            .route_contact(&ContactRequest::new(&lead.id, Channel::Email).campaign(Some(&campaign.id)))
            .await
            .unwrap();
        let attempt = h.fx.store.get_attempt(&out.attempt_id).unwrap().unwrap();
        let variant = attempt.ab_variant.unwrap();
        assert_eq!(attempt.ab_test_id.as_deref(), Some(test.id.as_str()));
        assert_eq!(attempt.script_id.as_deref(), Some(test.script_for(variant)));

        let stored = h.fx.store.get_ab_test(&test.id).unwrap().unwrap();
        assert_eq!(stored.stats_a.sent + stored.stats_b.sent, 1);
    }

    #[tokio::test]
    async fn test_drain_redispatches_stale_pending() {
        let sms = MockAdapter::ok(Channel::Sms, "SM-drain");
        let h = harness(vec![sms.clone()], true);
        let lead = h.fx.lead_with_phone("Ana");
        h.fx.default_script(Channel::Sms, "hi");

        let out = h
            .router
            .route_contact(&ContactRequest::new(&lead.id, Channel::Sms))
            .await
            .unwrap();
        // Not stale yet
        let report = h.router.process_queue(Utc::now()).await.unwrap();
        assert_eq!(report.found, 0);

        let later = Utc::now() + Duration::minutes(11);
        let report = h.router.process_queue(later).await.unwrap();
        assert_eq!(report.found, 1);
        assert_eq!(report.sent, 1);
        let stored = h.fx.store.get_attempt(&out.attempt_id).unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::InProgress);
        assert_eq!(stored.provider_ref.as_deref(), Some("SM-drain"));

        // The queued copy is now a no-op for the worker.
        let queued = h.backend.pop("outreach-sms").await.unwrap().unwrap();
        let again = h
            .router
            .dispatcher
            .process_channel_job(&queued.payload, DeliveryMode::Direct)
            .await
            .unwrap();
        assert_eq!(again, DispatchOutcome::Skipped(AttemptStatus::InProgress));
        assert_eq!(sms.calls(), 1);
    }
}
