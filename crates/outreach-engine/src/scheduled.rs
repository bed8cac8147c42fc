//! One-off contacts planned for a future time, routed when due.

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, Result};
use outreach_core::types::{Channel, ScheduledContact, ScheduledContactStatus, new_id};
use outreach_store::Store;
use serde::Serialize;
use std::sync::Arc;

use crate::router::{ChannelRouter, ContactRequest};

const DUE_BATCH: usize = 100;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReport {
    pub due: usize,
    pub done: usize,
    pub failed: usize,
}

pub struct ScheduledContacts {
    store: Arc<Store>,
    router: Arc<ChannelRouter>,
}

impl ScheduledContacts {
    pub fn new(store: Arc<Store>, router: Arc<ChannelRouter>) -> Self {
        Self { store, router }
    }

    pub fn schedule(
        &self,
        lead_id: &str,
        channel: Channel,
        at: DateTime<Utc>,
        campaign_id: Option<&str>,
        script_id: Option<&str>,
    ) -> Result<ScheduledContact> {
        if self.store.get_lead(lead_id)?.is_none() {
            return Err(OutreachError::NotFound(format!("lead {lead_id}")));
        }
        let contact = ScheduledContact {
            id: new_id(),
            lead_id: lead_id.to_string(),
            campaign_id: campaign_id.map(String::from),
            channel,
            script_id: script_id.map(String::from),
            scheduled_at: at,
            status: ScheduledContactStatus::Pending,
            attempt_id: None,
            error: None,
        };
        self.store.insert_scheduled_contact(&contact)?;
        tracing::debug!("🗓️ Contact {} on {channel} scheduled for {at}", contact.id);
        Ok(contact)
    }

    /// Route every due contact. Routing errors finish the contact as FAILED
    /// instead of aborting the batch.
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<ScheduledReport> {
        let due = self.store.due_scheduled_contacts(now, DUE_BATCH)?;
        let mut report = ScheduledReport {
            due: due.len(),
            ..ScheduledReport::default()
        };
        for contact in due {
            let req = ContactRequest::new(&contact.lead_id, contact.channel)
                .campaign(contact.campaign_id.as_deref())
                .script(contact.script_id.as_deref());
            let (status, attempt_id, error) = match self.router.route_contact(&req).await {
                Ok(outcome) if outcome.failed() => {
                    (ScheduledContactStatus::Failed, Some(outcome.attempt_id), outcome.error)
                }
                Ok(outcome) => (ScheduledContactStatus::Done, Some(outcome.attempt_id), None),
                Err(e) => (ScheduledContactStatus::Failed, None, Some(e.to_string())),
            };
            if !self.store.finish_scheduled_contact(
                &contact.id,
                status,
                attempt_id.as_deref(),
                error.as_deref(),
            )? {
                continue;
            }
            match status {
                ScheduledContactStatus::Failed => {
                    tracing::warn!(
                        "⚠️ Scheduled contact {} on {} failed: {}",
                        contact.id,
                        contact.channel,
                        error.as_deref().unwrap_or("-")
                    );
                    report.failed += 1;
                }
                _ => report.done += 1,
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, MockAdapter};
    use chrono::Duration;

    #[tokio::test]
    async fn test_due_contacts_are_routed_once() {
        let fx = Fixture::new();
        let sms = MockAdapter::ok(Channel::Sms, "SM-1");
        let (router, _) = fx.router(vec![sms.clone()], false);
        let scheduled = ScheduledContacts::new(fx.store.clone(), router);
        fx.default_script(Channel::Sms, "Hi {{first_name}}");
        let ana = fx.lead_with_phone("Ana");
        let bo = fx.lead_with_email("Bo");
        let now = Utc::now();

        let due = scheduled.schedule(&ana.id, Channel::Sms, now - Duration::minutes(1), None, None).unwrap();
        let unreachable = scheduled.schedule(&bo.id, Channel::Sms, now, None, None).unwrap();
        let later = scheduled.schedule(&ana.id, Channel::Sms, now + Duration::hours(1), None, None).unwrap();

        let report = scheduled.process_due(now).await.unwrap();
        assert_eq!((report.due, report.done, report.failed), (2, 1, 1));
        assert_eq!(sms.calls(), 1);

        let done = fx.store.get_scheduled_contact(&due.id).unwrap().unwrap();
        assert_eq!(done.status, ScheduledContactStatus::Done);
        assert!(done.attempt_id.is_some());
        let failed = fx.store.get_scheduled_contact(&unreachable.id).unwrap().unwrap();
        assert!(failed.error.unwrap().contains("phone"));
        assert_eq!(
            fx.store.get_scheduled_contact(&later.id).unwrap().unwrap().status,
            ScheduledContactStatus::Pending
        );

        assert_eq!(scheduled.process_due(now).await.unwrap().due, 0);
    }

    #[tokio::test]
    async fn test_schedule_requires_lead() {
        let fx = Fixture::new();
        let (router, _) = fx.router(vec![], false);
        let scheduled = ScheduledContacts::new(fx.store.clone(), router);
        assert!(matches!(
            scheduled.schedule("ghost", Channel::Sms, Utc::now(), None, None),
            Err(OutreachError::NotFound(_))
        ));
    }
}
