//! Provider events: the shared landing point for webhooks and call-log sync.
//!
//! An event names an attempt by `provider_ref`. Terminal attempts are never
//! overwritten, so a repeated or out-of-order delivery is a silent no-op.

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, Result};
use outreach_core::types::{
    AttemptResult, AttemptStatus, EnrollmentStatus, ProviderEvent, StepExecutionResult,
    StepExecutionStatus, TriggerType,
};
use outreach_store::Store;
use serde::Serialize;
use std::sync::Arc;

use crate::abtest::AbEvaluator;
use crate::background::spawn_detached;
use crate::enrollment::Enrollments;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOutcome {
    /// An attempt with this provider ref exists.
    pub matched: bool,
    /// The attempt changed.
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_execution: Option<StepExecutionStatus>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionOutcome {
    pub lead_id: String,
    pub enrollments_converted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ab_test_id: Option<String>,
    pub already_converted: bool,
}

pub struct ProviderEvents {
    store: Arc<Store>,
    enrollments: Arc<Enrollments>,
    ab: Arc<AbEvaluator>,
}

impl ProviderEvents {
    pub fn new(store: Arc<Store>, enrollments: Arc<Enrollments>, ab: Arc<AbEvaluator>) -> Self {
        Self { store, enrollments, ab }
    }

    pub async fn apply(&self, event: &ProviderEvent) -> Result<EventOutcome> {
        self.apply_at(event, Utc::now()).await
    }

    /// Patch the matching attempt, complete its sequence step when the event
    /// is terminal, and start follow-up enrollment for no-answers and bounces.
    pub async fn apply_at(&self, event: &ProviderEvent, now: DateTime<Utc>) -> Result<EventOutcome> {
        let Some(attempt) = self.store.find_attempt_by_provider_ref(&event.provider_ref)? else {
            tracing::debug!("📭 No attempt for provider ref {}", event.provider_ref);
            return Ok(EventOutcome::default());
        };
        let mut outcome = EventOutcome {
            matched: true,
            attempt_id: Some(attempt.id.clone()),
            ..EventOutcome::default()
        };
        if attempt.status.is_terminal() {
            tracing::debug!(
                "⏭️ Attempt {} already {}, ignoring {} from {}",
                attempt.id,
                attempt.status,
                event.status,
                attempt.provider.as_deref().unwrap_or("-")
            );
            return Ok(outcome);
        }

        outcome.applied = self.store.apply_attempt_event(&attempt.id, event, now)?;
        if !outcome.applied {
            return Ok(outcome);
        }
        tracing::info!(
            "📨 Attempt {} on {} ({}) → {}",
            attempt.id,
            attempt.channel,
            attempt.provider.as_deref().unwrap_or("-"),
            event.status
        );

        if event.status.is_terminal() {
            if let Some(execution) = self.store.execution_for_attempt(&attempt.id)? {
                let to = if event.status == AttemptStatus::Success {
                    StepExecutionStatus::Delivered
                } else {
                    StepExecutionStatus::Failed
                };
                if self
                    .store
                    .complete_sent_execution(&execution.id, to, &step_result(event))?
                {
                    outcome.step_execution = Some(to);
                }
            }
        }

        let trigger = match event.status {
            AttemptStatus::NoAnswer => Some(TriggerType::NoAnswer),
            AttemptStatus::Bounced => Some(TriggerType::EmailBounced),
            _ => None,
        };
        if let Some(trigger) = trigger {
            let enrollments = self.enrollments.clone();
            let lead_id = attempt.lead_id.clone();
            spawn_detached(
                self.store.clone(),
                "auto-enroll",
                Some(format!("lead={} trigger={trigger}", attempt.lead_id)),
                async move {
                    enrollments.auto_enroll_by_trigger(&lead_id, trigger, Some("provider-event"))?;
                    Ok(())
                },
            );
        }
        Ok(outcome)
    }

    /// Mark the lead CONVERTED, exit sequences that end on conversion, and
    /// credit the A/B variant that last contacted the lead. Converting a lead
    /// twice is a no-op reported as `alreadyConverted`.
    pub fn convert_lead(&self, lead_id: &str, now: DateTime<Utc>) -> Result<ConversionOutcome> {
        let mut outcome = ConversionOutcome {
            lead_id: lead_id.to_string(),
            ..ConversionOutcome::default()
        };
        if !self.store.mark_lead_converted(lead_id)? {
            return match self.store.get_lead(lead_id)? {
                Some(_) => {
                    tracing::debug!("⏭️ Lead {lead_id} already converted");
                    outcome.already_converted = true;
                    Ok(outcome)
                }
                None => Err(OutreachError::NotFound(format!("lead {lead_id}"))),
            };
        }

        for enrollment in self.store.enrollments_for_lead(lead_id)? {
            if enrollment.status.is_terminal() {
                continue;
            }
            let exits = self
                .store
                .get_sequence(&enrollment.sequence_id)?
                .is_some_and(|s| s.exit_on_conversion);
            if !exits {
                continue;
            }
            let from = [EnrollmentStatus::Active, EnrollmentStatus::Paused];
            if self
                .store
                .set_enrollment_status(&enrollment.id, &from, EnrollmentStatus::Converted, now)?
            {
                self.store.skip_scheduled_executions(&enrollment.id, now)?;
                outcome.enrollments_converted += 1;
            }
        }

        if let Some((test_id, variant)) = self.store.latest_ab_assignment(lead_id)? {
            self.ab.record_conversion(&test_id, variant)?;
            outcome.ab_test_id = Some(test_id);
        }
        tracing::info!(
            "🎉 Lead {lead_id} converted, {} enrollments closed",
            outcome.enrollments_converted
        );
        Ok(outcome)
    }
}

fn step_result(event: &ProviderEvent) -> StepExecutionResult {
    let (recording_url, outcome) = match &event.result {
        Some(AttemptResult::Call {
            recording_url,
            outcome,
            summary,
            ..
        }) => (recording_url.clone(), outcome.clone().or_else(|| summary.clone())),
        Some(AttemptResult::Message {
            error_code: Some(code), ..
        }) => (None, Some(format!("error {code}"))),
        _ => (None, None),
    };
    StepExecutionResult {
        call_status: Some(event.status.as_str().to_string()),
        duration_secs: event.duration_secs,
        cost: event.cost,
        recording_url,
        outcome,
        error: (event.status == AttemptStatus::Failed)
            .then(|| event.notes.clone())
            .flatten(),
    }
}
