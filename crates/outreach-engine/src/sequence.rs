//! Sequence Processor: advances ACTIVE enrollments one step at a time.
//!
//! `current_step` counts the steps an enrollment has moved past and is the
//! only advancement signal. Each (enrollment, step) pair has exactly one
//! execution row; a row that already left SCHEDULED is never dispatched
//! again, only moved past.

use chrono::{DateTime, Utc};
use outreach_core::config::SequenceConfig;
use outreach_core::error::Result;
use outreach_core::types::{
    EnrollmentStatus, Lead, LeadStatus, RetentionSequence, Script, SequenceEnrollment, SequenceStatus,
    SequenceStep, SequenceStepExecution, StepCondition, StepExecutionResult, StepExecutionStatus,
};
use outreach_store::Store;
use serde::Serialize;
use std::sync::Arc;

use crate::router::{ChannelRouter, ContactRequest};

/// What one visit did to one enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    NotDue,
    /// Step routed; `failed` when the router could not dispatch it.
    Executed { failed: bool },
    /// Branch condition false.
    Skipped,
    /// Execution was already finished; only the pointer moved.
    Advanced,
    /// Lead opted out or disappeared.
    Cancelled,
    /// Lead converted and the sequence exits on conversion.
    Converted,
    /// Another writer finished the step first.
    Raced,
}

/// Summary of one `run_all` sweep.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceSweep {
    pub sequences: usize,
    pub enrollments: usize,
    pub executed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub advanced: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub converted: usize,
    pub errors: usize,
}

pub struct SequenceProcessor {
    store: Arc<Store>,
    router: Arc<ChannelRouter>,
    batch: usize,
}

impl SequenceProcessor {
    pub fn new(store: Arc<Store>, router: Arc<ChannelRouter>, config: &SequenceConfig) -> Self {
        Self {
            store,
            router,
            batch: config.batch.max(1),
        }
    }

    pub async fn run_all(&self) -> Result<SequenceSweep> {
        self.run_all_at(Utc::now()).await
    }

    /// One pass over every ACTIVE sequence. A failing enrollment is logged
    /// and counted; the sweep continues.
    pub async fn run_all_at(&self, now: DateTime<Utc>) -> Result<SequenceSweep> {
        let mut sweep = SequenceSweep::default();
        for sequence in self.store.sequences_with_status(SequenceStatus::Active)? {
            sweep.sequences += 1;
            for enrollment in self.store.due_enrollments(&sequence.id, now, self.batch)? {
                sweep.enrollments += 1;
                match self.visit(&sequence, &enrollment, now).await {
                    Ok((action, completed)) => {
                        match action {
                            StepAction::Executed { failed: false } => sweep.executed += 1,
                            StepAction::Executed { failed: true } => sweep.failed += 1,
                            StepAction::Skipped => sweep.skipped += 1,
                            StepAction::Advanced => sweep.advanced += 1,
                            StepAction::Cancelled => sweep.cancelled += 1,
                            StepAction::Converted => sweep.converted += 1,
                            StepAction::NotDue | StepAction::Raced => {}
                        }
                        if completed {
                            sweep.completed += 1;
                        }
                    }
                    Err(e) => {
                        sweep.errors += 1;
                        tracing::error!(
                            "❌ Sequence '{}' enrollment {} failed: {e}",
                            sequence.name,
                            enrollment.id
                        );
                    }
                }
            }
        }
        if sweep.executed + sweep.failed + sweep.completed > 0 {
            tracing::info!(
                "🧭 Sequences: {} executed, {} failed, {} completed",
                sweep.executed,
                sweep.failed,
                sweep.completed
            );
        }
        Ok(sweep)
    }

    /// Process the enrollment's current step. The returned flag reports
    /// whether the enrollment completed during this visit.
    async fn visit(
        &self,
        sequence: &RetentionSequence,
        enrollment: &SequenceEnrollment,
        now: DateTime<Utc>,
    ) -> Result<(StepAction, bool)> {
        let index = usize::try_from(enrollment.current_step).unwrap_or(usize::MAX);
        let Some(step) = sequence.steps.get(index) else {
            let completed =
                self.store
                    .set_enrollment_status(&enrollment.id, &[EnrollmentStatus::Active], EnrollmentStatus::Completed, now)?;
            return Ok((StepAction::Advanced, completed));
        };

        let base = enrollment.last_step_at.unwrap_or(enrollment.enrolled_at);
        let execution = self
            .store
            .ensure_execution(&enrollment.id, &step.id, base + step.delay())?;

        // Opt-out is checked on every visit, right before anything is sent.
        let lead = match self.store.get_lead(&enrollment.lead_id)? {
            Some(lead) if lead.status != LeadStatus::DoNotContact => lead,
            _ => return self.stop(enrollment, EnrollmentStatus::Cancelled, now),
        };
        if lead.status == LeadStatus::Converted && sequence.exit_on_conversion {
            return self.stop(enrollment, EnrollmentStatus::Converted, now);
        }

        if execution.status != StepExecutionStatus::Scheduled {
            let at = execution.executed_at.unwrap_or(now);
            let completed = self.move_past(sequence, enrollment, at)?;
            return Ok((StepAction::Advanced, completed));
        }
        if execution.scheduled_at > now {
            return Ok((StepAction::NotDue, false));
        }

        if !self.condition_holds(sequence, enrollment, index, &lead)? {
            if !self
                .store
                .finish_execution(&execution.id, StepExecutionStatus::Skipped, now, None, None)?
            {
                return Ok((StepAction::Raced, false));
            }
            tracing::debug!("⏭️ Enrollment {} step {} condition false, skipped", enrollment.id, index);
            let completed = self.move_past(sequence, enrollment, now)?;
            return Ok((StepAction::Skipped, completed));
        }

        let (status, attempt_id, result) = self.execute(sequence, step, &lead, &execution).await?;
        if !self.store.finish_execution(
            &execution.id,
            status,
            now,
            attempt_id.as_deref(),
            Some(&result),
        )? {
            return Ok((StepAction::Raced, false));
        }
        let completed = self.move_past(sequence, enrollment, now)?;
        Ok((
            StepAction::Executed {
                failed: status == StepExecutionStatus::Failed,
            },
            completed,
        ))
    }

    async fn execute(
        &self,
        sequence: &RetentionSequence,
        step: &SequenceStep,
        lead: &Lead,
        execution: &SequenceStepExecution,
    ) -> Result<(StepExecutionStatus, Option<String>, StepExecutionResult)> {
        let script_id = self.step_script(step)?;
        let request = ContactRequest::new(&lead.id, step.channel)
            .campaign(sequence.campaign_id.as_deref())
            .script(script_id.as_deref());

        Ok(match self.router.route_contact(&request).await {
            Ok(outcome) if outcome.failed() => {
                let error = outcome.error.clone().unwrap_or_else(|| "send failed".into());
                (
                    StepExecutionStatus::Failed,
                    Some(outcome.attempt_id),
                    StepExecutionResult::error(error),
                )
            }
            Ok(outcome) => (
                StepExecutionStatus::Sent,
                Some(outcome.attempt_id),
                StepExecutionResult {
                    call_status: Some(outcome.status.as_str().to_string()),
                    ..StepExecutionResult::default()
                },
            ),
            Err(e) => {
                tracing::warn!(
                    "⚠️ Execution {} on {} not routed: {e}",
                    execution.id,
                    step.channel
                );
                (StepExecutionStatus::Failed, None, StepExecutionResult::error(e.to_string()))
            }
        })
    }

    /// Script to send for a step. Inline content is stored as a script keyed
    /// by the step id so attempts can reference it.
    fn step_script(&self, step: &SequenceStep) -> Result<Option<String>> {
        if let Some(id) = &step.script_id {
            return Ok(Some(id.clone()));
        }
        let Some(content) = &step.content else {
            return Ok(None);
        };
        let mut script = Script::new(&format!("sequence step {}", step.step_order), step.channel, content);
        script.id = format!("step:{}", step.id);
        script.subject = step.subject.clone();
        self.store.upsert_script(&script)?;
        Ok(Some(script.id))
    }

    fn condition_holds(
        &self,
        sequence: &RetentionSequence,
        enrollment: &SequenceEnrollment,
        index: usize,
        lead: &Lead,
    ) -> Result<bool> {
        let step = &sequence.steps[index];
        Ok(match &step.condition {
            StepCondition::Always => true,
            StepCondition::PreviousStepStatus { statuses } => {
                let Some(previous) = index.checked_sub(1).and_then(|i| sequence.steps.get(i)) else {
                    return Ok(true);
                };
                self.store
                    .get_execution(&enrollment.id, &previous.id)?
                    .is_some_and(|e| statuses.contains(&e.status))
            }
            StepCondition::LeadStatusIs { statuses } => statuses.contains(&lead.status),
            StepCondition::NoReply => !self.store.has_success_since(&lead.id, enrollment.enrolled_at)?,
        })
    }

    /// Advance the pointer past the current step; complete the enrollment
    /// when that was the last one. Returns whether it completed.
    fn move_past(
        &self,
        sequence: &RetentionSequence,
        enrollment: &SequenceEnrollment,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if !self
            .store
            .advance_enrollment(&enrollment.id, enrollment.current_step, at)?
        {
            return Ok(false);
        }
        if enrollment.current_step + 1 >= sequence.steps.len() as i64 {
            let completed = self.store.set_enrollment_status(
                &enrollment.id,
                &[EnrollmentStatus::Active],
                EnrollmentStatus::Completed,
                at,
            )?;
            if completed {
                tracing::info!("🏁 Enrollment {} completed '{}'", enrollment.id, sequence.name);
            }
            return Ok(completed);
        }
        Ok(false)
    }

    fn stop(
        &self,
        enrollment: &SequenceEnrollment,
        to: EnrollmentStatus,
        now: DateTime<Utc>,
    ) -> Result<(StepAction, bool)> {
        let skipped = self.store.skip_scheduled_executions(&enrollment.id, now)?;
        if !self
            .store
            .set_enrollment_status(&enrollment.id, &[EnrollmentStatus::Active], to, now)?
        {
            return Ok((StepAction::Raced, false));
        }
        tracing::info!(
            "🛑 Enrollment {} → {to} for lead {}, {skipped} scheduled steps skipped",
            enrollment.id,
            enrollment.lead_id
        );
        let action = match to {
            EnrollmentStatus::Converted => StepAction::Converted,
            _ => StepAction::Cancelled,
        };
        Ok((action, false))
    }
}
