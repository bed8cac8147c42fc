//! Enrollment API and sequence lifecycle.

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, Result};
use outreach_core::types::{
    EnrollmentStatus, LeadStatus, RetentionSequence, SequenceEnrollment, SequenceStatus, TriggerType, new_id,
};
use outreach_store::Store;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollOutcome {
    pub enrollment: SequenceEnrollment,
    /// False when the lead was already enrolled in this sequence.
    pub created: bool,
}

pub struct Enrollments {
    store: Arc<Store>,
}

impl Enrollments {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    // ─── Sequences ────────────────────────────────────────────

    /// Store a new sequence as DRAFT. Step order is renumbered from 0 in the
    /// given order.
    pub fn create_sequence(&self, mut sequence: RetentionSequence) -> Result<RetentionSequence> {
        if sequence.name.trim().is_empty() {
            return Err(OutreachError::Precondition("sequence name is required".into()));
        }
        sequence.status = SequenceStatus::Draft;
        for (order, step) in sequence.steps.iter_mut().enumerate() {
            step.sequence_id = sequence.id.clone();
            step.step_order = order as i64;
            if step.delay_value < 0 {
                return Err(OutreachError::Precondition(format!(
                    "step {order} has a negative delay"
                )));
            }
        }
        self.store.insert_sequence(&sequence)?;
        tracing::info!("🧭 Sequence '{}' created with {} steps", sequence.name, sequence.steps.len());
        Ok(sequence)
    }

    /// DRAFT/PAUSED → ACTIVE. A sequence without steps cannot run.
    pub fn activate_sequence(&self, id: &str) -> Result<RetentionSequence> {
        let sequence = self.load_sequence(id)?;
        if sequence.steps.is_empty() {
            return Err(OutreachError::Precondition(format!(
                "sequence {id} has no steps"
            )));
        }
        self.transition_sequence(sequence, SequenceStatus::Active)
    }

    pub fn pause_sequence(&self, id: &str) -> Result<RetentionSequence> {
        let sequence = self.load_sequence(id)?;
        self.transition_sequence(sequence, SequenceStatus::Paused)
    }

    pub fn archive_sequence(&self, id: &str) -> Result<RetentionSequence> {
        let sequence = self.load_sequence(id)?;
        self.transition_sequence(sequence, SequenceStatus::Archived)
    }

    fn transition_sequence(&self, mut sequence: RetentionSequence, to: SequenceStatus) -> Result<RetentionSequence> {
        let from = sequence.status;
        if !from.can_transition_to(to) {
            return Err(OutreachError::InvalidTransition(format!(
                "sequence {} cannot go from {from} to {to}",
                sequence.id
            )));
        }
        if !self.store.set_sequence_status(&sequence.id, from, to)? {
            return Err(OutreachError::InvalidTransition(format!(
                "sequence {} changed status concurrently",
                sequence.id
            )));
        }
        tracing::info!("🧭 Sequence '{}' {from} → {to}", sequence.name);
        sequence.status = to;
        Ok(sequence)
    }

    fn load_sequence(&self, id: &str) -> Result<RetentionSequence> {
        self.store
            .get_sequence(id)?
            .ok_or_else(|| OutreachError::NotFound(format!("sequence {id}")))
    }

    // ─── Enrollments ──────────────────────────────────────────

    /// Enroll a lead in an ACTIVE sequence. Enrolling twice returns the
    /// existing enrollment with `created: false`.
    pub fn enroll_lead(&self, sequence_id: &str, lead_id: &str, source: Option<&str>) -> Result<EnrollOutcome> {
        let sequence = self.load_sequence(sequence_id)?;
        if sequence.status != SequenceStatus::Active {
            return Err(OutreachError::Precondition(format!(
                "sequence {sequence_id} is {}, not ACTIVE",
                sequence.status
            )));
        }
        let lead = self
            .store
            .get_lead(lead_id)?
            .ok_or_else(|| OutreachError::NotFound(format!("lead {lead_id}")))?;
        if lead.status == LeadStatus::DoNotContact {
            return Err(OutreachError::Precondition(format!(
                "lead {lead_id} is marked DO_NOT_CONTACT"
            )));
        }

        let enrollment = SequenceEnrollment {
            id: new_id(),
            sequence_id: sequence_id.to_string(),
            lead_id: lead_id.to_string(),
            status: EnrollmentStatus::Active,
            current_step: 0,
            enrolled_at: Utc::now(),
            completed_at: None,
            last_step_at: None,
            source: source.map(String::from),
        };
        let created = self.store.insert_enrollment(&enrollment)?;
        let enrollment = if created {
            tracing::info!("📝 Lead {lead_id} enrolled in '{}'", sequence.name);
            enrollment
        } else {
            self.store
                .find_enrollment(sequence_id, lead_id)?
                .ok_or_else(|| OutreachError::NotFound(format!("enrollment {sequence_id}/{lead_id}")))?
        };
        Ok(EnrollOutcome { enrollment, created })
    }

    /// Enroll the lead in every ACTIVE sequence listening for `trigger`.
    /// Returns the ids of sequences that gained a new enrollment.
    pub fn auto_enroll_by_trigger(
        &self,
        lead_id: &str,
        trigger: TriggerType,
        source: Option<&str>,
    ) -> Result<Vec<String>> {
        let lead = self
            .store
            .get_lead(lead_id)?
            .ok_or_else(|| OutreachError::NotFound(format!("lead {lead_id}")))?;
        if lead.status == LeadStatus::DoNotContact {
            tracing::debug!("⏭️ Lead {lead_id} is DO_NOT_CONTACT, no {trigger} enrollment");
            return Ok(Vec::new());
        }
        let mut enrolled = Vec::new();
        for sequence in self.store.active_sequences_for_trigger(trigger)? {
            if self.enroll_lead(&sequence.id, lead_id, source)?.created {
                enrolled.push(sequence.id);
            }
        }
        if !enrolled.is_empty() {
            tracing::info!("📝 {trigger}: lead {lead_id} auto-enrolled in {} sequences", enrolled.len());
        }
        Ok(enrolled)
    }

    pub fn pause_enrollment(&self, id: &str, now: DateTime<Utc>) -> Result<SequenceEnrollment> {
        self.transition_enrollment(id, EnrollmentStatus::Paused, now)
    }

    pub fn resume_enrollment(&self, id: &str, now: DateTime<Utc>) -> Result<SequenceEnrollment> {
        self.transition_enrollment(id, EnrollmentStatus::Active, now)
    }

    /// Cancel and skip whatever step was scheduled.
    pub fn cancel_enrollment(&self, id: &str, now: DateTime<Utc>) -> Result<SequenceEnrollment> {
        let enrollment = self.transition_enrollment(id, EnrollmentStatus::Cancelled, now)?;
        self.store.skip_scheduled_executions(id, now)?;
        Ok(enrollment)
    }

    fn transition_enrollment(&self, id: &str, to: EnrollmentStatus, now: DateTime<Utc>) -> Result<SequenceEnrollment> {
        let enrollment = self
            .store
            .get_enrollment(id)?
            .ok_or_else(|| OutreachError::NotFound(format!("enrollment {id}")))?;
        let from = enrollment.status;
        if !from.can_transition_to(to) {
            return Err(OutreachError::InvalidTransition(format!(
                "enrollment {id} cannot go from {from} to {to}"
            )));
        }
        if !self.store.set_enrollment_status(id, &[from], to, now)? {
            return Err(OutreachError::InvalidTransition(format!(
                "enrollment {id} changed status concurrently"
            )));
        }
        tracing::debug!("📝 Enrollment {id} {from} → {to}");
        self.store
            .get_enrollment(id)?
            .ok_or_else(|| OutreachError::NotFound(format!("enrollment {id}")))
    }
}
