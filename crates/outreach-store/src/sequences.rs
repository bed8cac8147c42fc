//! Retention sequences, enrollments, and step executions.

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, Result};
use outreach_core::types::{
    EnrollmentStatus, RetentionSequence, SequenceEnrollment, SequenceStatus, SequenceStep,
    SequenceStepExecution, StepCondition, StepExecutionResult, StepExecutionStatus, TriggerType,
};
use rusqlite::{OptionalExtension, params};

use crate::{Store, col_enum, col_json, db_err, parse_opt_ts, parse_ts, to_json, ts};

const STEP_COLUMNS: &str = "id, sequence_id, step_order, channel, delay_value, delay_unit, \
    script_id, subject, content, condition";

const ENROLLMENT_COLUMNS: &str = "id, sequence_id, lead_id, status, current_step, enrolled_at, \
    completed_at, last_step_at, source";

const EXECUTION_COLUMNS: &str = "id, enrollment_id, step_id, status, scheduled_at, executed_at, \
    contact_attempt_id, result";

fn row_to_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<SequenceStep> {
    Ok(SequenceStep {
        id: row.get(0)?,
        sequence_id: row.get(1)?,
        step_order: row.get(2)?,
        channel: col_enum(row, 3)?,
        delay_value: row.get(4)?,
        delay_unit: col_enum(row, 5)?,
        script_id: row.get(6)?,
        subject: row.get(7)?,
        content: row.get(8)?,
        condition: col_json::<StepCondition>(row, 9)?.unwrap_or_default(),
    })
}

fn row_to_enrollment(row: &rusqlite::Row<'_>) -> rusqlite::Result<SequenceEnrollment> {
    Ok(SequenceEnrollment {
        id: row.get(0)?,
        sequence_id: row.get(1)?,
        lead_id: row.get(2)?,
        status: col_enum(row, 3)?,
        current_step: row.get(4)?,
        enrolled_at: parse_ts(&row.get::<_, String>(5)?)?,
        completed_at: parse_opt_ts(row.get(6)?)?,
        last_step_at: parse_opt_ts(row.get(7)?)?,
        source: row.get(8)?,
    })
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<SequenceStepExecution> {
    Ok(SequenceStepExecution {
        id: row.get(0)?,
        enrollment_id: row.get(1)?,
        step_id: row.get(2)?,
        status: col_enum(row, 3)?,
        scheduled_at: parse_ts(&row.get::<_, String>(4)?)?,
        executed_at: parse_opt_ts(row.get(5)?)?,
        contact_attempt_id: row.get(6)?,
        result: col_json(row, 7)?,
    })
}

fn status_list(statuses: &[EnrollmentStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Store {
    // ─── Sequences ────────────────────────────────────────────

    /// Insert a sequence together with its steps.
    pub fn insert_sequence(&self, sequence: &RetentionSequence) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO retention_sequences (id, name, status, campaign_id, trigger_type, exit_on_conversion, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sequence.id,
                sequence.name,
                sequence.status.as_str(),
                sequence.campaign_id,
                sequence.trigger_type.map(|t| t.as_str()),
                sequence.exit_on_conversion as i64,
                ts(&sequence.created_at),
            ],
        )
        .map_err(db_err)?;
        for step in &sequence.steps {
            insert_step_tx(&tx, step)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn insert_step(&self, step: &SequenceStep) -> Result<()> {
        let conn = self.conn()?;
        insert_step_tx(&conn, step)
    }

    pub fn get_sequence(&self, id: &str) -> Result<Option<RetentionSequence>> {
        let conn = self.conn()?;
        let seq = conn
            .query_row(
                "SELECT id, name, status, campaign_id, trigger_type, exit_on_conversion, created_at
                 FROM retention_sequences WHERE id = ?1",
                params![id],
                row_to_sequence_header,
            )
            .optional()
            .map_err(db_err)?;
        match seq {
            Some(mut seq) => {
                seq.steps = load_steps(&conn, &seq.id)?;
                Ok(Some(seq))
            }
            None => Ok(None),
        }
    }

    /// All sequences in `status`, each with its ordered steps.
    pub fn sequences_with_status(&self, status: SequenceStatus) -> Result<Vec<RetentionSequence>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, status, campaign_id, trigger_type, exit_on_conversion, created_at
                 FROM retention_sequences WHERE status = ?1 ORDER BY created_at",
            )
            .map_err(db_err)?;
        let mut sequences = stmt
            .query_map(params![status.as_str()], row_to_sequence_header)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        for seq in sequences.iter_mut() {
            seq.steps = load_steps(&conn, &seq.id)?;
        }
        Ok(sequences)
    }

    /// ACTIVE sequences auto-enrolling on `trigger`.
    pub fn active_sequences_for_trigger(&self, trigger: TriggerType) -> Result<Vec<RetentionSequence>> {
        Ok(self
            .sequences_with_status(SequenceStatus::Active)?
            .into_iter()
            .filter(|s| s.trigger_type == Some(trigger))
            .collect())
    }

    /// Conditional status change; false if the sequence was not in `from`.
    pub fn set_sequence_status(&self, id: &str, from: SequenceStatus, to: SequenceStatus) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                "UPDATE retention_sequences SET status = ?3 WHERE id = ?1 AND status = ?2",
                params![id, from.as_str(), to.as_str()],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    // ─── Enrollments ──────────────────────────────────────────

    /// Insert unless (sequence, lead) is already enrolled. Returns whether a row was added.
    pub fn insert_enrollment(&self, enrollment: &SequenceEnrollment) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO sequence_enrollments ({ENROLLMENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    enrollment.id,
                    enrollment.sequence_id,
                    enrollment.lead_id,
                    enrollment.status.as_str(),
                    enrollment.current_step,
                    ts(&enrollment.enrolled_at),
                    enrollment.completed_at.as_ref().map(ts),
                    enrollment.last_step_at.as_ref().map(ts),
                    enrollment.source,
                ],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn get_enrollment(&self, id: &str) -> Result<Option<SequenceEnrollment>> {
        self.conn()?
            .query_row(
                &format!("SELECT {ENROLLMENT_COLUMNS} FROM sequence_enrollments WHERE id = ?1"),
                params![id],
                row_to_enrollment,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn find_enrollment(&self, sequence_id: &str, lead_id: &str) -> Result<Option<SequenceEnrollment>> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM sequence_enrollments
                     WHERE sequence_id = ?1 AND lead_id = ?2"
                ),
                params![sequence_id, lead_id],
                row_to_enrollment,
            )
            .optional()
            .map_err(db_err)
    }

    /// ACTIVE enrollments of a sequence that may have work at `now`, least
    /// recently advanced first. An enrollment whose current step is already
    /// SCHEDULED for later is left out, so waiting rows never fill the batch.
    pub fn due_enrollments(
        &self,
        sequence_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SequenceEnrollment>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM sequence_enrollments e
                 WHERE e.sequence_id = ?1 AND e.status = 'ACTIVE'
                   AND NOT EXISTS (
                       SELECT 1 FROM sequence_step_executions x
                       WHERE x.enrollment_id = e.id AND x.status = 'SCHEDULED' AND x.scheduled_at > ?2
                   )
                 ORDER BY COALESCE(e.last_step_at, e.enrolled_at), e.id LIMIT ?3"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![sequence_id, ts(&now), limit as i64], row_to_enrollment)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn enrollments_for_lead(&self, lead_id: &str) -> Result<Vec<SequenceEnrollment>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM sequence_enrollments WHERE lead_id = ?1 ORDER BY enrolled_at"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![lead_id], row_to_enrollment).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Compare-and-set advance of `current_step` from `expected` to `expected + 1`.
    /// The pointer only ever moves forward.
    pub fn advance_enrollment(&self, id: &str, expected: i64, now: DateTime<Utc>) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                "UPDATE sequence_enrollments
                 SET current_step = current_step + 1, last_step_at = ?3
                 WHERE id = ?1 AND current_step = ?2 AND status = 'ACTIVE'",
                params![id, expected, ts(&now)],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// Move an enrollment to `to` if its status is one of `from`.
    pub fn set_enrollment_status(
        &self,
        id: &str,
        from: &[EnrollmentStatus],
        to: EnrollmentStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Err(OutreachError::InvalidTransition("empty source status set".into()));
        }
        let completed_at = to.is_terminal().then(|| ts(&now));
        let n = self
            .conn()?
            .execute(
                &format!(
                    "UPDATE sequence_enrollments
                     SET status = ?2, completed_at = COALESCE(?3, completed_at)
                     WHERE id = ?1 AND status IN ({})",
                    status_list(from)
                ),
                params![id, to.as_str(), completed_at],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    // ─── Step executions ──────────────────────────────────────

    pub fn get_execution(&self, enrollment_id: &str, step_id: &str) -> Result<Option<SequenceStepExecution>> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM sequence_step_executions
                     WHERE enrollment_id = ?1 AND step_id = ?2"
                ),
                params![enrollment_id, step_id],
                row_to_execution,
            )
            .optional()
            .map_err(db_err)
    }

    /// Create the execution row for (enrollment, step) once; later calls return the existing row.
    pub fn ensure_execution(
        &self,
        enrollment_id: &str,
        step_id: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<SequenceStepExecution> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO sequence_step_executions (id, enrollment_id, step_id, status, scheduled_at)
             VALUES (?1, ?2, ?3, 'SCHEDULED', ?4)",
            params![outreach_core::types::new_id(), enrollment_id, step_id, ts(&scheduled_at)],
        )
        .map_err(db_err)?;
        conn.query_row(
            &format!(
                "SELECT {EXECUTION_COLUMNS} FROM sequence_step_executions
                 WHERE enrollment_id = ?1 AND step_id = ?2"
            ),
            params![enrollment_id, step_id],
            row_to_execution,
        )
        .map_err(db_err)
    }

    /// SCHEDULED → `to`. False if the execution already left SCHEDULED.
    pub fn finish_execution(
        &self,
        id: &str,
        to: StepExecutionStatus,
        executed_at: DateTime<Utc>,
        attempt_id: Option<&str>,
        result: Option<&StepExecutionResult>,
    ) -> Result<bool> {
        let result = result.map(serde_json::to_string).transpose()?;
        let n = self
            .conn()?
            .execute(
                "UPDATE sequence_step_executions
                 SET status = ?2, executed_at = ?3, contact_attempt_id = ?4, result = ?5
                 WHERE id = ?1 AND status = 'SCHEDULED'",
                params![id, to.as_str(), ts(&executed_at), attempt_id, result],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn execution_for_attempt(&self, attempt_id: &str) -> Result<Option<SequenceStepExecution>> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM sequence_step_executions WHERE contact_attempt_id = ?1"
                ),
                params![attempt_id],
                row_to_execution,
            )
            .optional()
            .map_err(db_err)
    }

    /// SENT → DELIVERED/FAILED from an asynchronous channel result.
    pub fn complete_sent_execution(
        &self,
        id: &str,
        to: StepExecutionStatus,
        result: &StepExecutionResult,
    ) -> Result<bool> {
        let result = serde_json::to_string(result)?;
        let n = self
            .conn()?
            .execute(
                "UPDATE sequence_step_executions SET status = ?2, result = ?3
                 WHERE id = ?1 AND status = 'SENT'",
                params![id, to.as_str(), result],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// Mark every still-SCHEDULED execution of an enrollment SKIPPED.
    pub fn skip_scheduled_executions(&self, enrollment_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let n = self
            .conn()?
            .execute(
                "UPDATE sequence_step_executions SET status = 'SKIPPED', executed_at = ?2
                 WHERE enrollment_id = ?1 AND status = 'SCHEDULED'",
                params![enrollment_id, ts(&now)],
            )
            .map_err(db_err)?;
        Ok(n)
    }
}

fn row_to_sequence_header(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetentionSequence> {
    let trigger: Option<String> = row.get(4)?;
    let trigger_type = trigger
        .map(|t| {
            t.parse::<TriggerType>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
            })
        })
        .transpose()?;
    Ok(RetentionSequence {
        id: row.get(0)?,
        name: row.get(1)?,
        status: col_enum(row, 2)?,
        campaign_id: row.get(3)?,
        trigger_type,
        exit_on_conversion: row.get::<_, i64>(5)? != 0,
        created_at: parse_ts(&row.get::<_, String>(6)?)?,
        steps: Vec::new(),
    })
}

fn load_steps(conn: &rusqlite::Connection, sequence_id: &str) -> Result<Vec<SequenceStep>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM sequence_steps WHERE sequence_id = ?1 ORDER BY step_order"
        ))
        .map_err(db_err)?;
    let rows = stmt.query_map(params![sequence_id], row_to_step).map_err(db_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
}

fn insert_step_tx(conn: &rusqlite::Connection, step: &SequenceStep) -> Result<()> {
    let condition = to_json(&Some(&step.condition))?;
    conn.execute(
        &format!("INSERT INTO sequence_steps ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            step.id,
            step.sequence_id,
            step.step_order,
            step.channel.as_str(),
            step.delay_value,
            step.delay_unit.as_str(),
            step.script_id,
            step.subject,
            step.content,
            condition,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::types::{Channel, DelayUnit, Lead, new_id};

    fn sequence_with_steps(n: i64) -> RetentionSequence {
        let id = new_id();
        RetentionSequence {
            id: id.clone(),
            name: "Winback".into(),
            status: SequenceStatus::Draft,
            campaign_id: None,
            trigger_type: Some(TriggerType::NewLead),
            exit_on_conversion: true,
            created_at: Utc::now(),
            steps: (0..n)
                .map(|i| SequenceStep {
                    id: new_id(),
                    sequence_id: id.clone(),
                    step_order: i + 1,
                    channel: Channel::Sms,
                    delay_value: i,
                    delay_unit: DelayUnit::Hours,
                    script_id: None,
                    subject: None,
                    content: Some(format!("step {}", i + 1)),
                    condition: StepCondition::Always,
                })
                .collect(),
        }
    }

    #[test]
    fn test_sequence_round_trip_with_ordered_steps() {
        let store = Store::open_in_memory().unwrap();
        let seq = sequence_with_steps(3);
        store.insert_sequence(&seq).unwrap();
        let loaded = store.get_sequence(&seq.id).unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 3);
        assert_eq!(loaded.steps[2].step_order, 3);
        assert_eq!(loaded.trigger_type, Some(TriggerType::NewLead));

        assert!(store.set_sequence_status(&seq.id, SequenceStatus::Draft, SequenceStatus::Active).unwrap());
        assert!(!store.set_sequence_status(&seq.id, SequenceStatus::Draft, SequenceStatus::Active).unwrap());
        assert_eq!(store.active_sequences_for_trigger(TriggerType::NewLead).unwrap().len(), 1);
        assert!(store.active_sequences_for_trigger(TriggerType::NoAnswer).unwrap().is_empty());
    }

    #[test]
    fn test_enrollment_uniqueness_and_advance_cas() {
        let store = Store::open_in_memory().unwrap();
        let seq = sequence_with_steps(2);
        store.insert_sequence(&seq).unwrap();
        let lead = Lead::new("Pia");
        store.insert_lead(&lead).unwrap();

        let enrollment = SequenceEnrollment {
            id: new_id(),
            sequence_id: seq.id.clone(),
            lead_id: lead.id.clone(),
            status: EnrollmentStatus::Active,
            current_step: 0,
            enrolled_at: Utc::now(),
            completed_at: None,
            last_step_at: None,
            source: Some("test".into()),
        };
        assert!(store.insert_enrollment(&enrollment).unwrap());
        let dup = SequenceEnrollment { id: new_id(), ..enrollment.clone() };
        assert!(!store.insert_enrollment(&dup).unwrap());

        let now = Utc::now();
        assert!(store.advance_enrollment(&enrollment.id, 0, now).unwrap());
        // Stale expectation loses the race
        assert!(!store.advance_enrollment(&enrollment.id, 0, now).unwrap());
        let loaded = store.get_enrollment(&enrollment.id).unwrap().unwrap();
        assert_eq!(loaded.current_step, 1);

        assert!(store
            .set_enrollment_status(&enrollment.id, &[EnrollmentStatus::Active], EnrollmentStatus::Completed, now)
            .unwrap());
        // Completed enrollments no longer advance
        assert!(!store.advance_enrollment(&enrollment.id, 1, now).unwrap());
    }

    #[test]
    fn test_execution_created_once_and_finished_once() {
        let store = Store::open_in_memory().unwrap();
        let seq = sequence_with_steps(1);
        store.insert_sequence(&seq).unwrap();
        let lead = Lead::new("Rui");
        store.insert_lead(&lead).unwrap();
        let enrollment = SequenceEnrollment {
            id: new_id(),
            sequence_id: seq.id.clone(),
            lead_id: lead.id.clone(),
            status: EnrollmentStatus::Active,
            current_step: 0,
            enrolled_at: Utc::now(),
            completed_at: None,
            last_step_at: None,
            source: None,
        };
        store.insert_enrollment(&enrollment).unwrap();

        let step_id = &seq.steps[0].id;
        let first = store.ensure_execution(&enrollment.id, step_id, Utc::now()).unwrap();
        let second = store.ensure_execution(&enrollment.id, step_id, Utc::now()).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, StepExecutionStatus::Scheduled);

        let now = Utc::now();
        assert!(store.finish_execution(&first.id, StepExecutionStatus::Sent, now, None, None).unwrap());
        assert!(!store.finish_execution(&first.id, StepExecutionStatus::Failed, now, None, None).unwrap());

        let delivered = StepExecutionResult::default();
        assert!(store.complete_sent_execution(&first.id, StepExecutionStatus::Delivered, &delivered).unwrap());
        assert!(!store.complete_sent_execution(&first.id, StepExecutionStatus::Failed, &delivered).unwrap());
        let loaded = store.get_execution(&enrollment.id, step_id).unwrap().unwrap();
        assert_eq!(loaded.status, StepExecutionStatus::Delivered);
    }

    #[test]
    fn test_waiting_enrollments_do_not_fill_the_batch() {
        let store = Store::open_in_memory().unwrap();
        let seq = sequence_with_steps(1);
        store.insert_sequence(&seq).unwrap();
        let now = Utc::now();
        let step_id = &seq.steps[0].id;

        let mut ids = Vec::new();
        for (i, name) in ["Ana", "Ben", "Cy"].into_iter().enumerate() {
            let lead = Lead::new(name);
            store.insert_lead(&lead).unwrap();
            let enrollment = SequenceEnrollment {
                id: new_id(),
                sequence_id: seq.id.clone(),
                lead_id: lead.id.clone(),
                status: EnrollmentStatus::Active,
                current_step: 0,
                enrolled_at: now - chrono::Duration::minutes(10 - i as i64),
                completed_at: None,
                last_step_at: None,
                source: None,
            };
            store.insert_enrollment(&enrollment).unwrap();
            ids.push(enrollment.id);
        }
        // The two oldest wait a week; the newest has no execution yet.
        for id in &ids[..2] {
            store.ensure_execution(id, step_id, now + chrono::Duration::days(7)).unwrap();
        }

        let due = store.due_enrollments(&seq.id, now, 2).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, ids[2]);

        let later = store.due_enrollments(&seq.id, now + chrono::Duration::days(8), 5).unwrap();
        assert_eq!(later.len(), 3);
    }
}
