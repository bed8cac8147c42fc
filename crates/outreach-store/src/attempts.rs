//! Contact attempts, written by the router, the workers and webhook handlers.
//!
//! Status patches are conditional on the current status so that a terminal
//! attempt is never regressed by a stale writer.

use chrono::{DateTime, Utc};
use outreach_core::error::Result;
use outreach_core::types::{AttemptStatus, ContactAttempt, ProviderEvent, Variant};
use rusqlite::{OptionalExtension, params};

use crate::{Store, col_enum, col_json, db_err, parse_opt_ts, parse_ts, to_json, ts};

const ATTEMPT_COLUMNS: &str = "id, lead_id, channel, campaign_id, script_id, status, provider, \
    provider_ref, started_at, completed_at, duration_secs, cost, result, notes, ab_test_id, \
    ab_variant, created_at";

const OPEN_STATUSES: &str = "('PENDING', 'IN_PROGRESS')";

fn row_to_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactAttempt> {
    let ab_variant: Option<String> = row.get(15)?;
    Ok(ContactAttempt {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        channel: col_enum(row, 2)?,
        campaign_id: row.get(3)?,
        script_id: row.get(4)?,
        status: col_enum(row, 5)?,
        provider: row.get(6)?,
        provider_ref: row.get(7)?,
        started_at: parse_opt_ts(row.get(8)?)?,
        completed_at: parse_opt_ts(row.get(9)?)?,
        duration_secs: row.get(10)?,
        cost: row.get(11)?,
        result: col_json(row, 12)?,
        notes: row.get(13)?,
        ab_test_id: row.get(14)?,
        ab_variant: match ab_variant.as_deref() {
            Some("A") => Some(Variant::A),
            Some("B") => Some(Variant::B),
            _ => None,
        },
        created_at: parse_ts(&row.get::<_, String>(16)?)?,
    })
}

impl Store {
    pub fn insert_attempt(&self, attempt: &ContactAttempt) -> Result<()> {
        let result = to_json(&attempt.result)?;
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO contact_attempts ({ATTEMPT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    attempt.id,
                    attempt.lead_id,
                    attempt.channel.as_str(),
                    attempt.campaign_id,
                    attempt.script_id,
                    attempt.status.as_str(),
                    attempt.provider,
                    attempt.provider_ref,
                    attempt.started_at.as_ref().map(ts),
                    attempt.completed_at.as_ref().map(ts),
                    attempt.duration_secs,
                    attempt.cost,
                    result,
                    attempt.notes,
                    attempt.ab_test_id,
                    attempt.ab_variant.map(|v| v.as_str()),
                    ts(&attempt.created_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_attempt(&self, id: &str) -> Result<Option<ContactAttempt>> {
        self.conn()?
            .query_row(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM contact_attempts WHERE id = ?1"),
                params![id],
                row_to_attempt,
            )
            .optional()
            .map_err(db_err)
    }

    /// Exact providerRef match, newest first if a provider ever reuses ids.
    pub fn find_attempt_by_provider_ref(&self, provider_ref: &str) -> Result<Option<ContactAttempt>> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM contact_attempts WHERE provider_ref = ?1
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![provider_ref],
                row_to_attempt,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn attempts_for_lead(&self, lead_id: &str) -> Result<Vec<ContactAttempt>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM contact_attempts WHERE lead_id = ?1 ORDER BY created_at"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![lead_id], row_to_attempt).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn count_attempts(&self) -> Result<i64> {
        self.conn()?
            .query_row("SELECT COUNT(*) FROM contact_attempts", [], |r| r.get(0))
            .map_err(db_err)
    }

    /// Claim a PENDING attempt for sending: PENDING → IN_PROGRESS with no
    /// provider reference yet. Only one caller wins; the others must not send.
    pub fn claim_attempt(&self, id: &str, provider: &str, now: DateTime<Utc>) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                "UPDATE contact_attempts
                 SET status = 'IN_PROGRESS', provider = ?2, started_at = ?3
                 WHERE id = ?1 AND status = 'PENDING'",
                params![id, provider, ts(&now)],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// Undo a claim whose send hit a retryable fault, so the next delivery can
    /// claim it again. A claim that already recorded a reference is kept.
    pub fn release_attempt_claim(&self, id: &str) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                "UPDATE contact_attempts
                 SET status = 'PENDING', provider = NULL, started_at = NULL
                 WHERE id = ?1 AND status = 'IN_PROGRESS' AND provider_ref IS NULL",
                params![id],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// Record the provider reference on an open attempt. False if the attempt
    /// already has one or has finished.
    pub fn mark_attempt_dispatched(
        &self,
        id: &str,
        provider: &str,
        provider_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                &format!(
                    "UPDATE contact_attempts
                     SET status = 'IN_PROGRESS', provider = ?2, provider_ref = ?3,
                         started_at = COALESCE(started_at, ?4)
                     WHERE id = ?1 AND status IN {OPEN_STATUSES} AND provider_ref IS NULL"
                ),
                params![id, provider, provider_ref, ts(&now)],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// Open attempt → FAILED with the error text in notes.
    pub fn mark_attempt_failed(
        &self,
        id: &str,
        provider: Option<&str>,
        notes: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                &format!(
                    "UPDATE contact_attempts
                     SET status = 'FAILED', notes = ?2, completed_at = ?3,
                         provider = COALESCE(?4, provider)
                     WHERE id = ?1 AND status IN {OPEN_STATUSES}"
                ),
                params![id, notes, ts(&now), provider],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn set_attempt_ab_variant(&self, id: &str, test_id: &str, variant: Variant) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE contact_attempts SET ab_test_id = ?2, ab_variant = ?3 WHERE id = ?1",
                params![id, test_id, variant.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Apply a provider callback to an open attempt. Returns false (no-op) when
    /// the attempt is already terminal.
    pub fn apply_attempt_event(&self, id: &str, event: &ProviderEvent, now: DateTime<Utc>) -> Result<bool> {
        let result = to_json(&event.result)?;
        let completed_at = event.status.is_terminal().then(|| ts(&now));
        let n = self
            .conn()?
            .execute(
                &format!(
                    "UPDATE contact_attempts
                     SET status = ?2,
                         duration_secs = COALESCE(?3, duration_secs),
                         cost = COALESCE(?4, cost),
                         result = COALESCE(?5, result),
                         notes = COALESCE(?6, notes),
                         completed_at = COALESCE(?7, completed_at)
                     WHERE id = ?1 AND status IN {OPEN_STATUSES}"
                ),
                params![
                    id,
                    event.status.as_str(),
                    event.duration_secs,
                    event.cost,
                    result,
                    event.notes,
                    completed_at,
                ],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// PENDING attempts created before `older_than`: queued but never picked up.
    pub fn stale_pending_attempts(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<ContactAttempt>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM contact_attempts
                 WHERE status = 'PENDING' AND created_at < ?1
                 ORDER BY created_at LIMIT ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![ts(&older_than), limit as i64], row_to_attempt)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Whether any attempt for the lead succeeded at or after `since`.
    pub fn has_success_since(&self, lead_id: &str, since: DateTime<Utc>) -> Result<bool> {
        let n: i64 = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM contact_attempts
                 WHERE lead_id = ?1 AND status = 'SUCCESS' AND created_at >= ?2",
                params![lead_id, ts(&since)],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// Most recent A/B assignment for a lead.
    pub fn latest_ab_assignment(&self, lead_id: &str) -> Result<Option<(String, Variant)>> {
        let row: Option<(String, String)> = self
            .conn()?
            .query_row(
                "SELECT ab_test_id, ab_variant FROM contact_attempts
                 WHERE lead_id = ?1 AND ab_test_id IS NOT NULL AND ab_variant IS NOT NULL
                 ORDER BY created_at DESC LIMIT 1",
                params![lead_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        Ok(row.and_then(|(test, v)| match v.as_str() {
            "A" => Some((test, Variant::A)),
            "B" => Some((test, Variant::B)),
            _ => None,
        }))
    }

    /// Retention cleanup: delete terminal attempts completed before `cutoff`.
    pub fn delete_terminal_attempts_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let n = self
            .conn()?
            .execute(
                "DELETE FROM contact_attempts
                 WHERE status IN ('SUCCESS', 'FAILED', 'NO_ANSWER', 'BOUNCED')
                   AND COALESCE(completed_at, created_at) < ?1",
                params![ts(&cutoff)],
            )
            .map_err(db_err)?;
        Ok(n)
    }

    /// Test/repair helper: force an attempt status without guards.
    pub fn force_attempt_status(&self, id: &str, status: AttemptStatus) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE contact_attempts SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::types::{AttemptResult, Channel, Lead};

    fn seeded() -> (Store, Lead) {
        let store = Store::open_in_memory().unwrap();
        let mut lead = Lead::new("Ivo");
        lead.phone = Some("+15550101".into());
        store.insert_lead(&lead).unwrap();
        (store, lead)
    }

    #[test]
    fn test_dispatch_then_terminal_guard() {
        let (store, lead) = seeded();
        let attempt = ContactAttempt::pending(&lead.id, Channel::Sms, None, Some("s1"));
        store.insert_attempt(&attempt).unwrap();

        let now = Utc::now();
        assert!(store.mark_attempt_dispatched(&attempt.id, "twilio", "SM123", now).unwrap());
        // Second dispatch is a no-op
        assert!(!store.mark_attempt_dispatched(&attempt.id, "twilio", "SM999", now).unwrap());

        let found = store.find_attempt_by_provider_ref("SM123").unwrap().unwrap();
        assert_eq!(found.status, AttemptStatus::InProgress);

        let delivered = ProviderEvent {
            provider_ref: "SM123".into(),
            status: AttemptStatus::Success,
            duration_secs: None,
            cost: Some(0.0079),
            result: Some(AttemptResult::Message { delivered: true, error_code: None }),
            notes: None,
        };
        assert!(store.apply_attempt_event(&attempt.id, &delivered, now).unwrap());

        // A stale IN_PROGRESS update cannot regress the terminal status
        let stale = ProviderEvent { status: AttemptStatus::InProgress, ..delivered.clone() };
        assert!(!store.apply_attempt_event(&attempt.id, &stale, now).unwrap());
        assert!(!store.mark_attempt_failed(&attempt.id, None, "late", now).unwrap());

        let loaded = store.get_attempt(&attempt.id).unwrap().unwrap();
        assert_eq!(loaded.status, AttemptStatus::Success);
        assert_eq!(loaded.cost, Some(0.0079));
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn test_claim_is_won_once() {
        let (store, lead) = seeded();
        let attempt = ContactAttempt::pending(&lead.id, Channel::Sms, None, Some("s1"));
        store.insert_attempt(&attempt).unwrap();

        let now = Utc::now();
        assert!(store.claim_attempt(&attempt.id, "twilio", now).unwrap());
        assert!(!store.claim_attempt(&attempt.id, "twilio", now).unwrap());

        // Released claims can be taken again
        assert!(store.release_attempt_claim(&attempt.id).unwrap());
        assert_eq!(store.get_attempt(&attempt.id).unwrap().unwrap().status, AttemptStatus::Pending);
        assert!(store.claim_attempt(&attempt.id, "twilio", now).unwrap());

        assert!(store.mark_attempt_dispatched(&attempt.id, "twilio", "SM1", now).unwrap());
        // A claim with a reference stays put
        assert!(!store.release_attempt_claim(&attempt.id).unwrap());
        let loaded = store.get_attempt(&attempt.id).unwrap().unwrap();
        assert_eq!(loaded.status, AttemptStatus::InProgress);
        assert_eq!(loaded.provider_ref.as_deref(), Some("SM1"));
    }

    #[test]
    fn test_stale_pending_query() {
        let (store, lead) = seeded();
        let mut old = ContactAttempt::pending(&lead.id, Channel::Sms, None, Some("s1"));
        old.created_at = Utc::now() - chrono::Duration::minutes(30);
        let fresh = ContactAttempt::pending(&lead.id, Channel::Sms, None, Some("s1"));
        store.insert_attempt(&old).unwrap();
        store.insert_attempt(&fresh).unwrap();

        let stale = store
            .stale_pending_attempts(Utc::now() - chrono::Duration::minutes(10), 10)
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
    }

    #[test]
    fn test_retention_cleanup_only_terminal() {
        let (store, lead) = seeded();
        let mut done = ContactAttempt::pending(&lead.id, Channel::Sms, None, None);
        done.status = AttemptStatus::Failed;
        done.created_at = Utc::now() - chrono::Duration::days(120);
        done.completed_at = Some(done.created_at);
        let mut open = ContactAttempt::pending(&lead.id, Channel::Sms, None, None);
        open.created_at = Utc::now() - chrono::Duration::days(120);
        store.insert_attempt(&done).unwrap();
        store.insert_attempt(&open).unwrap();

        let removed = store
            .delete_terminal_attempts_before(Utc::now() - chrono::Duration::days(90))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_attempt(&open.id).unwrap().is_some());
    }

    #[test]
    fn test_ab_assignment_lookup() {
        let (store, lead) = seeded();
        let attempt = ContactAttempt::pending(&lead.id, Channel::Sms, Some("c1"), Some("s1"));
        store.insert_attempt(&attempt).unwrap();
        assert!(store.latest_ab_assignment(&lead.id).unwrap().is_none());
        store.set_attempt_ab_variant(&attempt.id, "t1", Variant::B).unwrap();
        assert_eq!(
            store.latest_ab_assignment(&lead.id).unwrap(),
            Some(("t1".to_string(), Variant::B))
        );
    }
}
