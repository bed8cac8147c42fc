//! Operational tables: scheduled contacts, learned conversion rules,
//! engagement rollups for scoring, and the dead-letter log.

use chrono::{DateTime, Utc};
use outreach_core::error::Result;
use outreach_core::types::{Channel, ScheduledContact, ScheduledContactStatus};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::{Store, col_enum, db_err, parse_opt_ts, parse_ts, ts};

/// Raw (channel, lead source) outcome counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionTally {
    pub channel: Channel,
    pub source: String,
    pub leads: i64,
    pub conversions: i64,
}

/// A learned conversion rate for (channel, lead source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRule {
    pub channel: Channel,
    pub source: String,
    pub leads: i64,
    pub conversions: i64,
    pub rate: f64,
    pub updated_at: DateTime<Utc>,
}

/// Engagement rollup for one lead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadEngagement {
    pub attempts: i64,
    pub successes: i64,
    pub failures: i64,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// A background task failure kept for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: i64,
    pub task: String,
    pub error: String,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

const SCHEDULED_COLUMNS: &str =
    "id, lead_id, campaign_id, channel, script_id, scheduled_at, status, attempt_id, error";

fn row_to_scheduled(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledContact> {
    Ok(ScheduledContact {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        campaign_id: row.get(2)?,
        channel: col_enum(row, 3)?,
        script_id: row.get(4)?,
        scheduled_at: parse_ts(&row.get::<_, String>(5)?)?,
        status: col_enum(row, 6)?,
        attempt_id: row.get(7)?,
        error: row.get(8)?,
    })
}

impl Store {
    // ─── Scheduled contacts ───────────────────────────────────

    pub fn insert_scheduled_contact(&self, contact: &ScheduledContact) -> Result<()> {
        self.conn()?
            .execute(
                &format!("INSERT INTO scheduled_contacts ({SCHEDULED_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    contact.id,
                    contact.lead_id,
                    contact.campaign_id,
                    contact.channel.as_str(),
                    contact.script_id,
                    ts(&contact.scheduled_at),
                    contact.status.as_str(),
                    contact.attempt_id,
                    contact.error,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_scheduled_contact(&self, id: &str) -> Result<Option<ScheduledContact>> {
        self.conn()?
            .query_row(
                &format!("SELECT {SCHEDULED_COLUMNS} FROM scheduled_contacts WHERE id = ?1"),
                params![id],
                row_to_scheduled,
            )
            .optional()
            .map_err(db_err)
    }

    /// PENDING contacts due at or before `now`, oldest first.
    pub fn due_scheduled_contacts(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledContact>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCHEDULED_COLUMNS} FROM scheduled_contacts
                 WHERE status = 'PENDING' AND scheduled_at <= ?1
                 ORDER BY scheduled_at LIMIT ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![ts(&now), limit as i64], row_to_scheduled)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// PENDING → DONE/FAILED. False if another run already finished it.
    pub fn finish_scheduled_contact(
        &self,
        id: &str,
        status: ScheduledContactStatus,
        attempt_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                "UPDATE scheduled_contacts SET status = ?2, attempt_id = ?3, error = ?4
                 WHERE id = ?1 AND status = 'PENDING'",
                params![id, status.as_str(), attempt_id, error],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    // ─── Conversion rules ─────────────────────────────────────

    /// Distinct leads contacted and converted, per (channel, lead source).
    pub fn conversion_tallies(&self) -> Result<Vec<ConversionTally>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT a.channel, COALESCE(l.source, 'unknown'),
                        COUNT(DISTINCT a.lead_id),
                        COUNT(DISTINCT CASE WHEN l.status = 'CONVERTED' THEN a.lead_id END)
                 FROM contact_attempts a JOIN leads l ON l.id = a.lead_id
                 GROUP BY a.channel, COALESCE(l.source, 'unknown')
                 ORDER BY a.channel, 2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ConversionTally {
                    channel: col_enum(row, 0)?,
                    source: row.get(1)?,
                    leads: row.get(2)?,
                    conversions: row.get(3)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Replace the whole rule table in one transaction.
    pub fn replace_conversion_rules(&self, rules: &[ConversionRule]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM conversion_rules", []).map_err(db_err)?;
        for rule in rules {
            tx.execute(
                "INSERT INTO conversion_rules (channel, source, leads, conversions, rate, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    rule.channel.as_str(),
                    rule.source,
                    rule.leads,
                    rule.conversions,
                    rule.rate,
                    ts(&rule.updated_at),
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn conversion_rules(&self) -> Result<Vec<ConversionRule>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT channel, source, leads, conversions, rate, updated_at
                 FROM conversion_rules ORDER BY rate DESC, channel, source",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ConversionRule {
                    channel: col_enum(row, 0)?,
                    source: row.get(1)?,
                    leads: row.get(2)?,
                    conversions: row.get(3)?,
                    rate: row.get(4)?,
                    updated_at: parse_ts(&row.get::<_, String>(5)?)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    // ─── Engagement ───────────────────────────────────────────

    pub fn lead_engagement(&self, lead_id: &str) -> Result<LeadEngagement> {
        self.conn()?
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN status = 'SUCCESS' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status IN ('FAILED', 'BOUNCED', 'NO_ANSWER') THEN 1 ELSE 0 END), 0),
                        MAX(CASE WHEN status = 'SUCCESS' THEN COALESCE(completed_at, created_at) END)
                 FROM contact_attempts WHERE lead_id = ?1",
                params![lead_id],
                |row| {
                    Ok(LeadEngagement {
                        attempts: row.get(0)?,
                        successes: row.get(1)?,
                        failures: row.get(2)?,
                        last_success_at: parse_opt_ts(row.get(3)?)?,
                    })
                },
            )
            .map_err(db_err)
    }

    // ─── Dead letters ─────────────────────────────────────────

    pub fn record_dead_letter(&self, task: &str, error: &str, context: Option<&str>) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO dead_letters (task, error, context, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![task, error, context, ts(&Utc::now())],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, task, error, context, created_at FROM dead_letters
                 ORDER BY id DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(DeadLetter {
                    id: row.get(0)?,
                    task: row.get(1)?,
                    error: row.get(2)?,
                    context: row.get(3)?,
                    created_at: parse_ts(&row.get::<_, String>(4)?)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
