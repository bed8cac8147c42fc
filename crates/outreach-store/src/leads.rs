//! Leads, campaigns, scripts, and email templates.
//!
//! CRUD for these lives outside the core; the store only needs inserts for
//! seeding and the reads the router and workers depend on.

use outreach_core::error::Result;
use outreach_core::types::{Campaign, Channel, EmailTemplate, Lead, LeadStatus, Script};
use rusqlite::{OptionalExtension, params};

use crate::{Store, col_enum, col_json, db_err, parse_ts, to_json, ts};

const LEAD_COLUMNS: &str =
    "id, first_name, last_name, email, phone, push_token, status, source, score, created_at";

fn row_to_lead(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        push_token: row.get(5)?,
        status: col_enum(row, 6)?,
        source: row.get(7)?,
        score: row.get(8)?,
        created_at: parse_ts(&row.get::<_, String>(9)?)?,
    })
}

const SCRIPT_COLUMNS: &str =
    "id, name, channel, subject, content, template_id, assistant_id, campaign_id, is_default";

fn row_to_script(row: &rusqlite::Row<'_>) -> rusqlite::Result<Script> {
    Ok(Script {
        id: row.get(0)?,
        name: row.get(1)?,
        channel: col_enum(row, 2)?,
        subject: row.get(3)?,
        content: row.get(4)?,
        template_id: row.get(5)?,
        assistant_id: row.get(6)?,
        campaign_id: row.get(7)?,
        is_default: row.get::<_, i64>(8)? != 0,
    })
}

impl Store {
    // ─── Leads ────────────────────────────────────────────────

    pub fn insert_lead(&self, lead: &Lead) -> Result<()> {
        self.conn()?
            .execute(
                &format!("INSERT INTO leads ({LEAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    lead.id,
                    lead.first_name,
                    lead.last_name,
                    lead.email,
                    lead.phone,
                    lead.push_token,
                    lead.status.as_str(),
                    lead.source,
                    lead.score,
                    ts(&lead.created_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_lead(&self, id: &str) -> Result<Option<Lead>> {
        self.conn()?
            .query_row(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id],
                row_to_lead,
            )
            .optional()
            .map_err(db_err)
    }

    /// Returns false when the lead does not exist.
    pub fn update_lead_status(&self, id: &str, status: LeadStatus) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                "UPDATE leads SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// Mark the lead CONVERTED. False when it is missing or already converted.
    pub fn mark_lead_converted(&self, id: &str) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                "UPDATE leads SET status = 'CONVERTED' WHERE id = ?1 AND status != 'CONVERTED'",
                params![id],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn update_lead_score(&self, id: &str, score: i64) -> Result<()> {
        self.conn()?
            .execute("UPDATE leads SET score = ?1 WHERE id = ?2", params![score, id])
            .map_err(db_err)?;
        Ok(())
    }

    /// Page through contactable leads, oldest first.
    pub fn leads_page(&self, limit: usize, offset: usize) -> Result<Vec<Lead>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {LEAD_COLUMNS} FROM leads WHERE status != 'DO_NOT_CONTACT'
                 ORDER BY created_at, id LIMIT ?1 OFFSET ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], row_to_lead)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    // ─── Campaigns ────────────────────────────────────────────

    pub fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        let meta = to_json(&campaign.meta)?;
        self.conn()?
            .execute(
                "INSERT INTO campaigns (id, name, meta, instantly_campaign_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    campaign.id,
                    campaign.name,
                    meta,
                    campaign.instantly_campaign_id,
                    ts(&campaign.created_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        self.conn()?
            .query_row(
                "SELECT id, name, meta, instantly_campaign_id, created_at FROM campaigns WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Campaign {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        meta: col_json(row, 2)?,
                        instantly_campaign_id: row.get(3)?,
                        created_at: parse_ts(&row.get::<_, String>(4)?)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    // ─── Scripts & templates ──────────────────────────────────

    /// Insert or replace a script by id.
    pub fn upsert_script(&self, script: &Script) -> Result<()> {
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO scripts ({SCRIPT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name, channel = excluded.channel,
                        subject = excluded.subject, content = excluded.content,
                        template_id = excluded.template_id, assistant_id = excluded.assistant_id,
                        campaign_id = excluded.campaign_id, is_default = excluded.is_default"
                ),
                params![
                    script.id,
                    script.name,
                    script.channel.as_str(),
                    script.subject,
                    script.content,
                    script.template_id,
                    script.assistant_id,
                    script.campaign_id,
                    script.is_default as i64,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_script(&self, id: &str) -> Result<Option<Script>> {
        self.conn()?
            .query_row(
                &format!("SELECT {SCRIPT_COLUMNS} FROM scripts WHERE id = ?1"),
                params![id],
                row_to_script,
            )
            .optional()
            .map_err(db_err)
    }

    /// Default script for a channel, preferring one bound to the campaign.
    pub fn default_script(&self, campaign_id: Option<&str>, channel: Channel) -> Result<Option<Script>> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT {SCRIPT_COLUMNS} FROM scripts
                     WHERE channel = ?1 AND is_default = 1
                       AND (campaign_id = ?2 OR campaign_id IS NULL)
                     ORDER BY campaign_id IS NULL, id
                     LIMIT 1"
                ),
                params![channel.as_str(), campaign_id],
                row_to_script,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn insert_template(&self, template: &EmailTemplate) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO email_templates (id, name, subject, html_body, text_body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    template.id,
                    template.name,
                    template.subject,
                    template.html_body,
                    template.text_body,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_template(&self, id: &str) -> Result<Option<EmailTemplate>> {
        self.conn()?
            .query_row(
                "SELECT id, name, subject, html_body, text_body FROM email_templates WHERE id = ?1",
                params![id],
                |row| {
                    Ok(EmailTemplate {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        subject: row.get(2)?,
                        html_body: row.get(3)?,
                        text_body: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lead_round_trip_and_status() {
        let store = Store::open_in_memory().unwrap();
        let mut lead = Lead::new("Maya");
        lead.email = Some("maya@example.com".into());
        lead.source = Some("landing".into());
        store.insert_lead(&lead).unwrap();

        let loaded = store.get_lead(&lead.id).unwrap().unwrap();
        assert_eq!(loaded.email.as_deref(), Some("maya@example.com"));
        assert_eq!(loaded.status, LeadStatus::New);

        assert!(store.update_lead_status(&lead.id, LeadStatus::DoNotContact).unwrap());
        assert!(!store.update_lead_status("missing", LeadStatus::Lost).unwrap());
        assert!(store.leads_page(10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_mark_lead_converted_only_once() {
        let store = Store::open_in_memory().unwrap();
        let lead = Lead::new("Noor");
        store.insert_lead(&lead).unwrap();

        assert!(store.mark_lead_converted(&lead.id).unwrap());
        assert!(!store.mark_lead_converted(&lead.id).unwrap());
        assert!(!store.mark_lead_converted("missing").unwrap());
        assert_eq!(store.get_lead(&lead.id).unwrap().unwrap().status, LeadStatus::Converted);
    }

    #[test]
    fn test_default_script_prefers_campaign() {
        let store = Store::open_in_memory().unwrap();
        let mut global = Script::new("global", Channel::Sms, "hi");
        global.is_default = true;
        let mut scoped = Script::new("scoped", Channel::Sms, "hello {{first_name}}");
        scoped.is_default = true;
        scoped.campaign_id = Some("c1".into());
        store.upsert_script(&global).unwrap();
        store.upsert_script(&scoped).unwrap();

        let picked = store.default_script(Some("c1"), Channel::Sms).unwrap().unwrap();
        assert_eq!(picked.id, scoped.id);
        let fallback = store.default_script(Some("other"), Channel::Sms).unwrap().unwrap();
        assert_eq!(fallback.id, global.id);
        assert!(store.default_script(None, Channel::Call).unwrap().is_none());
    }

    #[test]
    fn test_campaign_meta_json() {
        let store = Store::open_in_memory().unwrap();
        let mut campaign = Campaign::new("Winback");
        campaign.meta = Some(serde_json::json!({"offer": "20%"}));
        store.insert_campaign(&campaign).unwrap();
        let loaded = store.get_campaign(&campaign.id).unwrap().unwrap();
        assert_eq!(loaded.meta.unwrap()["offer"], "20%");
    }
}
