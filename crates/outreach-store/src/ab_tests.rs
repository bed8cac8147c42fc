//! A/B test rows. Stats are updated inside an immediate transaction so
//! concurrent increments never overwrite one another.

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, Result};
use outreach_core::types::{AbTest, AbTestStatus, Channel, Variant, VariantStats};
use rusqlite::{OptionalExtension, TransactionBehavior, params};

use crate::{Store, col_enum, db_err, parse_opt_ts, parse_ts, ts};

const AB_COLUMNS: &str = "id, campaign_id, channel, variant_a, variant_b, status, stats_a, stats_b, \
    winner_id, started_at, ended_at";

fn stats_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<VariantStats> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_ab_test(row: &rusqlite::Row<'_>) -> rusqlite::Result<AbTest> {
    Ok(AbTest {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        channel: col_enum(row, 2)?,
        variant_a: row.get(3)?,
        variant_b: row.get(4)?,
        status: col_enum(row, 5)?,
        stats_a: stats_col(row, 6)?,
        stats_b: stats_col(row, 7)?,
        winner_id: row.get(8)?,
        started_at: parse_ts(&row.get::<_, String>(9)?)?,
        ended_at: parse_opt_ts(row.get(10)?)?,
    })
}

impl Store {
    pub fn insert_ab_test(&self, test: &AbTest) -> Result<()> {
        self.conn()?
            .execute(
                &format!("INSERT INTO ab_tests ({AB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    test.id,
                    test.campaign_id,
                    test.channel.as_str(),
                    test.variant_a,
                    test.variant_b,
                    test.status.as_str(),
                    serde_json::to_string(&test.stats_a)?,
                    serde_json::to_string(&test.stats_b)?,
                    test.winner_id,
                    ts(&test.started_at),
                    test.ended_at.as_ref().map(ts),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_ab_test(&self, id: &str) -> Result<Option<AbTest>> {
        self.conn()?
            .query_row(
                &format!("SELECT {AB_COLUMNS} FROM ab_tests WHERE id = ?1"),
                params![id],
                row_to_ab_test,
            )
            .optional()
            .map_err(db_err)
    }

    /// Most recently started RUNNING test for (campaign, channel).
    pub fn running_ab_test(&self, campaign_id: &str, channel: Channel) -> Result<Option<AbTest>> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT {AB_COLUMNS} FROM ab_tests
                     WHERE campaign_id = ?1 AND channel = ?2 AND status = 'RUNNING'
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![campaign_id, channel.as_str()],
                row_to_ab_test,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn running_ab_tests(&self) -> Result<Vec<AbTest>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {AB_COLUMNS} FROM ab_tests WHERE status = 'RUNNING' ORDER BY started_at"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_ab_test).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Increment `sent` (and `converted` when `converted`) for one variant.
    /// Returns the updated test; completed tests are left untouched.
    pub fn record_ab_outcome(
        &self,
        test_id: &str,
        variant: Variant,
        sent: bool,
        converted: bool,
    ) -> Result<AbTest> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let mut test = tx
            .query_row(
                &format!("SELECT {AB_COLUMNS} FROM ab_tests WHERE id = ?1"),
                params![test_id],
                row_to_ab_test,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| OutreachError::NotFound(format!("ab test {test_id}")))?;

        if test.status == AbTestStatus::Running {
            let stats = match variant {
                Variant::A => &mut test.stats_a,
                Variant::B => &mut test.stats_b,
            };
            if sent {
                stats.sent += 1;
            }
            if converted {
                stats.converted += 1;
            }
            tx.execute(
                "UPDATE ab_tests SET stats_a = ?2, stats_b = ?3 WHERE id = ?1",
                params![
                    test_id,
                    serde_json::to_string(&test.stats_a)?,
                    serde_json::to_string(&test.stats_b)?,
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(test)
    }

    /// RUNNING → COMPLETED with a winner. False if the test already ended.
    pub fn complete_ab_test(&self, id: &str, winner_id: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        let n = self
            .conn()?
            .execute(
                "UPDATE ab_tests SET status = 'COMPLETED', winner_id = ?2, ended_at = ?3
                 WHERE id = ?1 AND status = 'RUNNING'",
                params![id, winner_id, ts(&now)],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_accumulate_per_variant() {
        let store = Store::open_in_memory().unwrap();
        let test = AbTest::new("c1", Channel::Email, "s-a", "s-b");
        store.insert_ab_test(&test).unwrap();

        store.record_ab_outcome(&test.id, Variant::A, true, false).unwrap();
        store.record_ab_outcome(&test.id, Variant::A, true, false).unwrap();
        store.record_ab_outcome(&test.id, Variant::A, false, true).unwrap();
        let updated = store.record_ab_outcome(&test.id, Variant::B, true, false).unwrap();

        assert_eq!(updated.stats_a, VariantStats { sent: 2, converted: 1 });
        assert_eq!(updated.stats_b, VariantStats { sent: 1, converted: 0 });
        let running = store.running_ab_test("c1", Channel::Email).unwrap().unwrap();
        assert_eq!(running.id, test.id);
    }

    #[test]
    fn test_complete_once_and_freeze_stats() {
        let store = Store::open_in_memory().unwrap();
        let test = AbTest::new("c1", Channel::Sms, "s-a", "s-b");
        store.insert_ab_test(&test).unwrap();

        assert!(store.complete_ab_test(&test.id, Some("s-a"), Utc::now()).unwrap());
        assert!(!store.complete_ab_test(&test.id, Some("s-b"), Utc::now()).unwrap());

        let after = store.record_ab_outcome(&test.id, Variant::B, true, true).unwrap();
        assert_eq!(after.stats_b, VariantStats::default());
        assert_eq!(after.winner_id.as_deref(), Some("s-a"));
        assert!(store.running_ab_test("c1", Channel::Sms).unwrap().is_none());
    }

    #[test]
    fn test_unknown_test_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.record_ab_outcome("nope", Variant::A, true, false).unwrap_err();
        assert!(matches!(err, OutreachError::NotFound(_)));
    }
}
