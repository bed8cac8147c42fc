//! Lead scoring batch: recompute `leads.score` from status and contact history.
//!
//! Each cron run scores one page of leads and moves a cursor forward; the
//! cursor wraps once a short page shows the end of the table was reached.

use chrono::{DateTime, Duration, Utc};
use outreach_core::error::Result;
use outreach_core::types::{Lead, LeadStatus};
use outreach_store::{LeadEngagement, Store};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_SCORE: i64 = 100;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringReport {
    pub scored: usize,
    pub changed: usize,
    /// The batch reached the last lead and the next run starts over.
    pub wrapped: bool,
}

pub struct LeadScorer {
    store: Arc<Store>,
    batch: usize,
    cursor: AtomicUsize,
}

impl LeadScorer {
    pub fn new(store: Arc<Store>, batch: usize) -> Self {
        Self {
            store,
            batch: batch.max(1),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn run_batch(&self, now: DateTime<Utc>) -> Result<ScoringReport> {
        let offset = self.cursor.load(Ordering::SeqCst);
        let leads = self.store.leads_page(self.batch, offset)?;
        let mut report = ScoringReport {
            scored: leads.len(),
            wrapped: leads.len() < self.batch,
            ..ScoringReport::default()
        };
        for lead in &leads {
            let engagement = self.store.lead_engagement(&lead.id)?;
            let score = score_lead(lead, &engagement, now);
            if score != lead.score {
                self.store.update_lead_score(&lead.id, score)?;
                report.changed += 1;
            }
        }
        let next = if report.wrapped { 0 } else { offset + leads.len() };
        self.cursor.store(next, Ordering::SeqCst);
        tracing::debug!("📈 Scored {} leads ({} changed)", report.scored, report.changed);
        Ok(report)
    }
}

/// Status sets the base; answered contacts raise it, failed ones lower it,
/// and a success in the last week adds a recency bonus. Clamped to 0..=100.
pub fn score_lead(lead: &Lead, engagement: &LeadEngagement, now: DateTime<Utc>) -> i64 {
    let base = match lead.status {
        LeadStatus::New => 10,
        LeadStatus::Contacted => 25,
        LeadStatus::Qualified => 50,
        LeadStatus::Converted => return MAX_SCORE,
        LeadStatus::Lost | LeadStatus::DoNotContact => return 0,
    };
    let answered = (engagement.successes * 10).min(30);
    let unanswered = (engagement.failures * 5).min(20);
    let recent = engagement
        .last_success_at
        .is_some_and(|at| now - at <= Duration::days(7));
    let score = base + answered - unanswered + if recent { 10 } else { 0 };
    score.clamp(0, MAX_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engagement(successes: i64, failures: i64, last: Option<DateTime<Utc>>) -> LeadEngagement {
        LeadEngagement {
            attempts: successes + failures,
            successes,
            failures,
            last_success_at: last,
        }
    }

    #[test]
    fn test_score_components() {
        let now = Utc::now();
        let mut lead = Lead::new("Ana");
        assert_eq!(score_lead(&lead, &LeadEngagement::default(), now), 10);
        assert_eq!(score_lead(&lead, &engagement(5, 0, Some(now)), now), 50);
        assert_eq!(score_lead(&lead, &engagement(1, 0, Some(now - Duration::days(30))), now), 20);
        assert_eq!(score_lead(&lead, &engagement(0, 9, None), now), 0);

        lead.status = LeadStatus::Qualified;
        assert_eq!(score_lead(&lead, &engagement(9, 0, Some(now)), now), 90);
        lead.status = LeadStatus::Converted;
        assert_eq!(score_lead(&lead, &LeadEngagement::default(), now), 100);
    }

    #[test]
    fn test_batch_cursor_wraps() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for name in ["a", "b", "c"] {
            store.insert_lead(&Lead::new(name)).unwrap();
        }
        let scorer = LeadScorer::new(store.clone(), 2);
        let now = Utc::now();

        let first = scorer.run_batch(now).unwrap();
        assert_eq!((first.scored, first.changed, first.wrapped), (2, 2, false));
        let second = scorer.run_batch(now).unwrap();
        assert_eq!((second.scored, second.wrapped), (1, true));
        // Back at the start; nothing changed since the last pass.
        let third = scorer.run_batch(now).unwrap();
        assert_eq!((third.scored, third.changed), (2, 0));
    }
}
