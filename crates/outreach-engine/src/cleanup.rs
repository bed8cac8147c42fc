//! Retention cleanup for finished contact attempts.

use chrono::{DateTime, Duration, Utc};
use outreach_core::error::Result;
use outreach_store::Store;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub deleted: usize,
    pub cutoff: DateTime<Utc>,
}

pub struct RetentionCleaner {
    store: Arc<Store>,
    retention: Duration,
}

impl RetentionCleaner {
    pub fn new(store: Arc<Store>, retention_days: i64) -> Self {
        Self {
            store,
            retention: Duration::days(retention_days.max(1)),
        }
    }

    /// Delete terminal attempts that finished before the retention window.
    /// Open attempts are kept regardless of age.
    pub fn run(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let cutoff = now - self.retention;
        let deleted = self.store.delete_terminal_attempts_before(cutoff)?;
        if deleted > 0 {
            tracing::info!("🗑️ Deleted {deleted} contact attempts older than {cutoff}");
        }
        Ok(CleanupReport { deleted, cutoff })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::types::{AttemptStatus, Channel, ContactAttempt, Lead};

    #[test]
    fn test_only_old_terminal_attempts_are_deleted() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let lead = Lead::new("Ana");
        store.insert_lead(&lead).unwrap();
        let now = Utc::now();

        let mut old_done = ContactAttempt::pending(&lead.id, Channel::Sms, None, None);
        old_done.created_at = now - Duration::days(120);
        old_done.status = AttemptStatus::Success;
        let mut old_open = ContactAttempt::pending(&lead.id, Channel::Sms, None, None);
        old_open.created_at = now - Duration::days(120);
        let mut fresh_done = ContactAttempt::pending(&lead.id, Channel::Sms, None, None);
        fresh_done.status = AttemptStatus::Failed;
        for a in [&old_done, &old_open, &fresh_done] {
            store.insert_attempt(a).unwrap();
        }

        let report = RetentionCleaner::new(store.clone(), 90).run(now).unwrap();
        assert_eq!(report.deleted, 1);
        assert!(store.get_attempt(&old_done.id).unwrap().is_none());
        assert!(store.get_attempt(&old_open.id).unwrap().is_some());
        assert!(store.get_attempt(&fresh_done.id).unwrap().is_some());
    }
}
