//! Call-log sync: pull recent voice calls and apply them as provider events.
//!
//! Webhooks can be lost; the call log is the backstop. Applying an event is
//! idempotent, so overlapping windows are harmless.

use chrono::{DateTime, Duration, Utc};
use outreach_channels::CallLog;
use outreach_core::error::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::events::ProviderEvents;

/// Window used on the first sync after start-up.
const INITIAL_LOOKBACK_MINUTES: i64 = 60;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSyncReport {
    pub enabled: bool,
    pub fetched: usize,
    pub matched: usize,
    pub applied: usize,
}

pub struct CallLogSync {
    events: Arc<ProviderEvents>,
    log: Option<Arc<dyn CallLog>>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl CallLogSync {
    pub fn new(events: Arc<ProviderEvents>, log: Option<Arc<dyn CallLog>>) -> Self {
        Self {
            events,
            log,
            last_sync: Mutex::new(None),
        }
    }

    pub async fn sync(&self, now: DateTime<Utc>) -> Result<CallSyncReport> {
        let Some(log) = &self.log else {
            return Ok(CallSyncReport::default());
        };
        let since = self
            .last_sync()
            .unwrap_or(now - Duration::minutes(INITIAL_LOOKBACK_MINUTES));
        let calls = log.recent_calls(since).await?;

        let mut report = CallSyncReport {
            enabled: true,
            fetched: calls.len(),
            ..CallSyncReport::default()
        };
        for call in &calls {
            let outcome = self.events.apply_at(&call.to_event(), now).await?;
            report.matched += usize::from(outcome.matched);
            report.applied += usize::from(outcome.applied);
        }
        if let Ok(mut last) = self.last_sync.lock() {
            *last = Some(now);
        }
        if report.applied > 0 {
            tracing::info!("📞 Call sync: {} of {} calls applied", report.applied, report.fetched);
        }
        Ok(report)
    }

    fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync.lock().ok().and_then(|last| *last)
    }
}
