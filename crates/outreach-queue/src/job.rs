//! Queue envelope around a `ChannelJob`.

use chrono::{DateTime, Utc};
use outreach_core::types::ChannelJob;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: String,
    pub payload: ChannelJob,
    /// Deliveries already made (0 before the first run).
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(payload: ChannelJob, retry: &RetryPolicy) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            attempts_made: 0,
            max_attempts: retry.max_attempts,
            backoff_base_ms: retry.backoff_base.as_millis() as u64,
            enqueued_at: Utc::now(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base_ms)
    }
}
