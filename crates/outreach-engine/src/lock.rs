//! Named in-process locks with a maximum hold time.
//!
//! Single-process only: the table lives in this process's memory and does not
//! coordinate across server instances. Its job is to serialize the periodic
//! sweep when triggers overlap.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Default maximum hold, after which a lock counts as abandoned.
pub const DEFAULT_MAX_HOLD: Duration = Duration::from_millis(300_000);

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    token: u64,
    acquired: Instant,
    acquired_at: DateTime<Utc>,
    max_hold: Duration,
}

impl LockEntry {
    fn expired(&self) -> bool {
        self.acquired.elapsed() >= self.max_hold
    }
}

/// Snapshot returned by [`LockService::info`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub held: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct LockService {
    entries: Mutex<HashMap<String, LockEntry>>,
    next_token: AtomicU64,
}

impl LockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `name` unless a live holder has it. An entry older than its own
    /// `max_hold` is replaced.
    pub fn acquire(&self, name: &str, max_hold: Duration) -> bool {
        self.acquire_token(name, max_hold).is_some()
    }

    pub fn release(&self, name: &str) {
        if self.entries().remove(name).is_some() {
            tracing::debug!("🔓 Lock '{name}' released");
        }
    }

    /// Whether `name` is held. Expired entries are removed here.
    pub fn info(&self, name: &str) -> LockInfo {
        let mut entries = self.entries();
        match entries.get(name).copied() {
            Some(entry) if entry.expired() => {
                entries.remove(name);
                LockInfo { held: false, acquired_at: None }
            }
            Some(entry) => LockInfo {
                held: true,
                acquired_at: Some(entry.acquired_at),
            },
            None => LockInfo { held: false, acquired_at: None },
        }
    }

    /// Acquire and hand back a guard that releases on drop, including when
    /// the holding future panics or is cancelled.
    pub fn guard(self: &Arc<Self>, name: &str, max_hold: Duration) -> Option<LockGuard> {
        let token = self.acquire_token(name, max_hold)?;
        Some(LockGuard {
            service: Arc::clone(self),
            name: name.to_string(),
            token,
        })
    }

    /// The table. Every write is a single insert or remove, so a holder that
    /// panicked cannot leave it inconsistent and the poison flag is ignored.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire_token(&self, name: &str, max_hold: Duration) -> Option<u64> {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(name) {
            if !existing.expired() {
                return None;
            }
            tracing::warn!(
                "⚠️ Lock '{name}' held since {} exceeded {}ms, taking over",
                existing.acquired_at.to_rfc3339(),
                existing.max_hold.as_millis()
            );
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            name.to_string(),
            LockEntry {
                token,
                acquired: Instant::now(),
                acquired_at: Utc::now(),
                max_hold,
            },
        );
        tracing::debug!("🔒 Lock '{name}' acquired");
        Some(token)
    }

    /// Release only if the entry is still ours; a holder that outlived its
    /// hold must not release its successor.
    fn release_token(&self, name: &str, token: u64) {
        let mut entries = self.entries();
        if entries.get(name).is_some_and(|e| e.token == token) {
            entries.remove(name);
            tracing::debug!("🔓 Lock '{name}' released");
        }
    }
}

/// Held lock; released when dropped.
pub struct LockGuard {
    service: Arc<LockService>,
    name: String,
    token: u64,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.service.release_token(&self.name, self.token);
    }
}
