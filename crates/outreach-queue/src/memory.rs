//! In-process queue backend with an availability switch.
//!
//! Used by tests and single-binary dry runs; flipping `set_available(false)`
//! makes every operation fail the way an unreachable Redis would.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::backend::{QueueBackend, QueueCounts};
use crate::job::QueuedJob;

#[derive(Default)]
struct Queues {
    waiting: HashMap<String, VecDeque<QueuedJob>>,
    delayed: HashMap<String, Vec<(DateTime<Utc>, QueuedJob)>>,
}

pub struct MemoryBackend {
    queues: Mutex<Queues>,
    available: AtomicBool,
    pings: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            available: AtomicBool::new(true),
            pings: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of connectivity probes received.
    pub fn ping_count(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    /// Snapshot of waiting jobs in `queue`, oldest first.
    pub fn waiting(&self, queue: &str) -> Vec<QueuedJob> {
        self.queues
            .lock()
            .map(|q| q.waiting.get(queue).map(|d| d.iter().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OutreachError::Queue("memory backend unavailable".into()))
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Queues>> {
        self.queues
            .lock()
            .map_err(|e| OutreachError::Queue(format!("Lock: {e}")))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    async fn push(&self, queue: &str, job: &QueuedJob) -> Result<()> {
        self.check()?;
        self.lock()?
            .waiting
            .entry(queue.to_string())
            .or_default()
            .push_back(job.clone());
        Ok(())
    }

    async fn push_delayed(&self, queue: &str, job: &QueuedJob, run_at: DateTime<Utc>) -> Result<()> {
        self.check()?;
        self.lock()?
            .delayed
            .entry(queue.to_string())
            .or_default()
            .push((run_at, job.clone()));
        Ok(())
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<usize> {
        self.check()?;
        let mut queues = self.lock()?;
        let due: Vec<QueuedJob> = match queues.delayed.get_mut(queue) {
            Some(parked) => {
                parked.sort_by_key(|(at, _)| *at);
                let split = parked.partition_point(|(at, _)| *at <= now);
                parked.drain(..split).map(|(_, job)| job).collect()
            }
            None => Vec::new(),
        };
        let promoted = due.len();
        if promoted > 0 {
            queues.waiting.entry(queue.to_string()).or_default().extend(due);
        }
        Ok(promoted)
    }

    async fn pop(&self, queue: &str) -> Result<Option<QueuedJob>> {
        self.check()?;
        Ok(self.lock()?.waiting.get_mut(queue).and_then(|q| q.pop_front()))
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        self.check()?;
        let queues = self.lock()?;
        Ok(QueueCounts {
            waiting: queues.waiting.get(queue).map_or(0, |q| q.len() as u64),
            delayed: queues.delayed.get(queue).map_or(0, |q| q.len() as u64),
        })
    }

    async fn close(&self) {}
}
