//! Periodic scheduler entrypoint.
//!
//! One run holds the `cron-main` lock and executes every maintenance step in
//! turn. Steps are isolated: an error or panic in one is written into the
//! report and the next step still runs. The lock guard is dropped on every
//! exit path, including a panic that escapes the runner.

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use outreach_core::config::CronConfig;
use outreach_core::error::{OutreachError, Result};
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::abtest::AbEvaluator;
use crate::background::panic_message;
use crate::callsync::CallLogSync;
use crate::cleanup::RetentionCleaner;
use crate::lock::{LockInfo, LockService};
use crate::router::ChannelRouter;
use crate::rules::RuleLearner;
use crate::scheduled::ScheduledContacts;
use crate::scoring::LeadScorer;
use crate::sequence::SequenceProcessor;

pub const CRON_LOCK: &str = "cron-main";

/// Result of one step: its report, a skip reason, or the error text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StepOutcome {
    Done(serde_json::Value),
    Skipped { skipped: String },
    Failed { error: String },
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronReport {
    pub ok: bool,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub scheduled_contacts: StepOutcome,
    pub sequences: StepOutcome,
    pub contact_queue: StepOutcome,
    pub lead_scoring: StepOutcome,
    pub vapi_sync: StepOutcome,
    pub conversion_rules: StepOutcome,
    pub ab_tests: StepOutcome,
    pub attempt_cleanup: StepOutcome,
}

impl CronReport {
    pub fn failed_steps(&self) -> usize {
        [
            &self.scheduled_contacts,
            &self.sequences,
            &self.contact_queue,
            &self.lead_scoring,
            &self.vapi_sync,
            &self.conversion_rules,
            &self.ab_tests,
            &self.attempt_cleanup,
        ]
        .into_iter()
        .filter(|s| s.is_failed())
        .count()
    }
}

/// The services one run drives.
pub struct CronSteps {
    pub scheduled: Arc<ScheduledContacts>,
    pub sequences: Arc<SequenceProcessor>,
    pub router: Arc<ChannelRouter>,
    pub scorer: Arc<LeadScorer>,
    pub call_sync: Arc<CallLogSync>,
    pub rules: Arc<RuleLearner>,
    pub ab: Arc<AbEvaluator>,
    pub cleaner: Arc<RetentionCleaner>,
}

/// Lets a step through at most once per interval. Only a run that did not
/// fail uses up the slot.
struct IntervalGate {
    every: Duration,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl IntervalGate {
    fn new(every: Duration) -> Self {
        Self {
            every,
            last: Mutex::new(None),
        }
    }

    fn last(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        // A panic while holding the guard cannot leave the timestamp half-written.
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ok when a run may start at `now`, otherwise when the next slot opens.
    fn due(&self, now: DateTime<Utc>) -> std::result::Result<(), DateTime<Utc>> {
        match *self.last() {
            Some(at) if now - at < self.every => Err(at + self.every),
            _ => Ok(()),
        }
    }

    fn mark(&self, now: DateTime<Utc>) {
        *self.last() = Some(now);
    }

    async fn run<T, F>(&self, name: &str, now: DateTime<Utc>, fut: F) -> StepOutcome
    where
        T: Serialize,
        F: Future<Output = Result<T>>,
    {
        if let Err(next) = self.due(now) {
            return skipped(next);
        }
        let outcome = isolate(name, fut).await;
        if !outcome.is_failed() {
            self.mark(now);
        }
        outcome
    }
}

pub struct CronRunner {
    lock: Arc<LockService>,
    max_hold: std::time::Duration,
    steps: CronSteps,
    relearn_gate: IntervalGate,
    cleanup_gate: IntervalGate,
}

impl CronRunner {
    pub fn new(lock: Arc<LockService>, steps: CronSteps, config: &CronConfig) -> Self {
        let hourly = Duration::seconds(i64::try_from(config.relearn_interval_secs).unwrap_or(i64::MAX));
        Self {
            lock,
            max_hold: std::time::Duration::from_millis(config.lock_max_hold_ms),
            steps,
            relearn_gate: IntervalGate::new(hourly),
            cleanup_gate: IntervalGate::new(hourly),
        }
    }

    pub fn lock_info(&self) -> LockInfo {
        self.lock.info(CRON_LOCK)
    }

    pub async fn run(&self) -> Result<CronReport> {
        self.run_at(Utc::now()).await
    }

    /// Run every step once. Returns `LockHeld` without doing any work when
    /// another run is in progress.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<CronReport> {
        let Some(_guard) = self.lock.guard(CRON_LOCK, self.max_hold) else {
            tracing::info!("⏳ Cron run skipped, '{CRON_LOCK}' is held");
            return Err(OutreachError::LockHeld(CRON_LOCK.into()));
        };
        let started = tokio::time::Instant::now();
        tracing::info!("⏰ Cron run started");

        let s = &self.steps;
        let scheduled_contacts = isolate("scheduledContacts", s.scheduled.process_due(now)).await;
        let sequences = isolate("sequences", s.sequences.run_all_at(now)).await;
        let contact_queue = isolate("contactQueue", s.router.process_queue(now)).await;
        let lead_scoring = isolate("leadScoring", async { s.scorer.run_batch(now) }).await;
        let vapi_sync = isolate("vapiSync", s.call_sync.sync(now)).await;
        let conversion_rules = self
            .relearn_gate
            .run("conversionRules", now, async { s.rules.relearn(now) })
            .await;
        let ab_tests = isolate("abTests", async { s.ab.auto_end_running(now) }).await;
        let attempt_cleanup = self
            .cleanup_gate
            .run("attemptCleanup", now, async { s.cleaner.run(now) })
            .await;

        let report = CronReport {
            ok: true,
            timestamp: now,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            scheduled_contacts,
            sequences,
            contact_queue,
            lead_scoring,
            vapi_sync,
            conversion_rules,
            ab_tests,
            attempt_cleanup,
        };
        let failed = report.failed_steps();
        if failed > 0 {
            tracing::warn!("⏰ Cron run finished in {}ms with {failed} failed steps", report.duration_ms);
        } else {
            tracing::info!("⏰ Cron run finished in {}ms", report.duration_ms);
        }
        Ok(report)
    }
}

async fn isolate<T, F>(name: &str, fut: F) -> StepOutcome
where
    T: Serialize,
    F: Future<Output = Result<T>>,
{
    let error = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => match serde_json::to_value(value) {
            Ok(value) => return StepOutcome::Done(value),
            Err(e) => e.to_string(),
        },
        Ok(Err(e)) => e.to_string(),
        Err(panic) => format!("panicked: {}", panic_message(&*panic)),
    };
    tracing::error!("❌ Cron step {name} failed: {error}");
    StepOutcome::Failed { error }
}

fn skipped(next: DateTime<Utc>) -> StepOutcome {
    StepOutcome::Skipped {
        skipped: format!("interval not elapsed, next run after {}", next.to_rfc3339()),
    }
}
