//! A/B evaluation: variant selection, outcome counting, and a two-proportion
//! z-test that can end a test once the sample is large enough.

use chrono::{DateTime, Utc};
use outreach_core::config::AbTestingConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::types::{AbTest, AbTestStatus, Variant, VariantStats};
use outreach_store::Store;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;

/// Result of a significance check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbEvaluation {
    pub test_id: String,
    pub status: AbTestStatus,
    pub rate_a: f64,
    pub rate_b: f64,
    pub sample: u64,
    pub z_score: f64,
    /// Two-sided confidence that the rates differ, in `[0, 1)`.
    pub confidence: f64,
    pub significant: bool,
    /// Leading variant, set only when the difference is significant.
    pub winner: Option<Variant>,
    pub winner_script_id: Option<String>,
}

pub struct AbEvaluator {
    store: Arc<Store>,
    config: AbTestingConfig,
}

impl AbEvaluator {
    pub fn new(store: Arc<Store>, config: AbTestingConfig) -> Self {
        Self { store, config }
    }

    /// 50/50 pick. Returns the variant and its script id; recording the send is
    /// the caller's job.
    pub fn select_variant(&self, test_id: &str) -> Result<(Variant, String)> {
        let test = self.load(test_id)?;
        let variant = if rand::thread_rng().gen_bool(0.5) { Variant::A } else { Variant::B };
        Ok((variant, test.script_for(variant).to_string()))
    }

    /// One more send for `variant`, counted as converted when `converted`.
    pub fn record_outcome(&self, test_id: &str, variant: Variant, converted: bool) -> Result<AbTest> {
        self.store.record_ab_outcome(test_id, variant, true, converted)
    }

    /// A later conversion credited to a send that was already counted.
    pub fn record_conversion(&self, test_id: &str, variant: Variant) -> Result<AbTest> {
        self.store.record_ab_outcome(test_id, variant, false, true)
    }

    pub fn evaluate_test(&self, test_id: &str) -> Result<AbEvaluation> {
        let test = self.load(test_id)?;
        Ok(self.evaluate(&test))
    }

    /// Complete the test when the combined sample has reached the minimum and
    /// the difference clears the confidence bar. Completed tests stay completed.
    pub fn auto_end_test(&self, test_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let test = self.load(test_id)?;
        if test.status == AbTestStatus::Completed {
            return Ok(false);
        }
        let eval = self.evaluate(&test);
        if eval.sample < self.config.min_sample {
            tracing::debug!(
                "🧪 A/B {}: sample {} below minimum {}",
                test.id,
                eval.sample,
                self.config.min_sample
            );
            return Ok(false);
        }
        if !eval.significant {
            return Ok(false);
        }
        let ended = self
            .store
            .complete_ab_test(&test.id, eval.winner_script_id.as_deref(), now)?;
        if ended {
            tracing::info!(
                "🏆 A/B {} ended: variant {} wins at {:.1}% confidence",
                test.id,
                eval.winner.map(|v| v.as_str()).unwrap_or("-"),
                eval.confidence * 100.0
            );
        }
        Ok(ended)
    }

    /// Auto-end every running test; returns the ids that completed.
    pub fn auto_end_running(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut ended = Vec::new();
        for test in self.store.running_ab_tests()? {
            if self.auto_end_test(&test.id, now)? {
                ended.push(test.id);
            }
        }
        Ok(ended)
    }

    fn load(&self, test_id: &str) -> Result<AbTest> {
        self.store
            .get_ab_test(test_id)?
            .ok_or_else(|| OutreachError::NotFound(format!("ab test {test_id}")))
    }

    fn evaluate(&self, test: &AbTest) -> AbEvaluation {
        let z = z_score(&test.stats_a, &test.stats_b);
        let confidence = two_sided_confidence(z);
        let significant = confidence >= self.config.confidence;
        let winner = significant.then(|| if z > 0.0 { Variant::B } else { Variant::A });
        AbEvaluation {
            test_id: test.id.clone(),
            status: test.status,
            rate_a: test.stats_a.rate(),
            rate_b: test.stats_b.rate(),
            sample: test.stats_a.sent + test.stats_b.sent,
            z_score: z,
            confidence,
            significant,
            winner,
            winner_script_id: winner.map(|v| test.script_for(v).to_string()),
        }
    }
}

/// Pooled two-proportion z statistic, positive when B converts better.
pub fn z_score(a: &VariantStats, b: &VariantStats) -> f64 {
    if a.sent == 0 || b.sent == 0 {
        return 0.0;
    }
    let (na, nb) = (a.sent as f64, b.sent as f64);
    let pooled = (a.converted + b.converted) as f64 / (na + nb);
    let se = (pooled * (1.0 - pooled) * (1.0 / na + 1.0 / nb)).sqrt();
    if se == 0.0 || !se.is_finite() {
        return 0.0;
    }
    (b.rate() - a.rate()) / se
}

/// `P(|Z| < |z|)` for a standard normal.
pub fn two_sided_confidence(z: f64) -> f64 {
    erf(z.abs() / std::f64::consts::SQRT_2)
}

/// Abramowitz-Stegun 7.1.26, max error 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}
