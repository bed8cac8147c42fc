//! Conversion-rule relearning: per (channel, lead source) conversion rates.

use chrono::{DateTime, Utc};
use outreach_core::error::Result;
use outreach_store::{ConversionRule, Store};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelearnReport {
    pub rules: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best: Option<ConversionRule>,
}

pub struct RuleLearner {
    store: Arc<Store>,
}

impl RuleLearner {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Rebuild the rule table from current attempt and lead data.
    pub fn relearn(&self, now: DateTime<Utc>) -> Result<RelearnReport> {
        let rules: Vec<ConversionRule> = self
            .store
            .conversion_tallies()?
            .into_iter()
            .filter(|t| t.leads > 0)
            .map(|t| ConversionRule {
                rate: t.conversions as f64 / t.leads as f64,
                channel: t.channel,
                source: t.source,
                leads: t.leads,
                conversions: t.conversions,
                updated_at: now,
            })
            .collect();
        self.store.replace_conversion_rules(&rules)?;

        let best = rules
            .iter()
            .max_by(|a, b| a.rate.total_cmp(&b.rate))
            .cloned();
        if let Some(rule) = &best {
            tracing::info!(
                "🧠 Relearned {} conversion rules, best {}/{} at {:.1}%",
                rules.len(),
                rule.channel,
                rule.source,
                rule.rate * 100.0
            );
        }
        Ok(RelearnReport {
            rules: rules.len(),
            best,
        })
    }
}
