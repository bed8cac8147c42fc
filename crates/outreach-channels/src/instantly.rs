//! Instantly bulk email: a send adds the lead to the mapped Instantly campaign.

use async_trait::async_trait;
use outreach_core::config::InstantlyConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::{ChannelAdapter, ConnectionCheck, OutboundMessage, SendContext, SendReceipt};
use outreach_core::types::{Channel, Lead};

use crate::http;

pub(crate) const PROVIDER: &str = "instantly";

pub struct InstantlyAdapter {
    config: InstantlyConfig,
    client: reqwest::Client,
}

impl InstantlyAdapter {
    pub fn new(config: InstantlyConfig) -> Self {
        Self {
            config,
            client: http::client(),
        }
    }

    pub fn from_config(config: Option<&InstantlyConfig>) -> Option<Self> {
        config
            .filter(|c| c.enabled && !c.api_key.is_empty())
            .map(|c| Self::new(c.clone()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ChannelAdapter for InstantlyAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, lead: &Lead, message: &OutboundMessage, ctx: &SendContext) -> Result<SendReceipt> {
        let email = lead
            .email
            .as_deref()
            .ok_or_else(|| OutreachError::Precondition(format!("lead {} has no email", lead.id)))?;
        let campaign = ctx.instantly_campaign_id.as_deref().ok_or_else(|| {
            OutreachError::Config(format!(
                "campaign {} has no Instantly campaign id",
                ctx.campaign_id.as_deref().unwrap_or("-")
            ))
        })?;

        let body = serde_json::json!({
            "campaign": campaign,
            "email": email,
            "first_name": lead.first_name,
            "last_name": lead.last_name,
            "custom_variables": {
                "attemptId": ctx.attempt_id,
                "subject": message.subject,
                "body": message.body,
            },
        });

        let response = self
            .client
            .post(self.url("/api/v2/leads"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::request_error(PROVIDER, e))?;
        let result = http::json_body(PROVIDER, response).await?;
        let lead_ref = http::required_id(PROVIDER, &result, "/id")?;

        tracing::debug!("📨 Instantly lead added: {} → campaign {}", lead_ref, campaign);
        Ok(SendReceipt {
            provider: PROVIDER.into(),
            provider_ref: lead_ref,
        })
    }

    async fn test_connection(&self) -> ConnectionCheck {
        let response = self
            .client
            .get(self.url("/api/v2/campaigns"))
            .query(&[("limit", "1")])
            .bearer_auth(&self.config.api_key)
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => ConnectionCheck::ok(),
            Ok(r) => ConnectionCheck::failed(format!("Instantly returned {}", r.status())),
            Err(e) => ConnectionCheck::failed(format!("Instantly unreachable: {e}")),
        }
    }
}
