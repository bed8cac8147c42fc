//! PwaFlow web push (PUSH).

use async_trait::async_trait;
use outreach_core::config::PwaFlowConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::{ChannelAdapter, ConnectionCheck, OutboundMessage, SendContext, SendReceipt};
use outreach_core::types::{Channel, Lead};

use crate::http;

const PROVIDER: &str = "pwaflow";

pub struct PushAdapter {
    config: PwaFlowConfig,
    client: reqwest::Client,
}

impl PushAdapter {
    pub fn new(config: PwaFlowConfig) -> Self {
        Self {
            config,
            client: http::client(),
        }
    }

    pub fn from_config(config: Option<&PwaFlowConfig>) -> Option<Self> {
        config
            .filter(|c| c.enabled && !c.api_key.is_empty() && !c.app_id.is_empty())
            .map(|c| Self::new(c.clone()))
    }

    fn app_url(&self, suffix: &str) -> String {
        format!(
            "{}/v1/apps/{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.app_id,
            suffix
        )
    }
}

#[async_trait]
impl ChannelAdapter for PushAdapter {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, lead: &Lead, message: &OutboundMessage, ctx: &SendContext) -> Result<SendReceipt> {
        let token = lead
            .push_token
            .as_deref()
            .ok_or_else(|| OutreachError::Precondition(format!("lead {} has no push token", lead.id)))?;

        let body = serde_json::json!({
            "token": token,
            "title": message.subject.clone().unwrap_or_default(),
            "body": message.body,
            "data": {
                "attemptId": ctx.attempt_id,
                "campaignId": ctx.campaign_id,
            },
        });

        let response = self
            .client
            .post(self.app_url("/notifications"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::request_error(PROVIDER, e))?;
        let result = http::json_body(PROVIDER, response).await?;
        let notification_id = http::required_id(PROVIDER, &result, "/id")?;

        tracing::debug!("🔔 Push sent: {} → lead {}", notification_id, lead.id);
        Ok(SendReceipt {
            provider: PROVIDER.into(),
            provider_ref: notification_id,
        })
    }

    async fn test_connection(&self) -> ConnectionCheck {
        let response = self
            .client
            .get(self.app_url(""))
            .bearer_auth(&self.config.api_key)
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => ConnectionCheck::ok(),
            Ok(r) => ConnectionCheck::failed(format!("PwaFlow returned {}", r.status())),
            Err(e) => ConnectionCheck::failed(format!("PwaFlow unreachable: {e}")),
        }
    }
}
