//! Postmark transactional email.

use async_trait::async_trait;
use outreach_core::config::PostmarkConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::{ChannelAdapter, ConnectionCheck, OutboundMessage, SendContext, SendReceipt};
use outreach_core::types::{Channel, Lead};

use crate::http;

pub(crate) const PROVIDER: &str = "postmark";

pub struct PostmarkAdapter {
    config: PostmarkConfig,
    client: reqwest::Client,
}

impl PostmarkAdapter {
    pub fn new(config: PostmarkConfig) -> Self {
        Self {
            config,
            client: http::client(),
        }
    }

    pub fn from_config(config: Option<&PostmarkConfig>) -> Option<Self> {
        config
            .filter(|c| c.enabled && !c.server_token.is_empty())
            .map(|c| Self::new(c.clone()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ChannelAdapter for PostmarkAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, lead: &Lead, message: &OutboundMessage, ctx: &SendContext) -> Result<SendReceipt> {
        let to = lead
            .email
            .as_deref()
            .ok_or_else(|| OutreachError::Precondition(format!("lead {} has no email", lead.id)))?;
        if self.config.from_email.is_empty() {
            return Err(OutreachError::Config("Postmark from_email not configured".into()));
        }

        let body = serde_json::json!({
            "From": self.config.from_email,
            "To": to,
            "Subject": message.subject.clone().unwrap_or_default(),
            "TextBody": message.body,
            "HtmlBody": message.html_body,
            "MessageStream": self.config.message_stream,
            "Metadata": {
                "attemptId": ctx.attempt_id,
                "campaignId": ctx.campaign_id,
            },
        });

        let response = self
            .client
            .post(self.url("/email"))
            .header("X-Postmark-Server-Token", &self.config.server_token)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| http::request_error(PROVIDER, e))?;
        let result = http::json_body(PROVIDER, response).await?;
        let message_id = http::required_id(PROVIDER, &result, "/MessageID")?;

        tracing::debug!("📧 Postmark email sent: {} → {}", message_id, to);
        Ok(SendReceipt {
            provider: PROVIDER.into(),
            provider_ref: message_id,
        })
    }

    async fn test_connection(&self) -> ConnectionCheck {
        let response = self
            .client
            .get(self.url("/server"))
            .header("X-Postmark-Server-Token", &self.config.server_token)
            .header("Accept", "application/json")
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => ConnectionCheck::ok(),
            Ok(r) => ConnectionCheck::failed(format!("Postmark returned {}", r.status())),
            Err(e) => ConnectionCheck::failed(format!("Postmark unreachable: {e}")),
        }
    }
}
