//! SMS channel via a Twilio-compatible Messages API.

use async_trait::async_trait;
use outreach_core::config::SmsConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::{ChannelAdapter, ConnectionCheck, OutboundMessage, SendContext, SendReceipt};
use outreach_core::types::{Channel, Lead};

use crate::http;

const PROVIDER: &str = "twilio";

pub struct SmsAdapter {
    config: SmsConfig,
    client: reqwest::Client,
}

impl SmsAdapter {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            config,
            client: http::client(),
        }
    }

    pub fn from_config(config: Option<&SmsConfig>) -> Option<Self> {
        config
            .filter(|c| c.enabled && !c.account_sid.is_empty() && !c.auth_token.is_empty())
            .map(|c| Self::new(c.clone()))
    }

    fn account_url(&self, suffix: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_sid,
            suffix
        )
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, lead: &Lead, message: &OutboundMessage, ctx: &SendContext) -> Result<SendReceipt> {
        let to = lead
            .phone
            .as_deref()
            .ok_or_else(|| OutreachError::Precondition(format!("lead {} has no phone", lead.id)))?;
        if self.config.from_number.is_empty() {
            return Err(OutreachError::Config("SMS from_number not configured".into()));
        }
        if message.body.trim().is_empty() {
            return Err(OutreachError::Precondition("SMS body is empty".into()));
        }

        let response = self
            .client
            .post(self.account_url("/Messages.json"))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[
                ("To", to),
                ("From", self.config.from_number.as_str()),
                ("Body", message.body.as_str()),
            ])
            .send()
            .await
            .map_err(|e| http::request_error(PROVIDER, e))?;
        let result = http::json_body(PROVIDER, response).await?;
        let sid = http::required_id(PROVIDER, &result, "/sid")?;

        tracing::debug!(
            "💬 SMS sent: {} → {} (attempt={})",
            sid,
            to,
            ctx.attempt_id.as_deref().unwrap_or("-")
        );
        Ok(SendReceipt {
            provider: PROVIDER.into(),
            provider_ref: sid,
        })
    }

    async fn test_connection(&self) -> ConnectionCheck {
        let response = self
            .client
            .get(self.account_url(".json"))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => ConnectionCheck::ok(),
            Ok(r) => ConnectionCheck::failed(format!("SMS gateway returned {}", r.status())),
            Err(e) => ConnectionCheck::failed(format!("SMS gateway unreachable: {e}")),
        }
    }
}
