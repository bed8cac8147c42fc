//! Composite EMAIL adapter: Postmark when active, otherwise Instantly.

use async_trait::async_trait;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::{ChannelAdapter, ConnectionCheck, OutboundMessage, SendContext, SendReceipt};
use outreach_core::types::{Channel, Lead};

use crate::instantly::InstantlyAdapter;
use crate::postmark::PostmarkAdapter;

pub struct EmailAdapter {
    postmark: Option<PostmarkAdapter>,
    instantly: Option<InstantlyAdapter>,
}

impl EmailAdapter {
    pub fn new(postmark: Option<PostmarkAdapter>, instantly: Option<InstantlyAdapter>) -> Self {
        Self { postmark, instantly }
    }

    /// Whether sends go through Postmark (and therefore use rendered templates).
    pub fn uses_postmark(&self) -> bool {
        self.postmark.is_some()
    }

    pub fn is_configured(&self) -> bool {
        self.postmark.is_some() || self.instantly.is_some()
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn provider(&self) -> &str {
        if self.postmark.is_some() {
            crate::postmark::PROVIDER
        } else {
            crate::instantly::PROVIDER
        }
    }

    async fn send(&self, lead: &Lead, message: &OutboundMessage, ctx: &SendContext) -> Result<SendReceipt> {
        if let Some(postmark) = &self.postmark {
            return postmark.send(lead, message, ctx).await;
        }
        if let Some(instantly) = &self.instantly {
            return instantly.send(lead, message, ctx).await;
        }
        Err(OutreachError::Config("no active email integration".into()))
    }

    async fn test_connection(&self) -> ConnectionCheck {
        match (&self.postmark, &self.instantly) {
            (Some(p), _) => p.test_connection().await,
            (None, Some(i)) => i.test_connection().await,
            (None, None) => ConnectionCheck::failed("no active email integration"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::config::{InstantlyConfig, PostmarkConfig};

    #[test]
    fn provider_prefers_postmark() {
        let instantly = InstantlyAdapter::new(InstantlyConfig::default());
        let only_bulk = EmailAdapter::new(None, Some(instantly));
        assert_eq!(only_bulk.provider(), "instantly");
        assert!(!only_bulk.uses_postmark());

        let both = EmailAdapter::new(
            Some(PostmarkAdapter::new(PostmarkConfig::default())),
            Some(InstantlyAdapter::new(InstantlyConfig::default())),
        );
        assert_eq!(both.provider(), "postmark");
    }

    #[tokio::test]
    async fn unconfigured_email_fails_with_config_error() {
        let adapter = EmailAdapter::new(None, None);
        let mut lead = Lead::new("E");
        lead.email = Some("e@example.com".into());
        let err = adapter
            .send(&lead, &OutboundMessage::text("x"), &SendContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OutreachError::Config(_)));
        assert!(!adapter.test_connection().await.ok);
    }
}
