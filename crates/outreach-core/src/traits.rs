//! Channel adapter trait: the uniform "attempt send" contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Channel, Lead};

/// Rendered content handed to an adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub subject: Option<String>,
    pub body: String,
    /// HTML alternative for email.
    pub html_body: Option<String>,
    pub script_id: Option<String>,
    /// VAPI assistant id for calls.
    pub assistant_id: Option<String>,
}

impl OutboundMessage {
    pub fn text(body: &str) -> Self {
        Self {
            body: body.to_string(),
            ..Self::default()
        }
    }
}

/// Per-send context: which attempt and campaign this send belongs to.
#[derive(Debug, Clone, Default)]
pub struct SendContext {
    pub attempt_id: Option<String>,
    pub campaign_id: Option<String>,
    /// Campaign id on the bulk email provider.
    pub instantly_campaign_id: Option<String>,
    pub campaign_meta: Option<serde_json::Value>,
}

/// Successful dispatch: the provider's id for the message or call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider: String,
    pub provider_ref: String,
}

/// Result of `test_connection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionCheck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionCheck {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// One implementation per channel. Adapters perform the external call only;
/// attempt bookkeeping belongs to the caller.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Provider name recorded on the attempt (e.g. "vapi", "postmark").
    fn provider(&self) -> &str;

    async fn send(
        &self,
        lead: &Lead,
        message: &OutboundMessage,
        ctx: &SendContext,
    ) -> Result<SendReceipt>;

    async fn test_connection(&self) -> ConnectionCheck;
}
