//! VAPI voice channel (CALL).
//!
//! Outbound calls go through `POST /call`; the returned call id is the
//! attempt's providerRef. Recent calls can be listed for the call-log sync.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_core::config::VapiConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::{ChannelAdapter, ConnectionCheck, OutboundMessage, SendContext, SendReceipt};
use outreach_core::types::{AttemptResult, AttemptStatus, Channel, Lead, ProviderEvent};
use serde::Deserialize;

use crate::http;

const PROVIDER: &str = "vapi";

/// One call as reported by the provider's call log.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ended_reason: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub recording_url: Option<String>,
}

impl CallRecord {
    /// Normalize into a provider event. Calls still ringing or live map to IN_PROGRESS.
    pub fn to_event(&self) -> ProviderEvent {
        let status = match self.status.as_str() {
            "ended" => match self.ended_reason.as_deref().unwrap_or_default() {
                "customer-did-not-answer" | "customer-busy" | "voicemail" | "no-answer" => {
                    AttemptStatus::NoAnswer
                }
                reason if reason.contains("error") || reason.contains("failed") => AttemptStatus::Failed,
                _ => AttemptStatus::Success,
            },
            _ => AttemptStatus::InProgress,
        };
        let duration_secs = match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) if end >= start => Some((end - start).num_seconds()),
            _ => None,
        };
        let result = (status != AttemptStatus::InProgress).then(|| AttemptResult::Call {
            transcript: self.transcript.clone(),
            summary: self.summary.clone(),
            keywords: Vec::new(),
            recording_url: self.recording_url.clone(),
            outcome: self.ended_reason.clone(),
        });
        ProviderEvent {
            provider_ref: self.id.clone(),
            status,
            duration_secs,
            cost: self.cost,
            result,
            notes: None,
        }
    }
}

/// Source of recent call records.
#[async_trait]
pub trait CallLog: Send + Sync {
    async fn recent_calls(&self, since: DateTime<Utc>) -> Result<Vec<CallRecord>>;
}

pub struct VapiAdapter {
    config: VapiConfig,
    client: reqwest::Client,
}

impl VapiAdapter {
    pub fn new(config: VapiConfig) -> Self {
        Self {
            config,
            client: http::client(),
        }
    }

    /// Build from config when the integration is active.
    pub fn from_config(config: Option<&VapiConfig>) -> Option<Self> {
        config
            .filter(|c| c.enabled && !c.api_key.is_empty())
            .map(|c| Self::new(c.clone()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ChannelAdapter for VapiAdapter {
    fn channel(&self) -> Channel {
        Channel::Call
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, lead: &Lead, message: &OutboundMessage, ctx: &SendContext) -> Result<SendReceipt> {
        let phone = lead
            .phone
            .as_deref()
            .ok_or_else(|| OutreachError::Precondition(format!("lead {} has no phone", lead.id)))?;
        let assistant_id = message
            .assistant_id
            .clone()
            .or_else(|| self.config.default_assistant_id.clone())
            .ok_or_else(|| OutreachError::Config("VAPI assistant id not configured".into()))?;
        if self.config.phone_number_id.is_empty() {
            return Err(OutreachError::Config("VAPI phone_number_id not configured".into()));
        }

        let body = serde_json::json!({
            "assistantId": assistant_id,
            "phoneNumberId": self.config.phone_number_id,
            "customer": {
                "number": phone,
                "name": lead.full_name(),
            },
            "assistantOverrides": {
                "firstMessage": (!message.body.is_empty()).then(|| message.body.clone()),
            },
            "metadata": {
                "attemptId": ctx.attempt_id,
                "campaignId": ctx.campaign_id,
                "leadId": lead.id,
            },
        });

        let response = self
            .client
            .post(self.url("/call"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::request_error(PROVIDER, e))?;
        let result = http::json_body(PROVIDER, response).await?;
        let call_id = http::required_id(PROVIDER, &result, "/id")?;

        tracing::debug!("📞 VAPI call queued: {} → {}", call_id, phone);
        Ok(SendReceipt {
            provider: PROVIDER.into(),
            provider_ref: call_id,
        })
    }

    async fn test_connection(&self) -> ConnectionCheck {
        let response = self
            .client
            .get(self.url("/assistant"))
            .query(&[("limit", "1")])
            .bearer_auth(&self.config.api_key)
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => ConnectionCheck::ok(),
            Ok(r) => ConnectionCheck::failed(format!("VAPI returned {}", r.status())),
            Err(e) => ConnectionCheck::failed(format!("VAPI unreachable: {e}")),
        }
    }
}

#[async_trait]
impl CallLog for VapiAdapter {
    async fn recent_calls(&self, since: DateTime<Utc>) -> Result<Vec<CallRecord>> {
        let response = self
            .client
            .get(self.url("/call"))
            .query(&[("createdAtGt", since.to_rfc3339()), ("limit", "100".to_string())])
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| http::request_error(PROVIDER, e))?;
        let body = http::json_body(PROVIDER, response).await?;
        let calls: Vec<CallRecord> = serde_json::from_value(body)?;
        Ok(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(base_url: &str) -> VapiAdapter {
        VapiAdapter::new(VapiConfig {
            api_key: "vapi-key".into(),
            base_url: base_url.into(),
            phone_number_id: "pn-1".into(),
            default_assistant_id: Some("asst-1".into()),
            enabled: true,
        })
    }

    fn lead() -> Lead {
        let mut lead = Lead::new("Caller");
        lead.phone = Some("+15550101".into());
        lead
    }

    #[tokio::test]
    async fn send_returns_call_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/call"))
            .and(header("authorization", "Bearer vapi-key"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "call-9"})))
            .mount(&server)
            .await;

        let receipt = adapter(&server.uri())
            .send(&lead(), &OutboundMessage::text("Hello"), &SendContext::default())
            .await
            .unwrap();
        assert_eq!(receipt.provider_ref, "call-9");
        assert_eq!(receipt.provider, "vapi");
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/call"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = adapter(&server.uri())
            .send(&lead(), &OutboundMessage::text("Hello"), &SendContext::default())
            .await
            .unwrap_err();
        assert!(err.is_transient(), "got: {err}");
    }

    #[tokio::test]
    async fn bad_request_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/call"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid number"))
            .mount(&server)
            .await;

        let err = adapter(&server.uri())
            .send(&lead(), &OutboundMessage::text("Hello"), &SendContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OutreachError::Provider(_)));
        assert!(err.to_string().contains("invalid number"));
    }

    #[test]
    fn call_record_maps_to_event() {
        let record: CallRecord = serde_json::from_value(serde_json::json!({
            "id": "call-1",
            "status": "ended",
            "endedReason": "customer-did-not-answer",
            "cost": 0.12,
            "startedAt": "2026-01-01T10:00:00Z",
            "endedAt": "2026-01-01T10:00:42Z"
        }))
        .unwrap();
        let event = record.to_event();
        assert_eq!(event.status, AttemptStatus::NoAnswer);
        assert_eq!(event.duration_secs, Some(42));

        let live: CallRecord =
            serde_json::from_value(serde_json::json!({"id": "call-2", "status": "in-progress"})).unwrap();
        assert_eq!(live.to_event().status, AttemptStatus::InProgress);
        assert!(live.to_event().result.is_none());
    }

    #[test]
    fn inactive_config_builds_nothing() {
        let mut cfg = VapiConfig::default();
        assert!(VapiAdapter::from_config(Some(&cfg)).is_none());
        cfg.api_key = "k".into();
        cfg.enabled = false;
        assert!(VapiAdapter::from_config(Some(&cfg)).is_none());
        assert!(VapiAdapter::from_config(None).is_none());
    }
}
