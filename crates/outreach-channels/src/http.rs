//! Shared HTTP plumbing: client construction and provider fault mapping.
//!
//! Timeouts, connection failures and 5xx map to `Transient` (the queue retries
//! those); any other non-success status maps to `Provider`.

use outreach_core::error::{OutreachError, Result};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client with the adapter-wide request timeout.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("⚠️ HTTP client builder failed ({e}), using defaults");
            reqwest::Client::new()
        })
}

/// Map a transport-level failure.
pub fn request_error(provider: &str, e: reqwest::Error) -> OutreachError {
    if e.is_timeout() || e.is_connect() {
        OutreachError::Transient(format!("{provider} request failed: {e}"))
    } else {
        OutreachError::Provider(format!("{provider} request failed: {e}"))
    }
}

/// Turn a provider response into its JSON body, classifying failures by status.
pub async fn json_body(provider: &str, response: reqwest::Response) -> Result<serde_json::Value> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let msg = format!("{provider} API error {status}: {text}");
        return Err(if status.is_server_error() || status.as_u16() == 429 {
            OutreachError::Transient(msg)
        } else {
            OutreachError::Provider(msg)
        });
    }
    response
        .json()
        .await
        .map_err(|e| OutreachError::Provider(format!("Invalid {provider} response: {e}")))
}

/// Pull a required string id out of a provider response.
pub fn required_id(provider: &str, body: &serde_json::Value, pointer: &str) -> Result<String> {
    body.pointer(pointer)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| OutreachError::Provider(format!("{provider} response has no {pointer}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_id() {
        let body = serde_json::json!({"messages": [{"id": "wamid.1"}], "empty": ""});
        assert_eq!(required_id("x", &body, "/messages/0/id").unwrap(), "wamid.1");
        assert!(required_id("x", &body, "/empty").is_err());
        assert!(required_id("x", &body, "/missing").is_err());
    }
}
