//! Outbound webhook delivery.
//!
//! Used by webhook actions and webhook push targets. Every call carries an
//! explicit timeout and is attempted once.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Outcome of a delivered request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
}

/// Anything that can POST JSON to a URL
#[async_trait]
pub trait WebhookSender: Send + Sync {
    /// POST `body`; non-2xx responses are errors
    async fn post(&self, url: &str, body: &Value, timeout: Duration) -> Result<WebhookResponse>;
}

/// reqwest-backed sender
pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl Default for HttpWebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpWebhookSender {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn post(&self, url: &str, body: &Value, timeout: Duration) -> Result<WebhookResponse> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to POST to {}", url))?;

        let status = response.status();
        if status.is_success() {
            Ok(WebhookResponse {
                status: status.as_u16(),
            })
        } else {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Webhook error ({}): {}", status, text)
        }
    }
}

/// In-memory sender that records requests instead of sending them.
///
/// URLs listed in `failing` answer with an error.
#[derive(Default)]
pub struct RecordingWebhookSender {
    requests: Mutex<Vec<(String, Value)>>,
    failing: Vec<String>,
}

impl RecordingWebhookSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(urls: Vec<String>) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            failing: urls,
        }
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl WebhookSender for RecordingWebhookSender {
    async fn post(&self, url: &str, body: &Value, _timeout: Duration) -> Result<WebhookResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((url.to_string(), body.clone()));
        if self.failing.iter().any(|u| u == url) {
            anyhow::bail!("Webhook error (500 Internal Server Error): refused");
        }
        Ok(WebhookResponse { status: 200 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_recording_sender() {
        let sender = RecordingWebhookSender::failing(vec!["http://bad.local/hook".to_string()]);
        let ok = sender
            .post("http://good.local/hook", &json!({"a": 1}), Duration::from_secs(1))
            .await;
        assert_eq!(ok.unwrap().status, 200);
        assert!(sender
            .post("http://bad.local/hook", &json!({}), Duration::from_secs(1))
            .await
            .is_err());
        assert_eq!(sender.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_http_sender_reports_transport_failure() {
        let sender = HttpWebhookSender::new();
        // Port 9 (discard) on localhost is closed in test environments
        let result = sender
            .post("http://127.0.0.1:9/hook", &json!({}), Duration::from_millis(500))
            .await;
        assert!(result.is_err());
    }
}
