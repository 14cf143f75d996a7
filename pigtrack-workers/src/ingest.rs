use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Stored delivery errors are capped at this length.
pub const MAX_ERROR_LEN: usize = 1000;

/// Response bodies quoted in error messages are capped at this length.
const MAX_BODY_LEN: usize = 300;

/// A failed delivery attempt. Both kinds are transient from the outbox's
/// point of view; the distinction exists for the operator reading
/// `last_error`.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport: {0}")]
    Transport(String),
}

/// Outbound seam to the ingest endpoint. Production posts over HTTP; tests
/// script the outcomes.
#[async_trait]
pub trait IngestClient: Send + Sync {
    /// Deliver one payload. The dedup key travels as the `Idempotency-Key`
    /// header so the recipient can collapse re-deliveries.
    async fn post(&self, dedup_key: &str, payload: &serde_json::Value) -> Result<(), SendError>;
}

/// reqwest-backed client for the ingest endpoint.
pub struct HttpIngestClient {
    client: reqwest::Client,
    url: String,
}

impl HttpIngestClient {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl IngestClient for HttpIngestClient {
    async fn post(&self, dedup_key: &str, payload: &serde_json::Value) -> Result<(), SendError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("Idempotency-Key", dedup_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SendError::Status {
            status: status.as_u16(),
            body: truncate(&body, MAX_BODY_LEN),
        })
    }
}

/// Truncate on a char boundary; delivery errors must fit the store column.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_caps_long_strings() {
        let long = "x".repeat(2000);
        assert_eq!(truncate(&long, MAX_ERROR_LEN).len(), MAX_ERROR_LEN);
        assert_eq!(truncate("short", MAX_ERROR_LEN), "short");
    }

    #[test]
    fn send_error_messages_are_operator_friendly() {
        let e = SendError::Status {
            status: 503,
            body: "service unavailable".to_string(),
        };
        assert_eq!(e.to_string(), "HTTP 503: service unavailable");
        let e = SendError::Transport("connection refused".to_string());
        assert_eq!(e.to_string(), "transport: connection refused");
    }
}
