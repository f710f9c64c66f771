//! Client for the external receipt recognition (OCR) service.
//!
//! The service is called once per upload:
//!
//! ```text
//! POST {endpoint}/process-receipt      multipart field "file"
//! 200 {"success": true, "merchant": "...", "total": 18.42,
//!      "raw_text": "...", "confidence": 91.0}
//! ```
//!
//! # Failure mapping
//!
//! | Outcome | Error |
//! |---------|-------|
//! | connect error, timeout, non-2xx status, undecodable or incomplete body | [`RecognitionError::Unavailable`] |
//! | `success: false` | [`RecognitionError::Rejected`] |
//!
//! Attempts are governed by a [`RetryPolicy`]. The service wires in
//! [`RetryPolicy::none`], so a failure is surfaced after a single call.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::artifact::ArtifactHandle;
use crate::config::RecognitionConfig;
use crate::error::IngestError;
use crate::models::{decimal_from_f64, RecognitionResult};

/// Path appended to the configured endpoint.
pub const PROCESS_RECEIPT_PATH: &str = "/process-receipt";

#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("recognition service unavailable: {0}")]
    Unavailable(String),
    #[error("recognition service rejected the image")]
    Rejected,
}

impl From<RecognitionError> for IngestError {
    fn from(err: RecognitionError) -> Self {
        match err {
            RecognitionError::Unavailable(reason) => IngestError::RecognitionUnavailable(reason),
            RecognitionError::Rejected => IngestError::RecognitionRejected,
        }
    }
}

/// How many times a recognition call may be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// A single attempt; failures go straight back to the caller.
    pub const fn none() -> Self {
        Self { max_attempts: 1 }
    }

    /// Whether another attempt follows a failed `attempt` (1-based).
    ///
    /// Rejections are final regardless of the budget.
    pub fn should_retry(&self, attempt: u32, err: &RecognitionError) -> bool {
        matches!(err, RecognitionError::Unavailable(_)) && attempt < self.max_attempts
    }

    /// Delay before attempt `attempt + 1`: 500ms, 1s, 2s, ... capped at 16s.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(500u64 << attempt.saturating_sub(1).min(5))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Extracts structured receipt data from a stored image.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, artifact: &ArtifactHandle)
        -> Result<RecognitionResult, RecognitionError>;
}

/// Wire shape of the recognition response.
#[derive(Debug, Deserialize)]
struct ProcessReceiptResponse {
    success: bool,
    #[serde(default)]
    merchant: Option<String>,
    #[serde(default)]
    total: Option<f64>,
    #[serde(default)]
    raw_text: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// [`Recognizer`] backed by the HTTP recognition service.
pub struct HttpRecognizer {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    policy: RetryPolicy,
}

impl HttpRecognizer {
    pub fn new(config: &RecognitionConfig) -> anyhow::Result<Self> {
        Self::with_policy(config, RetryPolicy::none())
    }

    pub fn with_policy(config: &RecognitionConfig, policy: RetryPolicy) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let url = format!(
            "{}{}",
            config.endpoint.trim_end_matches('/'),
            PROCESS_RECEIPT_PATH
        );

        Ok(Self {
            client,
            url,
            timeout,
            policy,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn attempt(
        &self,
        artifact: &ArtifactHandle,
        bytes: Vec<u8>,
    ) -> Result<RecognitionResult, RecognitionError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(artifact.original_name().to_string())
            .mime_str(artifact.media_type())
            .map_err(|e| RecognitionError::Unavailable(format!("invalid media type: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RecognitionError::Unavailable(format!(
                        "request timed out after {}s",
                        self.timeout.as_secs()
                    ))
                } else {
                    RecognitionError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(RecognitionError::Unavailable(format!(
                "status {}: {}",
                status,
                truncate(&body_text, 200)
            )));
        }

        let body: ProcessReceiptResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                RecognitionError::Unavailable(format!(
                    "request timed out after {}s",
                    self.timeout.as_secs()
                ))
            } else {
                RecognitionError::Unavailable(format!("invalid response body: {}", e))
            }
        })?;

        parse_response(body)
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    async fn recognize(
        &self,
        artifact: &ArtifactHandle,
    ) -> Result<RecognitionResult, RecognitionError> {
        let bytes = artifact
            .read()
            .await
            .map_err(|e| RecognitionError::Unavailable(format!("{:#}", e)))?;

        let mut attempt = 1;
        loop {
            match self.attempt(artifact, bytes.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) if self.policy.should_retry(attempt, &err) => {
                    tracing::warn!(attempt, error = %err, "recognition attempt failed, retrying");
                    tokio::time::sleep(self.policy.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Converts the wire response into a complete result or an error.
fn parse_response(body: ProcessReceiptResponse) -> Result<RecognitionResult, RecognitionError> {
    if !body.success {
        return Err(RecognitionError::Rejected);
    }

    let incomplete = |field: &str| {
        RecognitionError::Unavailable(format!("incomplete response: missing {}", field))
    };

    let merchant = body.merchant.ok_or_else(|| incomplete("merchant"))?;
    let total = body.total.ok_or_else(|| incomplete("total"))?;
    let raw_text = body.raw_text.ok_or_else(|| incomplete("raw_text"))?;
    let confidence = body.confidence.ok_or_else(|| incomplete("confidence"))?;

    let total = decimal_from_f64(total)
        .ok_or_else(|| RecognitionError::Unavailable(format!("invalid total: {}", total)))?;
    if !confidence.is_finite() {
        return Err(RecognitionError::Unavailable(format!(
            "invalid confidence: {}",
            confidence
        )));
    }

    Ok(RecognitionResult {
        merchant,
        total,
        raw_text,
        confidence: confidence.clamp(0.0, 100.0),
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::from_cents;

    fn response(json: serde_json::Value) -> ProcessReceiptResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_parse_success() {
        let result = parse_response(response(serde_json::json!({
            "success": true,
            "merchant": "Joe's Diner",
            "total": 18.42,
            "raw_text": "JOE'S DINER\nTOTAL 18.42",
            "confidence": 91
        })))
        .unwrap();
        assert_eq!(result.merchant, "Joe's Diner");
        assert_eq!(result.total, from_cents(1842));
        assert_eq!(result.confidence, 91.0);
    }

    #[test]
    fn test_parse_rejected() {
        let err = parse_response(response(serde_json::json!({ "success": false }))).unwrap_err();
        assert!(matches!(err, RecognitionError::Rejected));
    }

    #[test]
    fn test_parse_incomplete_is_unavailable() {
        let err = parse_response(response(serde_json::json!({
            "success": true,
            "merchant": "Acme",
            "raw_text": "",
            "confidence": 50
        })))
        .unwrap_err();
        match err {
            RecognitionError::Unavailable(reason) => assert!(reason.contains("total")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_confidence_clamped() {
        let result = parse_response(response(serde_json::json!({
            "success": true,
            "merchant": "Acme",
            "total": 1.0,
            "raw_text": "",
            "confidence": 140.0
        })))
        .unwrap();
        assert_eq!(result.confidence, 100.0);
    }

    #[test]
    fn test_default_policy_is_single_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.should_retry(1, &RecognitionError::Unavailable("down".into())));
    }

    #[test]
    fn test_rejection_never_retried() {
        let policy = RetryPolicy { max_attempts: 3 };
        assert!(policy.should_retry(1, &RecognitionError::Unavailable("down".into())));
        assert!(!policy.should_retry(3, &RecognitionError::Unavailable("down".into())));
        assert!(!policy.should_retry(1, &RecognitionError::Rejected));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy { max_attempts: 10 };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(9), Duration::from_millis(16000));
    }

    #[test]
    fn test_url_joins_endpoint() {
        let config = RecognitionConfig {
            endpoint: "http://ocr:8001/".to_string(),
            timeout_secs: 30,
        };
        let client = HttpRecognizer::new(&config).unwrap();
        assert_eq!(client.url(), "http://ocr:8001/process-receipt");
        assert_eq!(client.policy(), RetryPolicy::none());
    }
}
