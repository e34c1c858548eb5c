//! Advisory extraction client: asks a hosted language model for structured
//! opportunity fields in a debrief transcript.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "nexus-advisory";

pub const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
const API_VERSION: &str = "2023-06-01";

/// Fields the model may return. Anything it omits stays empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryExtract {
    pub budget_status: Option<String>,
    pub decision_maker: Option<String>,
    /// RFC 3339 instant, when the model saw a concrete time.
    pub next_meeting: Option<String>,
    pub sentiment: Option<String>,
    pub key_insights: Vec<String>,
    pub action_items: Vec<String>,
    pub confidence_score: Option<f64>,
}

#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("completion had no text content")]
    MissingContent,
    #[error("completion text contained no JSON object")]
    NoJson,
    #[error("completion JSON did not parse: {0}")]
    Parse(#[from] serde_json::Error),
}

#[async_trait]
pub trait AdvisoryExtractor: Send + Sync {
    /// `Ok(None)` when extraction is switched off.
    async fn extract(&self, transcript: &str) -> Result<Option<AdvisoryExtract>, AdvisoryError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledExtractor;

#[async_trait]
impl AdvisoryExtractor for DisabledExtractor {
    async fn extract(&self, _transcript: &str) -> Result<Option<AdvisoryExtract>, AdvisoryError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct AdvisoryConfig {
    pub api_key: String,
    pub model: String,
    pub endpoint: String,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub backoff: BackoffPolicy,
}

impl AdvisoryConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(20),
            max_tokens: 1024,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpExtractor {
    client: reqwest::Client,
    config: AdvisoryConfig,
}

impl HttpExtractor {
    pub fn new(config: AdvisoryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building advisory http client")?;
        Ok(Self { client, config })
    }

    async fn complete(&self, prompt: &str) -> Result<JsonValue, AdvisoryError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut attempt = 0;
        loop {
            let resp_result = self
                .client
                .post(&self.config.endpoint)
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body)
                .send()
                .await;
            let can_retry = attempt < self.config.backoff.max_retries;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json::<JsonValue>().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(AdvisoryError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(AdvisoryError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl AdvisoryExtractor for HttpExtractor {
    async fn extract(&self, transcript: &str) -> Result<Option<AdvisoryExtract>, AdvisoryError> {
        let span = info_span!("advisory_extract", model = %self.config.model);
        async {
            let completion = self.complete(&build_prompt(transcript)).await?;
            let extract = parse_completion(&completion)?;
            debug!(?extract, "advisory extraction parsed");
            Ok::<_, AdvisoryError>(Some(extract))
        }
        .instrument(span)
        .await
    }
}

pub fn build_prompt(transcript: &str) -> String {
    format!(
        "Extract structured fields from this sales debrief transcript.\n\n\
         Reply with a single JSON object using only these keys, omitting any that are not mentioned:\n\
         - budget_status: \"Resolved Today\" | \"Approved\" | \"Freeze\"\n\
         - decision_maker: exact name of the person who signs off\n\
         - next_meeting: RFC 3339 datetime when a specific time is given\n\
         - sentiment: \"positive\" | \"negative\" | \"neutral\"\n\
         - key_insights: array of short strings\n\
         - action_items: array of short strings\n\
         - confidence_score: number between 0 and 1\n\n\
         Only report what is stated explicitly.\n\n\
         Transcript:\n{transcript}\n\nJSON:"
    )
}

/// Pulls the extract out of a messages-API response body.
pub fn parse_completion(body: &JsonValue) -> Result<AdvisoryExtract, AdvisoryError> {
    let text = body
        .get("content")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("text"))
        .and_then(JsonValue::as_str)
        .ok_or(AdvisoryError::MissingContent)?;
    let json = json_object_span(text).ok_or_else(|| {
        warn!(text, "advisory completion without JSON");
        AdvisoryError::NoJson
    })?;
    Ok(serde_json::from_str(json)?)
}

/// From the first `{` to the last `}`.
pub fn json_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn rate_limits_and_server_errors_are_retried() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[test]
    fn completion_json_is_found_inside_prose() {
        let body = serde_json::json!({
            "content": [{
                "type": "text",
                "text": "Here you go:\n{\"budget_status\": \"Resolved Today\", \"decision_maker\": \"David Chen\", \"key_insights\": [\"SOC 2 needed\"]}\nThanks"
            }]
        });
        let extract = parse_completion(&body).unwrap();
        assert_eq!(extract.budget_status.as_deref(), Some("Resolved Today"));
        assert_eq!(extract.decision_maker.as_deref(), Some("David Chen"));
        assert_eq!(extract.key_insights, vec!["SOC 2 needed".to_string()]);
        assert!(extract.action_items.is_empty());
        assert!(extract.sentiment.is_none());
    }

    #[test]
    fn completion_without_json_is_an_error() {
        let body = serde_json::json!({ "content": [{ "type": "text", "text": "no fields found" }] });
        assert!(matches!(parse_completion(&body), Err(AdvisoryError::NoJson)));

        let empty = serde_json::json!({ "content": [] });
        assert!(matches!(parse_completion(&empty), Err(AdvisoryError::MissingContent)));

        let broken = serde_json::json!({ "content": [{ "text": "{\"budget_status\": }" }] });
        assert!(matches!(parse_completion(&broken), Err(AdvisoryError::Parse(_))));
    }

    #[test]
    fn prompt_embeds_transcript() {
        let prompt = build_prompt("budget resolved with David Chen");
        assert!(prompt.contains("budget resolved with David Chen"));
        assert!(prompt.trim_end().ends_with("JSON:"));
    }

    #[tokio::test]
    async fn disabled_extractor_returns_nothing() {
        let out = DisabledExtractor.extract("anything").await.unwrap();
        assert!(out.is_none());
    }
}
