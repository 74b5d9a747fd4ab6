//! HTTP judgment oracle
//!
//! Talks to any OpenAI-compatible chat completions endpoint (OpenRouter by default).
//! Retries live in the semantic engine; this client makes exactly one request per call
//! and classifies failures so the engine knows which ones are worth retrying.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OracleConfig;
use crate::domain::semantic::{JudgmentOracle, JudgmentRequest};
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions backed oracle
#[derive(Clone)]
pub struct HttpJudgmentOracle {
    http_client: HttpClient,
    config: OracleConfig,
    api_key: String,
}

impl std::fmt::Debug for HttpJudgmentOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJudgmentOracle")
            .field("endpoint", &self.config.endpoint)
            .field("model", &self.config.model)
            .finish()
    }
}

impl HttpJudgmentOracle {
    pub fn new(config: OracleConfig, api_key: impl Into<String>) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(Error::NetworkError)?;

        Ok(Self {
            http_client,
            config,
            api_key: api_key.into(),
        })
    }

    /// Build from configuration, taking the API key from the environment
    pub fn from_config(config: &OracleConfig) -> Result<Self> {
        let api_key = config
            .resolved_api_key()
            .map_err(|e| Error::ConfigError(e.to_string()))?
            .ok_or_else(|| {
                Error::ConfigError(
                    "oracle API key missing. Set RELGRAPH_ORACLE_API_KEY or OPENROUTER_API_KEY."
                        .to_string(),
                )
            })?;
        Self::new(config.clone(), api_key)
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.config.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl JudgmentOracle for HttpJudgmentOracle {
    async fn judge(&self, request: &JudgmentRequest) -> Result<String> {
        let (system, user) = request.prompt();
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        debug!(
            model = %self.config.model,
            candidates = request.candidates.len(),
            "Sending judgment request"
        );

        let response = self
            .http_client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header("X-Title", "Relgraph")
            .json(&body)
            .send()
            .await
            .map_err(Error::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &text));
        }

        let text = response.text().await.map_err(Error::NetworkError)?;
        response_content(&text)
    }
}

/// Map a non-success status to the error the retry loop understands
fn status_error(status: u16, body: &str) -> Error {
    match status {
        401 | 403 => Error::ConfigError(format!(
            "oracle rejected the API key ({}). Check RELGRAPH_ORACLE_API_KEY.",
            status
        )),
        408 | 429 => Error::transient("oracle", format!("HTTP {}: {}", status, body)),
        500..=599 => Error::transient("oracle", format!("server error {}: {}", status, body)),
        _ => Error::Fatal(format!("oracle request failed with HTTP {}: {}", status, body)),
    }
}

/// Pull the assistant content out of a chat completions reply
fn response_content(body: &str) -> Result<String> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| Error::SchemaViolation(format!("unreadable oracle response: {}", e)))?;

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| Error::SchemaViolation("oracle returned no content".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(status_error(429, "slow down").is_retryable());
        assert!(status_error(503, "").is_retryable());
        assert!(matches!(status_error(401, ""), Error::ConfigError(_)));
        assert!(!status_error(400, "bad").is_retryable());
    }

    #[test]
    fn test_response_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"{\"judgments\":[]}"}}]}"#;
        assert_eq!(response_content(body).unwrap(), r#"{"judgments":[]}"#);

        let empty = r#"{"choices":[]}"#;
        assert!(matches!(response_content(empty), Err(Error::SchemaViolation(_))));
        assert!(response_content("<html>").is_err());
    }

    #[test]
    fn test_url_trims_trailing_slash() {
        let config = OracleConfig {
            endpoint: "http://localhost:8080/v1/".to_string(),
            ..OracleConfig::default()
        };
        let oracle = HttpJudgmentOracle::new(config, "key").unwrap();
        assert_eq!(oracle.url(), "http://localhost:8080/v1/chat/completions");
        assert!(!format!("{:?}", oracle).contains("key"));
    }
}
