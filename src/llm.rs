//! Completion client abstraction.
//!
//! [`CompletionClient`] is the seam to the hosted language model. A single
//! call is one attempt; retry/backoff policy lives in the orchestrator, which
//! distinguishes [`LlmError::Transient`] (retryable: rate limits, server
//! errors, network failures, timeouts) from [`LlmError::Permanent`]
//! (non-retryable: bad request, bad credentials).

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::config::LlmConfig;

/// One message handed to the completion API.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Worth retrying with backoff.
    #[error("transient completion failure: {0}")]
    Transient(String),
    /// Retrying cannot help.
    #[error("completion failure: {0}")]
    Permanent(String),
}

/// Generates one assistant reply per call.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}

/// Client for the OpenAI chat completions API.
///
/// Reads `OPENAI_API_KEY` from the environment at call time. The request
/// carries a bounded timeout; a timeout is a transient failure.
pub struct OpenAiChatClient {
    model: String,
    temperature: f64,
    timeout: Duration,
}

impl OpenAiChatClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl CompletionClient for OpenAiChatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| LlmError::Permanent("OPENAI_API_KEY not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| LlmError::Permanent(e.to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": messages,
        });

        let resp = client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        let status = resp.status();

        if status.is_success() {
            let json: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| LlmError::Transient(e.to_string()))?;
            return parse_completion_response(&json);
        }

        let body_text = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            Err(LlmError::Transient(format!(
                "completions API error {}: {}",
                status, body_text
            )))
        } else {
            Err(LlmError::Permanent(format!(
                "completions API error {}: {}",
                status, body_text
            )))
        }
    }
}

fn parse_completion_response(json: &serde_json::Value) -> Result<String, LlmError> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            LlmError::Transient("Invalid completions response: missing choices".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_choice_content() {
        let json = serde_json::json!({
            "choices": [
                { "message": { "role": "assistant", "content": "Up to 3 days per week." } }
            ]
        });
        assert_eq!(
            parse_completion_response(&json).unwrap(),
            "Up to 3 days per week."
        );
    }

    #[test]
    fn missing_choices_is_an_error() {
        let json = serde_json::json!({ "id": "cmpl-1" });
        assert!(parse_completion_response(&json).is_err());
    }
}
