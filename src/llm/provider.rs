//! Per-task completion client: resolves a provider + model for each task,
//! owns its own HTTP client, deadline, and retry/backoff. Grounded on the
//! teacher's `LlmManager`/`SpacebotModel` split but without the OAuth
//! complexity that split carried (this domain only ever uses API keys).

use crate::config::{ApiType, ProviderConfig};
use crate::error::{LlmError, Result};
use std::time::Duration;

const MAX_RETRIES_PER_CALL: u32 = 2;
const RETRY_BASE_DELAY_MS: u64 = 250;

/// A single provider + model endpoint, ready to run chat-style completions.
pub struct CompletionClient {
    http: reqwest::Client,
    provider: ProviderConfig,
    model: String,
    timeout: Duration,
}

impl CompletionClient {
    pub fn new(provider: ProviderConfig, model: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::ProviderRequest(e.to_string()))?;
        Ok(Self { http, provider, model, timeout })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Run a completion request, retrying transient transport failures
    /// (timeouts, connection errors, 5xx/429) up to `MAX_RETRIES_PER_CALL`
    /// times with exponential backoff. Schema-validation failures are the
    /// caller's concern and are never retried here.
    pub async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt_once(system_prompt, user_prompt).await {
                Ok(text) => return Ok(text),
                Err(err) if attempt <= MAX_RETRIES_PER_CALL && is_transient(&err) => {
                    let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 1);
                    tracing::warn!(
                        attempt,
                        model = %self.model,
                        error = %err,
                        "transient LLM call failure, retrying after {delay}ms"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt_once(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let (url, headers, body) = match self.provider.api_type {
            ApiType::Anthropic => self.anthropic_request(system_prompt, user_prompt),
            ApiType::OpenAiCompletions => self.openai_request(system_prompt, user_prompt),
        };

        let mut request = self.http.post(url).json(&body);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LlmError::ProviderRequest(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(LlmError::ProviderRequest(format!(
                "{} returned {status}: {body_text}",
                api_type_label(&self.provider.api_type)
            ))
            .into());
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::ProviderRequest(format!("invalid JSON response: {e}")))?;

        extract_text(&self.provider.api_type, &payload)
    }

    fn anthropic_request(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> (String, Vec<(&'static str, String)>, serde_json::Value) {
        let url = format!("{}/v1/messages", self.provider.base_url.trim_end_matches('/'));
        let headers = vec![
            ("x-api-key", self.provider.api_key.clone()),
            ("anthropic-version", "2023-06-01".to_string()),
            ("content-type", "application/json".to_string()),
        ];
        let body = serde_json::json!({
            "model": self.model,
            "system": system_prompt,
            "max_tokens": 4096,
            "messages": [{"role": "user", "content": user_prompt}],
        });
        (url, headers, body)
    }

    fn openai_request(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> (String, Vec<(&'static str, String)>, serde_json::Value) {
        let url = format!(
            "{}/chat/completions",
            self.provider.base_url.trim_end_matches('/')
        );
        let headers = vec![(
            "authorization",
            format!("Bearer {}", self.provider.api_key.clone()),
        )];
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });
        (url, headers, body)
    }
}

fn extract_text(api_type: &ApiType, payload: &serde_json::Value) -> Result<String> {
    match api_type {
        ApiType::Anthropic => payload
            .get("content")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                LlmError::ProviderRequest("anthropic response missing content[0].text".to_string()).into()
            }),
        ApiType::OpenAiCompletions => payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                LlmError::ProviderRequest(
                    "openai-compatible response missing choices[0].message.content".to_string(),
                )
                .into()
            }),
    }
}

fn api_type_label(api_type: &ApiType) -> &'static str {
    match api_type {
        ApiType::Anthropic => "anthropic",
        ApiType::OpenAiCompletions => "openai-compatible",
    }
}

fn is_transient(err: &crate::error::Error) -> bool {
    match err {
        crate::error::Error::Llm(LlmError::ProviderRequest(msg)) => {
            msg.contains("request failed")
                || msg.contains(" 429")
                || msg.contains(" 500")
                || msg.contains(" 502")
                || msg.contains(" 503")
                || msg.contains(" 504")
        }
        _ => false,
    }
}
