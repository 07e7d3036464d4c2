use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::{Result, ToolbridgeError};

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Normalized completion result, regardless of provider response shape.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutput {
    pub text: String,
    pub model_used: String,
    pub usage: Value,
}

/// The external text-completion collaborator. The HTTP client below is the
/// production implementation; tests substitute a canned backend.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionOutput>;

    fn model(&self) -> &str;
}

/// Talks to an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpCompletionClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ToolbridgeError::CompletionFailed(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
        })
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionOutput> {
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let mut builder = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| ToolbridgeError::CompletionFailed(err.to_string()))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|err| ToolbridgeError::CompletionFailed(err.to_string()))?;
        if !status.is_success() {
            let message = payload
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed"));
            return Err(ToolbridgeError::CompletionFailed(message.to_string()));
        }

        let text = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ToolbridgeError::CompletionFailed(
                    "provider response carried no completion text".to_string(),
                )
            })?
            .to_string();
        let model_used = payload
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&self.model)
            .to_string();
        let usage = payload.get("usage").cloned().unwrap_or_else(|| json!({}));
        debug!(model = %model_used, "completion received");
        Ok(CompletionOutput {
            text,
            model_used,
            usage,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}
