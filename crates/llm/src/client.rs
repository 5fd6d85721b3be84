//! HTTP client for OpenAI-compatible chat endpoints.

use crate::LlmError;
use async_trait::async_trait;
use ojforge_models::ProviderSpec;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// One completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// Completion result with usage accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub tokens: u64,
    pub latency_ms: u64,
}

/// Seam between the pool and concrete transports; test doubles implement it.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u64,
}

/// Real provider client over a shared `reqwest` transport.
pub struct HttpProviderClient {
    http: reqwest::Client,
    api_url: String,
    api_key: SecretString,
    model: String,
}

impl HttpProviderClient {
    pub fn new(
        http: reqwest::Client,
        spec: &ProviderSpec,
        api_key: SecretString,
        api_url_override: Option<String>,
        model_override: Option<String>,
    ) -> Self {
        Self {
            http,
            api_url: api_url_override.unwrap_or_else(|| spec.api_url.clone()),
            api_key,
            model: model_override.unwrap_or_else(|| spec.default_model.clone()),
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let url = format!("{}/chat/completions", self.api_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let started = Instant::now();
        let response = self
            .http
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::TransientNetwork(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let parsed: ChatResponse = response
                    .json()
                    .await
                    .map_err(|e| LlmError::BadResponse(format!("parse error: {e}")))?;
                let text = parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .ok_or_else(|| LlmError::BadResponse("response had no choices".into()))?;
                let latency_ms = started.elapsed().as_millis() as u64;
                debug!(model = %self.model, latency_ms, "llm completion ok");
                Ok(Completion {
                    text,
                    tokens: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
                    latency_ms,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(LlmError::Auth(format!("HTTP {}", response.status())))
            }
            StatusCode::TOO_MANY_REQUESTS => Err(LlmError::RateLimited("HTTP 429".into())),
            status if status.is_server_error() => {
                let text = response.text().await.unwrap_or_default();
                Err(LlmError::TransientNetwork(format!("HTTP {status}: {text}")))
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(LlmError::BadResponse(format!("HTTP {status}: {text}")))
            }
        }
    }
}
