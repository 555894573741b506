//! Ollama chat API client
//!
//! Sends one `/api/chat` request per analysis (non-streaming, base64 image
//! attached) and lists installed models via `/api/tags`. An optional token
//! bucket caps the request rate on shared backends.

use super::{AnalysisRequest, ContentRef, ModelError, VisionModel};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<InstalledModel>,
}

#[derive(Debug, Deserialize)]
struct InstalledModel {
    name: String,
}

/// Ollama backend client
pub struct OllamaClient {
    client: Client,
    /// Base URL (e.g. "http://localhost:11434")
    base_url: String,
    rate_limiter: Option<DirectRateLimiter>,
}

impl OllamaClient {
    /// Create a client for the given endpoint
    ///
    /// Per-request deadlines are enforced by the caller; only the connection
    /// phase is bounded here.
    ///
    /// # Arguments
    /// * `base_url` - Backend endpoint
    /// * `requests_per_second` - Optional client-side request quota
    pub fn new(base_url: &str, requests_per_second: Option<u32>) -> Result<Self, ModelError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("kwp-ai/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ModelError::Transport(format!("HTTP client setup failed: {}", e)))?;

        let rate_limiter = requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Names of models installed on the backend
    pub async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Backend {
                status: status.as_u16(),
                message,
            });
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(format!("Model list: {}", e)))?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn build_message(&self, request: &AnalysisRequest) -> Result<ChatMessage, ModelError> {
        match &request.content {
            ContentRef::Image(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    ModelError::Content(format!("Cannot read {}: {}", path.display(), e))
                })?;
                Ok(ChatMessage {
                    role: "user",
                    content: request.prompt.clone(),
                    images: vec![BASE64.encode(bytes)],
                })
            }
            ContentRef::Summary(summary) => Ok(ChatMessage {
                role: "user",
                content: format!("{}\n\nPhotos in this collection:\n{}", request.prompt, summary),
                images: Vec::new(),
            }),
        }
    }
}

fn map_transport_error(e: reqwest::Error) -> ModelError {
    if e.is_timeout() {
        ModelError::Timeout(Duration::ZERO)
    } else {
        ModelError::Transport(e.to_string())
    }
}

#[async_trait]
impl VisionModel for OllamaClient {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, ModelError> {
        let message = self.build_message(request).await?;

        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let payload = ChatRequest {
            model: &request.model.name,
            messages: vec![message],
            stream: false,
            options: ChatOptions {
                temperature: request.model.temperature,
            },
        };

        tracing::debug!(
            model = %request.model.name,
            kind = %request.kind,
            "Sending chat request"
        );

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Backend {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        body.message
            .and_then(|m| m.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| ModelError::InvalidResponse("Missing message.content".to_string()))
    }
}
