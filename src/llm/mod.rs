use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::record::Usage;

pub mod cache;
pub mod limiter;
pub mod mock;
pub mod openai;

use cache::DiskCache;
use limiter::RateLimiter;
use mock::MockProvider;
use openai::OpenAiProvider;

/// Upper-bound token cost declared to the limiter when the request sets no
/// output cap.
pub const DEFAULT_TOKEN_COST: u32 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Mock,
    OpenAi,
}

impl ProviderKind {
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            ProviderKind::Mock => "mock",
            ProviderKind::OpenAi => "openai",
        }
    }
}

/// Provider selection and sampling for one component, as configured.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    #[serde(default)]
    pub provider: ProviderKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_mode: Option<bool>,
}

/// The common request contract every provider implements.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmRequest {
    pub model: ModelSpec,
    pub messages: Vec<ChatMessage>,
    pub response_format: ResponseFormat,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub usage: Usage,
    pub raw: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider returned status {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// The seam every pipeline stage talks through. The production impl is
/// [`Gateway`]; tests substitute scripted clients.
pub trait ChatClient: Send + Sync {
    fn chat(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// The sole doorway to model providers: dispatches on the request's
/// provider, consults the on-disk cache first, and charges the shared rate
/// limiter only for actual provider calls.
pub struct Gateway {
    mock: MockProvider,
    openai: Option<OpenAiProvider>,
    cache: Option<DiskCache>,
    limiter: Arc<RateLimiter>,
}

impl Gateway {
    pub fn new(
        openai: Option<OpenAiProvider>,
        cache_dir: Option<PathBuf>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            mock: MockProvider,
            openai,
            cache: cache_dir.map(DiskCache::new),
            limiter,
        }
    }
}

impl ChatClient for Gateway {
    fn chat(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let key = cache::request_key(request.model.provider.id(), request);
        if let Some(cache) = self.cache.as_ref() {
            if let Some(hit) = cache.get(&request.model.name, &key) {
                tracing::debug!(model = %request.model.name, %key, "llm cache hit");
                return Ok(hit);
            }
        }

        let cost = request.model.max_output_tokens.unwrap_or(DEFAULT_TOKEN_COST);
        self.limiter.admit(cost);

        let response = match request.model.provider {
            ProviderKind::Mock => self.mock.chat(request),
            ProviderKind::OpenAi => match self.openai.as_ref() {
                Some(p) => p.chat(request),
                None => Err(LlmError::Transport(
                    "openai provider not configured".to_string(),
                )),
            },
        }?;

        if let Some(cache) = self.cache.as_ref() {
            if let Err(err) = cache.put(&request.model.name, &key, &response) {
                tracing::warn!(%key, "llm cache write failed: {err:#}");
            }
        }
        Ok(response)
    }
}
