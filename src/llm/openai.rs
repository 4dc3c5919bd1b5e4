use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::record::Usage;

use super::{LlmError, LlmRequest, LlmResponse, ResponseFormat};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible chat completions over blocking HTTP. The gateway owns
/// retry policy; this client makes exactly one attempt per call.
pub struct OpenAiProvider {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiProvider {
    /// Reads `OPENAI_API_KEY`; a missing key is a configuration error.
    pub fn from_env(base_url: Option<String>) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("OPENAI_API_KEY is required for provider=openai"))?;
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        })
    }

    pub fn chat(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut body = serde_json::json!({
            "model": request.model.name,
            "messages": request.messages,
        });
        if let Some(t) = request.model.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = request.model.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if let Some(n) = request.model.max_output_tokens {
            body["max_tokens"] = serde_json::json!(n);
        }
        if request.response_format == ResponseFormat::Json {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|err| LlmError::Transport(err.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .map_err(|err| LlmError::Transport(err.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(LlmError::Provider { status, body: text });
        }

        let raw: serde_json::Value = serde_json::from_str(&text)
            .map_err(|err| LlmError::Malformed(format!("body is not json: {err}")))?;
        let output = raw["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::Malformed("missing choices[0].message.content".to_string()))?
            .to_string();
        let usage = Usage {
            prompt: raw["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion: raw["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total: raw["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
        };
        Ok(LlmResponse {
            text: output,
            usage,
            raw,
        })
    }
}
