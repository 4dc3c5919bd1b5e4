use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use crate::llm::{
    ChatClient, ChatMessage, LlmError, LlmRequest, LlmResponse, ModelSpec, ResponseFormat, Role,
};

pub mod judge;
pub mod prompts;
pub mod repair;
pub mod runner;
pub mod state;
pub mod trace;
pub mod translate;
pub mod verify;

use prompts::ResolvedPrompt;

/// One configured LLM-backed component: a client seam, the model spec and
/// the resolved prompt. Stages own one of these (or none, for heuristic
/// fallbacks).
#[derive(Clone)]
pub struct LlmComponent {
    pub client: Arc<dyn ChatClient>,
    pub spec: ModelSpec,
    pub prompt: ResolvedPrompt,
}

impl LlmComponent {
    pub fn new(client: Arc<dyn ChatClient>, spec: ModelSpec, prompt: ResolvedPrompt) -> Self {
        Self {
            client,
            spec,
            prompt,
        }
    }

    /// Artifact params fill sampling options the component config left unset.
    #[must_use]
    fn effective_spec(&self) -> ModelSpec {
        let mut spec = self.spec.clone();
        if let Some(params) = self.prompt.params.as_ref() {
            if spec.temperature.is_none() {
                spec.temperature = params.temperature;
            }
            if spec.max_output_tokens.is_none() {
                spec.max_output_tokens = params.max_output_tokens;
            }
        }
        spec
    }

    /// Send one chat request. Artifact few-shots are spliced in before the
    /// final user message; `jsonMode` on the model spec forces JSON output
    /// regardless of the stage's preference.
    pub fn chat(
        &self,
        mut messages: Vec<ChatMessage>,
        response_format: ResponseFormat,
    ) -> Result<LlmResponse, LlmError> {
        let response_format = if self.spec.json_mode == Some(true) {
            ResponseFormat::Json
        } else {
            response_format
        };
        if !self.prompt.few_shots.is_empty() {
            let at = messages
                .iter()
                .rposition(|m| m.role == Role::User)
                .unwrap_or(messages.len());
            let shots: Vec<ChatMessage> = self
                .prompt
                .few_shots
                .iter()
                .map(|s| ChatMessage {
                    role: match s.role.as_str() {
                        "assistant" => Role::Assistant,
                        "system" => Role::System,
                        _ => Role::User,
                    },
                    content: s.content.clone(),
                })
                .collect();
            messages.splice(at..at, shots);
        }
        self.client.chat(&LlmRequest {
            model: self.effective_spec(),
            messages,
            response_format,
        })
    }
}

/// Extract the first JSON object from model output, tolerating leading
/// prose and trailing noise.
pub fn extract_json_obj(text: &str) -> anyhow::Result<serde_json::Value> {
    let start = text.find('{').context("no_json_object_start")?;
    let slice = &text[start..];
    let mut de = serde_json::Deserializer::from_str(slice);
    let v = serde_json::Value::deserialize(&mut de).context("json_parse_failed")?;
    Ok(v)
}
