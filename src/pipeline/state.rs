use serde::Deserialize;

use crate::dataset::Sample;
use crate::llm::{ChatMessage, ResponseFormat};
use crate::record::{EntityNote, State, Usage};

use super::prompts::{render_template, DEFAULT_STATE_TEMPLATE};
use super::{extract_json_obj, LlmComponent};

const UTTERANCE_MAX_CHARS: usize = 120;

/// Builds the narrative State for the stateful conditions. Never fails the
/// pipeline: any LLM or parse trouble falls back to the heuristic.
pub struct StateBuilder {
    pub llm: Option<LlmComponent>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StateDraft {
    utterance: Option<String>,
    speaker: Option<String>,
    addressee: Option<String>,
    entities: Option<Vec<EntityNote>>,
    core_meaning: Option<String>,
    implicature: Option<String>,
}

impl StateBuilder {
    pub fn build(&self, sample: &Sample) -> (State, Usage) {
        let Some(llm) = self.llm.as_ref() else {
            return (heuristic_state(sample), Usage::default());
        };

        let template = llm
            .prompt
            .template
            .as_deref()
            .unwrap_or(DEFAULT_STATE_TEMPLATE);
        let rendered = render_template(
            template,
            &[("text", &sample.text), ("context", &sample.context)],
        );
        let mut messages = Vec::new();
        if let Some(system) = llm.prompt.system.as_deref() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(rendered));

        let response = match llm.chat(messages, ResponseFormat::Json) {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(sample = %sample.id, "state builder llm failed: {err}");
                return (heuristic_state(sample), Usage::default());
            }
        };
        let usage = response.usage;

        let draft: StateDraft = match extract_json_obj(&response.text)
            .and_then(|v| serde_json::from_value(v).map_err(Into::into))
        {
            Ok(d) => d,
            Err(err) => {
                tracing::debug!(sample = %sample.id, "state json unusable, using heuristic: {err}");
                return (heuristic_state(sample), usage);
            }
        };

        let base = heuristic_state(sample);
        let state = State {
            utterance: draft.utterance.filter(|s| !s.is_empty()).unwrap_or(base.utterance),
            speaker: draft.speaker.filter(|s| !s.is_empty()).unwrap_or(base.speaker),
            addressee: draft
                .addressee
                .filter(|s| !s.is_empty())
                .unwrap_or(base.addressee),
            entities: draft.entities.unwrap_or(base.entities),
            core_meaning: draft
                .core_meaning
                .filter(|s| !s.is_empty())
                .unwrap_or(base.core_meaning),
            implicature: draft
                .implicature
                .filter(|s| !s.is_empty())
                .unwrap_or(base.implicature),
        };
        (state, usage)
    }
}

#[must_use]
pub fn heuristic_state(sample: &Sample) -> State {
    State {
        utterance: sample.text.chars().take(UTTERANCE_MAX_CHARS).collect(),
        speaker: "unknown".to_string(),
        addressee: "unknown".to_string(),
        entities: Vec::new(),
        core_meaning: sample.text.clone(),
        implicature: sample.context.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::ConstraintsPatch;

    fn sample(text: &str) -> Sample {
        Sample {
            id: "s1".into(),
            text: text.into(),
            context: "ctx".into(),
            constraints: ConstraintsPatch::default(),
            reference: None,
        }
    }

    #[test]
    fn heuristic_truncates_utterance_to_120_chars() {
        let long: String = "あ".repeat(200);
        let s = heuristic_state(&sample(&long));
        assert_eq!(s.utterance.chars().count(), 120);
        assert_eq!(s.speaker, "unknown");
        assert_eq!(s.core_meaning, long);
        assert_eq!(s.implicature, "ctx");
    }

    #[test]
    fn builder_without_llm_uses_heuristic() {
        let builder = StateBuilder { llm: None };
        let (state, usage) = builder.build(&sample("こんにちは"));
        assert_eq!(state.utterance, "こんにちは");
        assert_eq!(usage.total, 0);
    }
}
