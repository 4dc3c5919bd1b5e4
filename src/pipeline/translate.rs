use anyhow::Context;

use crate::constraints::Constraints;
use crate::dataset::Sample;
use crate::llm::{ChatMessage, ResponseFormat};
use crate::record::{State, Usage};

use super::prompts::{render_template, DEFAULT_TRANSLATE_SYSTEM, DEFAULT_TRANSLATE_TEMPLATE};
use super::LlmComponent;

/// The drafting stage. Instructions (constraints, context, state) travel in
/// the system message; the user message is exactly the source text, so the
/// provider sees a clean final turn.
pub struct Translator {
    pub llm: LlmComponent,
}

impl Translator {
    pub fn translate(
        &self,
        sample: &Sample,
        constraints: &Constraints,
        state: Option<&State>,
    ) -> anyhow::Result<(String, Usage)> {
        let state_json = match state {
            Some(s) => serde_json::to_string_pretty(s).context("serialize state")?,
            None => "not provided".to_string(),
        };
        let template = self
            .llm
            .prompt
            .template
            .as_deref()
            .unwrap_or(DEFAULT_TRANSLATE_TEMPLATE);
        let instructions = render_template(
            template,
            &[
                ("text", sample.text.as_str()),
                ("context", sample.context.as_str()),
                ("state", state_json.as_str()),
                ("constraints", constraints.render_block().as_str()),
                ("targetLang", constraints.target_lang.as_str()),
            ],
        );
        let persona = self
            .llm
            .prompt
            .system
            .as_deref()
            .unwrap_or(DEFAULT_TRANSLATE_SYSTEM);

        let messages = vec![
            ChatMessage::system(format!("{persona}\n\n{instructions}")),
            ChatMessage::user(sample.text.clone()),
        ];
        let response = self
            .llm
            .chat(messages, ResponseFormat::Text)
            .with_context(|| format!("translate sample {}", sample.id))?;
        let usage = response.usage;
        Ok((response.text.trim_end().to_string(), usage))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::constraints::{normalize, ConstraintsPatch};
    use crate::llm::limiter::RateLimiter;
    use crate::llm::{Gateway, ModelSpec, ProviderKind};
    use crate::pipeline::prompts::ResolvedPrompt;

    fn mock_translator() -> Translator {
        let gateway = Gateway::new(None, None, Arc::new(RateLimiter::new(None, None)));
        Translator {
            llm: LlmComponent::new(
                Arc::new(gateway),
                ModelSpec {
                    provider: ProviderKind::Mock,
                    name: "mock".into(),
                    temperature: None,
                    top_p: None,
                    max_output_tokens: None,
                    json_mode: None,
                },
                ResolvedPrompt::default(),
            ),
        }
    }

    #[test]
    fn mock_draft_is_the_punctuation_mapped_source() {
        let sample = Sample {
            id: "s1".into(),
            text: "こんにちは、世界。".into(),
            context: String::new(),
            constraints: ConstraintsPatch::default(),
            reference: None,
        };
        let constraints =
            normalize(&ConstraintsPatch::default(), &sample.constraints).expect("normalize");
        let (draft, usage) = mock_translator()
            .translate(&sample, &constraints, None)
            .expect("translate");
        assert_eq!(draft, "こんにちは, 世界.");
        assert!(usage.total > 0);
    }
}
