use anyhow::Context;
use regex::RegexBuilder;

use crate::constraints::Constraints;
use crate::dataset::Sample;
use crate::llm::{ChatMessage, ResponseFormat};
use crate::record::{Issue, State, Usage};

use super::prompts::{render_template, DEFAULT_REPAIR_TEMPLATE};
use super::LlmComponent;

/// Rewrites a translation so the reported issues go away. Severity policy
/// lives in the orchestrator; the repairer fixes whatever it is handed.
pub struct Repairer {
    pub llm: Option<LlmComponent>,
}

impl Repairer {
    pub fn repair(
        &self,
        sample: &Sample,
        constraints: &Constraints,
        current: &str,
        issues: &[Issue],
        state: Option<&State>,
    ) -> anyhow::Result<(String, Usage)> {
        if issues.is_empty() {
            return Ok((current.to_string(), Usage::default()));
        }

        let Some(llm) = self.llm.as_ref() else {
            return Ok((heuristic_repair(constraints, current), Usage::default()));
        };

        let issues_json = serde_json::to_string_pretty(issues).context("serialize issues")?;
        let constraints_json =
            serde_json::to_string_pretty(constraints).context("serialize constraints")?;
        let state_json = match state {
            Some(s) => serde_json::to_string_pretty(s).context("serialize state")?,
            None => "null".to_string(),
        };
        let template = llm
            .prompt
            .template
            .as_deref()
            .unwrap_or(DEFAULT_REPAIR_TEMPLATE);
        let rendered = render_template(
            template,
            &[
                ("source", sample.text.as_str()),
                ("context", sample.context.as_str()),
                ("current", current),
                ("issues", issues_json.as_str()),
                ("constraints", constraints_json.as_str()),
                ("state", state_json.as_str()),
            ],
        );
        let mut messages = Vec::new();
        if let Some(system) = llm.prompt.system.as_deref() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(rendered));

        let response = llm
            .chat(messages, ResponseFormat::Text)
            .with_context(|| format!("repair sample {}", sample.id))?;
        let usage = response.usage;
        Ok((response.text.trim().to_string(), usage))
    }
}

/// Offline fallback: strip banned patterns, then clamp to maxChars.
fn heuristic_repair(constraints: &Constraints, current: &str) -> String {
    let mut out = current.to_string();
    for pat in &constraints.banned_patterns {
        // Patterns were validated by the normalizer; a stale entry is skipped.
        let Ok(re) = RegexBuilder::new(pat).case_insensitive(true).build() else {
            continue;
        };
        out = re.replace_all(&out, "").into_owned();
    }
    if let Some(max_chars) = constraints.format.max_chars {
        let max_chars = max_chars.max(0) as usize;
        if out.chars().count() > max_chars {
            out = out.chars().take(max_chars.saturating_sub(1)).collect();
            out.push('…');
        }
    }
    out
}
