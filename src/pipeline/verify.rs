use serde::Deserialize;

use crate::constraints::Constraints;
use crate::dataset::Sample;
use crate::hardcheck::{issues_from_hard_checks, run_hard_checks, HardCheckSettings};
use crate::llm::cache::sha256_hex;
use crate::llm::{ChatMessage, ResponseFormat};
use crate::record::{HardCheckResult, Issue, IssueType, Severity, Usage};

use super::prompts::{render_template, DEFAULT_VERIFY_TEMPLATE};
use super::{extract_json_obj, LlmComponent};

/// Runs the deterministic rules, then the LLM reviewer when one is wired.
/// Never raises: reviewer trouble yields zero LLM issues while rule-derived
/// issues are always returned.
pub struct Verifier {
    pub llm: Option<LlmComponent>,
    pub settings: HardCheckSettings,
}

pub struct Verification {
    pub issues: Vec<Issue>,
    pub hard_checks: Vec<HardCheckResult>,
    pub usage: Usage,
}

impl Verification {
    /// True when nothing forces another repair round.
    #[must_use]
    pub fn clean(&self) -> bool {
        self.hard_checks.iter().all(|c| c.passed)
            && self.issues.iter().all(|i| i.severity != Severity::Critical)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
struct ReviewResponse {
    #[serde(default)]
    issues: Vec<IssueDraft>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct IssueDraft {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: IssueType,
    severity: Severity,
    rationale: String,
    fix_suggestion: String,
    confidence: Option<f32>,
}

impl Verifier {
    pub fn verify(
        &self,
        sample: &Sample,
        constraints: &Constraints,
        current: &str,
    ) -> Verification {
        let hard_checks = run_hard_checks(&sample.text, current, constraints, &self.settings);
        let mut issues = issues_from_hard_checks(&hard_checks);
        let mut usage = Usage::default();

        if let Some(llm) = self.llm.as_ref() {
            let template = llm
                .prompt
                .template
                .as_deref()
                .unwrap_or(DEFAULT_VERIFY_TEMPLATE);
            let rendered = render_template(
                template,
                &[
                    ("text", sample.text.as_str()),
                    ("context", sample.context.as_str()),
                    ("draft", current),
                    ("constraints", constraints.render_block().as_str()),
                ],
            );
            let mut messages = Vec::new();
            if let Some(system) = llm.prompt.system.as_deref() {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(rendered));

            match llm.chat(messages, ResponseFormat::Json) {
                Ok(response) => {
                    usage.add(response.usage);
                    issues.extend(parse_review_issues(&response.text));
                }
                Err(err) => {
                    tracing::warn!(sample = %sample.id, "verifier llm failed: {err}");
                }
            }
        }

        Verification {
            issues,
            hard_checks,
            usage,
        }
    }
}

fn parse_review_issues(text: &str) -> Vec<Issue> {
    let parsed: ReviewResponse = match extract_json_obj(text)
        .and_then(|v| serde_json::from_value(v).map_err(Into::into))
    {
        Ok(r) => r,
        Err(err) => {
            tracing::debug!("reviewer output unusable, keeping rule issues only: {err}");
            return Vec::new();
        }
    };
    parsed
        .issues
        .into_iter()
        .map(|d| {
            let id = d
                .id
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| synthesize_issue_id(&d.kind, &d.rationale));
            Issue {
                id,
                kind: d.kind,
                severity: d.severity,
                rationale: d.rationale,
                fix_suggestion: d.fix_suggestion,
                confidence: d.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            }
        })
        .collect()
}

/// Stable id from (type, rationale), so the same defect keeps the same id
/// across repair rounds.
fn synthesize_issue_id(kind: &IssueType, rationale: &str) -> String {
    let tag = serde_json::to_string(kind).unwrap_or_default();
    let digest = sha256_hex(&format!("{tag}\n{rationale}"));
    digest[..12].to_string()
}
