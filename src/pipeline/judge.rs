use std::collections::HashSet;

use serde::Deserialize;

use crate::constraints::Constraints;
use crate::dataset::Sample;
use crate::llm::{ChatMessage, ResponseFormat};
use crate::record::{ScoreBreakdown, Usage};

use super::prompts::{render_template, DEFAULT_JUDGE_TEMPLATE};
use super::{extract_json_obj, LlmComponent};

const HEURISTIC_CONSTRAINT_COMPLIANCE: f32 = 0.75;
const HEURISTIC_STYLE_FIT: f32 = 0.7;

/// Scores the final translation on the five-dimension rubric. With an LLM,
/// `runs` independent calls are reduced per dimension by median; a call
/// that fails to parse contributes a heuristic score instead.
pub struct Judge {
    pub llm: Option<LlmComponent>,
    pub runs: usize,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ScoreDraft {
    adequacy: Option<f32>,
    fluency: Option<f32>,
    constraint_compliance: Option<f32>,
    style_fit: Option<f32>,
    overall: Option<f32>,
}

impl Judge {
    pub fn judge(
        &self,
        sample: &Sample,
        constraints: &Constraints,
        final_text: &str,
    ) -> (ScoreBreakdown, Usage) {
        let Some(llm) = self.llm.as_ref() else {
            return (heuristic_score(sample, final_text), Usage::default());
        };

        let mut usage = Usage::default();
        let mut scores = Vec::new();
        for _ in 0..self.runs.max(1) {
            match self.one_llm_score(llm, sample, constraints, final_text) {
                Ok((score, u)) => {
                    usage.add(u);
                    scores.push(score);
                }
                Err(err) => {
                    tracing::debug!(sample = %sample.id, "judge iteration fell back: {err}");
                    scores.push(heuristic_score(sample, final_text));
                }
            }
        }
        (median_scores(&scores), usage)
    }

    fn one_llm_score(
        &self,
        llm: &LlmComponent,
        sample: &Sample,
        constraints: &Constraints,
        final_text: &str,
    ) -> anyhow::Result<(ScoreBreakdown, Usage)> {
        let template = llm
            .prompt
            .template
            .as_deref()
            .unwrap_or(DEFAULT_JUDGE_TEMPLATE);
        let rendered = render_template(
            template,
            &[
                ("text", sample.text.as_str()),
                ("reference", sample.reference.as_deref().unwrap_or("")),
                ("final", final_text),
                ("constraints", constraints.render_block().as_str()),
            ],
        );
        let mut messages = Vec::new();
        if let Some(system) = llm.prompt.system.as_deref() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(rendered));

        let response = llm.chat(messages, ResponseFormat::Json)?;
        let usage = response.usage;
        let draft: ScoreDraft = serde_json::from_value(extract_json_obj(&response.text)?)?;
        let base = heuristic_score(sample, final_text);
        let score = ScoreBreakdown {
            adequacy: clamp01(draft.adequacy.unwrap_or(base.adequacy)),
            fluency: clamp01(draft.fluency.unwrap_or(base.fluency)),
            constraint_compliance: clamp01(
                draft.constraint_compliance.unwrap_or(base.constraint_compliance),
            ),
            style_fit: clamp01(draft.style_fit.unwrap_or(base.style_fit)),
            overall: clamp01(draft.overall.unwrap_or(base.overall)),
        };
        Ok((score, usage))
    }
}

/// Reference-based fallback rubric. Only used when no judge model is wired
/// or an iteration's output is unusable.
#[must_use]
pub fn heuristic_score(sample: &Sample, final_text: &str) -> ScoreBreakdown {
    let reference = sample.reference.as_deref().unwrap_or(sample.text.as_str());
    let adequacy = token_overlap(final_text, reference);

    let src_chars = sample.text.chars().count().max(1);
    let ratio = final_text.chars().count() as f32 / src_chars as f32;
    let fluency = clamp01(1.0 - (ratio - 1.0).abs() * 0.5);

    let constraint_compliance = HEURISTIC_CONSTRAINT_COMPLIANCE;
    let style_fit = HEURISTIC_STYLE_FIT;
    let overall = clamp01(
        0.40 * adequacy + 0.20 * fluency + 0.25 * constraint_compliance + 0.15 * style_fit,
    );
    ScoreBreakdown {
        adequacy,
        fluency,
        constraint_compliance,
        style_fit,
        overall,
    }
}

fn token_overlap(candidate: &str, reference: &str) -> f32 {
    let refs: HashSet<String> = reference
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    if refs.is_empty() {
        return 0.0;
    }
    let hits = candidate
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect::<HashSet<_>>()
        .intersection(&refs)
        .count();
    clamp01(hits as f32 / refs.len() as f32)
}

#[must_use]
pub fn median_scores(scores: &[ScoreBreakdown]) -> ScoreBreakdown {
    ScoreBreakdown {
        adequacy: median(scores.iter().map(|s| s.adequacy)),
        fluency: median(scores.iter().map(|s| s.fluency)),
        constraint_compliance: median(scores.iter().map(|s| s.constraint_compliance)),
        style_fit: median(scores.iter().map(|s| s.style_fit)),
        overall: median(scores.iter().map(|s| s.overall)),
    }
}

fn median(values: impl Iterator<Item = f32>) -> f32 {
    let mut v: Vec<f32> = values.collect();
    if v.is_empty() {
        return 0.0;
    }
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = v.len() / 2;
    if v.len() % 2 == 1 {
        v[mid]
    } else {
        (v[mid - 1] + v[mid]) / 2.0
    }
}

fn clamp01(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::ConstraintsPatch;

    fn sample(reference: Option<&str>) -> Sample {
        Sample {
            id: "s1".into(),
            text: "こんにちは、世界。".into(),
            context: String::new(),
            constraints: ConstraintsPatch::default(),
            reference: reference.map(str::to_string),
        }
    }

    #[test]
    fn median_is_per_dimension() {
        let scores = vec![
            ScoreBreakdown {
                adequacy: 0.1,
                fluency: 0.9,
                constraint_compliance: 0.5,
                style_fit: 0.5,
                overall: 0.2,
            },
            ScoreBreakdown {
                adequacy: 0.9,
                fluency: 0.1,
                constraint_compliance: 0.5,
                style_fit: 0.5,
                overall: 0.8,
            },
            ScoreBreakdown {
                adequacy: 0.5,
                fluency: 0.5,
                constraint_compliance: 0.5,
                style_fit: 0.5,
                overall: 0.4,
            },
        ];
        let m = median_scores(&scores);
        assert!((m.adequacy - 0.5).abs() < 1e-6);
        assert!((m.fluency - 0.5).abs() < 1e-6);
        assert!((m.overall - 0.4).abs() < 1e-6);
    }

    #[test]
    fn even_count_averages_the_middle_pair() {
        let m = median(vec![0.0, 0.2, 0.8, 1.0].into_iter());
        assert!((m - 0.5).abs() < 1e-6);
    }

    #[test]
    fn heuristic_scores_stay_in_unit_interval() {
        let s = heuristic_score(&sample(Some("Hello, world.")), "Hello, world.");
        for v in [s.adequacy, s.fluency, s.constraint_compliance, s.style_fit, s.overall] {
            assert!((0.0..=1.0).contains(&v), "score out of range: {v}");
        }
        assert!(s.adequacy > 0.99);
    }

    #[test]
    fn judge_without_llm_is_single_heuristic() {
        let judge = Judge { llm: None, runs: 3 };
        let c = crate::constraints::normalize(&ConstraintsPatch::default(), &ConstraintsPatch::default())
            .expect("normalize");
        let (score, usage) = judge.judge(&sample(None), &c, "こんにちは, 世界.");
        let expected = heuristic_score(&sample(None), "こんにちは, 世界.");
        assert!((score.overall - expected.overall).abs() < 1e-6);
        assert_eq!(usage.total, 0);
    }
}
