use serde::{Deserialize, Serialize};

use crate::constraints::Constraints;

/// Pipeline variant. Conditions differ only in which capabilities they
/// enable; stages branch on [`ConditionCaps`], never on the letter itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    A0,
    A1,
    A2,
    A3,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConditionCaps {
    pub has_state: bool,
    pub has_verify_repair: bool,
}

impl Condition {
    pub const ALL: [Condition; 4] = [Condition::A0, Condition::A1, Condition::A2, Condition::A3];

    #[must_use]
    pub fn caps(self) -> ConditionCaps {
        match self {
            Condition::A0 => ConditionCaps {
                has_state: false,
                has_verify_repair: false,
            },
            Condition::A1 => ConditionCaps {
                has_state: true,
                has_verify_repair: false,
            },
            Condition::A2 => ConditionCaps {
                has_state: false,
                has_verify_repair: true,
            },
            Condition::A3 => ConditionCaps {
                has_state: true,
                has_verify_repair: true,
            },
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Condition::A0 => "A0",
            Condition::A1 => "A1",
            Condition::A2 => "A2",
            Condition::A3 => "A3",
        }
    }
}

impl std::str::FromStr for Condition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A0" => Ok(Condition::A0),
            "A1" => Ok(Condition::A1),
            "A2" => Ok(Condition::A2),
            "A3" => Ok(Condition::A3),
            other => Err(anyhow::anyhow!("unknown condition: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    Mistranslation,
    Omission,
    Addition,
    TermInconsistency,
    PronounReference,
    SpeakerMismatch,
    StyleViolation,
    FormatViolation,
    SafetyOrPolicy,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    #[default]
    #[serde(other)]
    Minor,
}

/// One reviewer-found defect, either rule-derived or LLM-derived.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IssueType,
    pub severity: Severity,
    pub rationale: String,
    #[serde(default)]
    pub fix_suggestion: String,
    #[serde(default)]
    pub confidence: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardCheckResult {
    pub id: String,
    pub passed: bool,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Judge rubric. Every dimension lives in [0, 1].
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub adequacy: f32,
    pub fluency: f32,
    pub constraint_compliance: f32,
    pub style_fit: f32,
    pub overall: f32,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunScores {
    pub overall: f32,
    pub judge: ScoreBreakdown,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.prompt = self.prompt.saturating_add(other.prompt);
        self.completion = self.completion.saturating_add(other.completion);
        self.total = self.total.saturating_add(other.total);
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageMs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<u64>,
    pub translate: u64,
    pub verify: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair: Option<u64>,
    pub judge: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    pub stage_ms: StageMs,
    pub total_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityNote {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desc: String,
}

/// Facts extracted ahead of translation for the stateful conditions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub utterance: String,
    pub speaker: String,
    pub addressee: String,
    #[serde(default)]
    pub entities: Vec<EntityNote>,
    pub core_meaning: String,
    pub implicature: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanRecord {
    pub name: String,
    pub ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceInfo {
    pub trace_id: String,
    pub spans: Vec<SpanRecord>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TranslationText {
    pub en: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    NeedsReview,
    Error,
}

/// Full artifact for one `(sample, condition)` pair; appended exactly once
/// per pair to the run log.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub condition: Condition,
    pub sample_id: String,
    pub draft: TranslationText,
    #[serde(rename = "final")]
    pub final_text: TranslationText,
    pub issues: Vec<Issue>,
    pub hard_checks: Vec<HardCheckResult>,
    pub scores: RunScores,
    pub usage: Usage,
    pub timings: Timings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    pub normalized_constraints: Constraints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceInfo>,
    pub status: RunStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_caps_match_variants() {
        assert!(!Condition::A0.caps().has_state);
        assert!(!Condition::A0.caps().has_verify_repair);
        assert!(Condition::A1.caps().has_state);
        assert!(!Condition::A1.caps().has_verify_repair);
        assert!(!Condition::A2.caps().has_state);
        assert!(Condition::A2.caps().has_verify_repair);
        assert!(Condition::A3.caps().has_state);
        assert!(Condition::A3.caps().has_verify_repair);
    }

    #[test]
    fn issue_type_round_trips_wire_names() {
        let j = serde_json::to_string(&IssueType::TermInconsistency).expect("serialize");
        assert_eq!(j, r#""TERM_INCONSISTENCY""#);
        let back: IssueType = serde_json::from_str(r#""FORMAT_VIOLATION""#).expect("parse");
        assert_eq!(back, IssueType::FormatViolation);
        let unknown: IssueType = serde_json::from_str(r#""SOMETHING_NEW""#).expect("parse");
        assert_eq!(unknown, IssueType::Other);
    }

    #[test]
    fn status_serializes_snake_case() {
        let j = serde_json::to_string(&RunStatus::NeedsReview).expect("serialize");
        assert_eq!(j, r#""needs_review""#);
    }

    #[test]
    fn run_record_wire_keys_match_the_log_contract() {
        let record = RunRecord {
            run_id: "r1".into(),
            condition: Condition::A3,
            sample_id: "sc1:2".into(),
            draft: TranslationText { en: "draft".into() },
            final_text: TranslationText { en: "final".into() },
            issues: vec![Issue {
                id: "abc".into(),
                kind: IssueType::Omission,
                severity: Severity::Major,
                rationale: "dropped clause".into(),
                fix_suggestion: "add it back".into(),
                confidence: 0.7,
            }],
            hard_checks: vec![HardCheckResult {
                id: "noMetaTalk".into(),
                passed: true,
                description: "d".into(),
                details: None,
            }],
            scores: RunScores::default(),
            usage: Usage {
                prompt: 10,
                completion: 5,
                total: 15,
            },
            timings: Timings {
                stage_ms: StageMs {
                    state: Some(1),
                    translate: 2,
                    verify: 3,
                    repair: Some(4),
                    judge: 5,
                },
                total_ms: 15,
            },
            state: Some(State::default()),
            normalized_constraints: crate::constraints::normalize(
                &Default::default(),
                &Default::default(),
            )
            .expect("normalize"),
            trace: None,
            status: RunStatus::NeedsReview,
        };
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&record).expect("serialize"))
                .expect("reparse");

        assert_eq!(v["runId"], "r1");
        assert_eq!(v["condition"], "A3");
        assert_eq!(v["sampleId"], "sc1:2");
        assert_eq!(v["draft"]["en"], "draft");
        assert_eq!(v["final"]["en"], "final");
        assert_eq!(v["issues"][0]["type"], "OMISSION");
        assert_eq!(v["issues"][0]["severity"], "major");
        assert_eq!(v["issues"][0]["fixSuggestion"], "add it back");
        assert_eq!(v["hardChecks"][0]["id"], "noMetaTalk");
        assert_eq!(v["usage"]["total"], 15);
        assert_eq!(v["timings"]["stageMs"]["repair"], 4);
        assert_eq!(v["timings"]["totalMs"], 15);
        assert_eq!(v["normalizedConstraints"]["targetLang"], "en");
        assert_eq!(v["status"], "needs_review");
        assert!(v.get("trace").is_none());

        let back: RunRecord = serde_json::from_value(v).expect("deserialize");
        assert_eq!(back.sample_id, record.sample_id);
        assert_eq!(back.timings.stage_ms.state, Some(1));
    }
}
