use once_cell::sync::Lazy;
use regex::Regex;

use crate::constraints::Constraints;
use crate::record::{HardCheckResult, Issue, IssueType, Severity};

static META_TALK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)as an ai").expect("meta talk regex"));

/// Which deterministic rules run, plus the global length cap. All rules
/// default to enabled.
#[derive(Clone, Copy, Debug)]
pub struct HardCheckSettings {
    pub no_disallowed_japanese: bool,
    pub glossary_strict_matches: bool,
    pub no_meta_talk: bool,
    pub format_preserved: bool,
    pub max_length: Option<usize>,
}

impl Default for HardCheckSettings {
    fn default() -> Self {
        Self {
            no_disallowed_japanese: true,
            glossary_strict_matches: true,
            no_meta_talk: true,
            format_preserved: true,
            max_length: None,
        }
    }
}

/// Evaluate every enabled rule against a candidate translation. Results keep
/// a stable order; failures never abort evaluation.
#[must_use]
pub fn run_hard_checks(
    source: &str,
    translation: &str,
    constraints: &Constraints,
    settings: &HardCheckSettings,
) -> Vec<HardCheckResult> {
    let mut out = Vec::new();

    if settings.no_disallowed_japanese {
        let offending: Vec<&str> = translation
            .split_whitespace()
            .filter(|tok| {
                tok.chars().any(is_japanese_char)
                    && !constraints.allow_japanese_tokens.iter().any(|a| a == tok)
            })
            .collect();
        out.push(HardCheckResult {
            id: "noDisallowedJapanese".to_string(),
            passed: offending.is_empty(),
            description: "translation contains no Japanese tokens outside the allow list"
                .to_string(),
            details: if offending.is_empty() {
                None
            } else {
                Some(format!("offending tokens: {}", offending.join(", ")))
            },
        });
    }

    if settings.glossary_strict_matches {
        let missing: Vec<&str> = constraints
            .glossary
            .iter()
            .filter(|g| g.strict && !translation.contains(g.en.as_str()))
            .map(|g| g.en.as_str())
            .collect();
        out.push(HardCheckResult {
            id: "glossaryStrictMatches".to_string(),
            passed: missing.is_empty(),
            description: "every strict glossary target appears in the translation".to_string(),
            details: if missing.is_empty() {
                None
            } else {
                Some(format!("missing: {}", missing.join(", ")))
            },
        });
    }

    // Effective cap is the tighter of the per-sample and global bounds.
    let bound = match (constraints.format.max_chars, settings.max_length) {
        (Some(a), Some(b)) => Some((a.max(0) as usize).min(b)),
        (Some(a), None) => Some(a.max(0) as usize),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    if let Some(bound) = bound {
        let len = translation.chars().count();
        out.push(HardCheckResult {
            id: "maxLength".to_string(),
            passed: len <= bound,
            description: format!("translation length within {bound} chars"),
            details: if len <= bound {
                None
            } else {
                Some(format!("length {len} exceeds {bound}"))
            },
        });
    }

    if settings.no_meta_talk {
        let hit = META_TALK_RE.is_match(translation);
        out.push(HardCheckResult {
            id: "noMetaTalk".to_string(),
            passed: !hit,
            description: "translation contains no assistant meta-talk".to_string(),
            details: hit.then(|| "matched: as an ai".to_string()),
        });
    }

    if settings.format_preserved && constraints.format.keep_line_breaks {
        let src = source.matches('\n').count();
        let tgt = translation.matches('\n').count();
        out.push(HardCheckResult {
            id: "formatPreserved".to_string(),
            passed: src == tgt,
            description: "line break count matches the source".to_string(),
            details: (src != tgt).then(|| format!("source {src} breaks, translation {tgt}")),
        });
    }

    out
}

/// One synthesized Issue per failing rule.
#[must_use]
pub fn issues_from_hard_checks(checks: &[HardCheckResult]) -> Vec<Issue> {
    checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| {
            let kind = if c.id == "formatPreserved" {
                IssueType::FormatViolation
            } else {
                IssueType::StyleViolation
            };
            let severity = if c.id == "noDisallowedJapanese" {
                Severity::Major
            } else {
                Severity::Minor
            };
            Issue {
                id: format!("hc-{}", c.id),
                kind,
                severity,
                rationale: c.description.clone(),
                fix_suggestion: "Rewrite the translation so the failed rule passes.".to_string(),
                confidence: 0.8,
            }
        })
        .collect()
}

fn is_japanese_char(ch: char) -> bool {
    let u = ch as u32;
    // Hiragana, Katakana (incl. phonetic extensions), CJK Unified Ideographs.
    (0x3040..=0x309F).contains(&u)
        || (0x30A0..=0x30FF).contains(&u)
        || (0x31F0..=0x31FF).contains(&u)
        || (0x3400..=0x4DBF).contains(&u)
        || (0x4E00..=0x9FFF).contains(&u)
        || (0xF900..=0xFAFF).contains(&u)
        || (0x20000..=0x2A6DF).contains(&u)
}
