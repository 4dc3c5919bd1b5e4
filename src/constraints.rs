use anyhow::anyhow;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub ja: String,
    pub en: String,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatRules {
    #[serde(default)]
    pub keep_line_breaks: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chars: Option<i64>,
    #[serde(default)]
    pub no_extra_prefix_suffix: bool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormatPatch {
    pub keep_line_breaks: Option<bool>,
    pub max_chars: Option<i64>,
    pub no_extra_prefix_suffix: Option<bool>,
}

/// Partial constraint record as it appears in config defaults, scenes and
/// dataset rows. Merging happens in [`normalize`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConstraintsPatch {
    pub target_lang: Option<String>,
    pub tone: Option<String>,
    pub register: Option<String>,
    pub reading_level: Option<String>,
    pub format: Option<FormatPatch>,
    pub glossary: Vec<GlossaryEntry>,
    pub banned_patterns: Vec<String>,
    pub allow_japanese_tokens: Vec<String>,
}

/// Fully populated constraint record; every sample gets exactly one.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    pub target_lang: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reading_level: Option<String>,
    pub format: FormatRules,
    #[serde(default)]
    pub glossary: Vec<GlossaryEntry>,
    #[serde(default)]
    pub banned_patterns: Vec<String>,
    #[serde(default)]
    pub allow_japanese_tokens: Vec<String>,
}

/// Merge defaults with a per-sample patch. Scalars: sample wins. `format`:
/// shallow merge. Lists: defaults first, sample second, duplicates kept.
pub fn normalize(
    defaults: &ConstraintsPatch,
    sample: &ConstraintsPatch,
) -> anyhow::Result<Constraints> {
    let pick = |a: &Option<String>, b: &Option<String>| b.clone().or_else(|| a.clone());

    let df = defaults.format.unwrap_or_default();
    let sf = sample.format.unwrap_or_default();
    let format = FormatRules {
        keep_line_breaks: sf.keep_line_breaks.or(df.keep_line_breaks).unwrap_or(false),
        max_chars: sf.max_chars.or(df.max_chars),
        no_extra_prefix_suffix: sf
            .no_extra_prefix_suffix
            .or(df.no_extra_prefix_suffix)
            .unwrap_or(false),
    };

    let mut glossary = defaults.glossary.clone();
    glossary.extend(sample.glossary.iter().cloned());
    let mut banned_patterns = defaults.banned_patterns.clone();
    banned_patterns.extend(sample.banned_patterns.iter().cloned());
    let mut allow_japanese_tokens = defaults.allow_japanese_tokens.clone();
    allow_japanese_tokens.extend(sample.allow_japanese_tokens.iter().cloned());

    let out = Constraints {
        target_lang: pick(&defaults.target_lang, &sample.target_lang)
            .unwrap_or_else(|| "en".to_string()),
        tone: pick(&defaults.tone, &sample.tone),
        register: pick(&defaults.register, &sample.register),
        reading_level: pick(&defaults.reading_level, &sample.reading_level),
        format,
        glossary,
        banned_patterns,
        allow_japanese_tokens,
    };
    validate(&out)?;
    Ok(out)
}

fn validate(c: &Constraints) -> anyhow::Result<()> {
    if let Some(n) = c.format.max_chars {
        if n < 0 {
            return Err(anyhow!("invalid_max_chars: {n}"));
        }
    }
    for pat in &c.banned_patterns {
        RegexBuilder::new(pat)
            .case_insensitive(true)
            .build()
            .map_err(|err| anyhow!("invalid_banned_pattern: {pat}: {err}"))?;
    }
    Ok(())
}

impl Constraints {
    /// Canonical markdown form used in translator prompts. One field per
    /// line; unset optionals are omitted.
    #[must_use]
    pub fn render_block(&self) -> String {
        let mut out = String::new();
        out.push_str("Constraints:\n");
        out.push_str(&format!("- targetLang: {}\n", self.target_lang));
        if let Some(tone) = self.tone.as_deref() {
            out.push_str(&format!("- tone: {tone}\n"));
        }
        if let Some(register) = self.register.as_deref() {
            out.push_str(&format!("- register: {register}\n"));
        }
        if let Some(level) = self.reading_level.as_deref() {
            out.push_str(&format!("- readingLevel: {level}\n"));
        }
        if self.format.keep_line_breaks {
            out.push_str("- keepLineBreaks: true\n");
        }
        if let Some(n) = self.format.max_chars {
            out.push_str(&format!("- maxChars: {n}\n"));
        }
        if self.format.no_extra_prefix_suffix {
            out.push_str("- noExtraPrefixSuffix: true\n");
        }
        if !self.glossary.is_empty() {
            out.push_str("- glossary (translate consistently):\n");
            for g in &self.glossary {
                out.push_str(&format!("  - {} => {}", g.ja, g.en));
                if g.strict {
                    out.push_str(" (required)");
                }
                out.push('\n');
            }
        }
        if !self.banned_patterns.is_empty() {
            out.push_str("- banned patterns (never emit):\n");
            for p in &self.banned_patterns {
                out.push_str(&format!("  - {p}\n"));
            }
        }
        if !self.allow_japanese_tokens.is_empty() {
            out.push_str(&format!(
                "- allowed Japanese tokens: {}\n",
                self.allow_japanese_tokens.join(", ")
            ));
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch() -> ConstraintsPatch {
        ConstraintsPatch::default()
    }

    #[test]
    fn sample_scalar_overrides_default() {
        let defaults = ConstraintsPatch {
            tone: Some("formal".into()),
            register: Some("polite".into()),
            ..patch()
        };
        let sample = ConstraintsPatch {
            tone: Some("casual".into()),
            ..patch()
        };
        let c = normalize(&defaults, &sample).expect("normalize");
        assert_eq!(c.tone.as_deref(), Some("casual"));
        assert_eq!(c.register.as_deref(), Some("polite"));
        assert_eq!(c.target_lang, "en");
    }

    #[test]
    fn format_is_shallow_merged() {
        let defaults = ConstraintsPatch {
            format: Some(FormatPatch {
                keep_line_breaks: Some(true),
                max_chars: Some(200),
                no_extra_prefix_suffix: None,
            }),
            ..patch()
        };
        let sample = ConstraintsPatch {
            format: Some(FormatPatch {
                max_chars: Some(80),
                ..FormatPatch::default()
            }),
            ..patch()
        };
        let c = normalize(&defaults, &sample).expect("normalize");
        assert!(c.format.keep_line_breaks);
        assert_eq!(c.format.max_chars, Some(80));
    }

    #[test]
    fn lists_concatenate_defaults_first() {
        let defaults = ConstraintsPatch {
            glossary: vec![GlossaryEntry {
                ja: "鍵".into(),
                en: "Key".into(),
                strict: true,
            }],
            banned_patterns: vec!["foo".into()],
            ..patch()
        };
        let sample = ConstraintsPatch {
            glossary: vec![GlossaryEntry {
                ja: "鍵".into(),
                en: "Key".into(),
                strict: true,
            }],
            banned_patterns: vec!["bar".into()],
            ..patch()
        };
        let c = normalize(&defaults, &sample).expect("normalize");
        assert_eq!(c.glossary.len(), 2);
        assert_eq!(c.banned_patterns, vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn rejects_negative_max_chars_and_bad_regex() {
        let sample = ConstraintsPatch {
            format: Some(FormatPatch {
                max_chars: Some(-1),
                ..FormatPatch::default()
            }),
            ..patch()
        };
        assert!(normalize(&patch(), &sample).is_err());

        let sample = ConstraintsPatch {
            banned_patterns: vec!["([unclosed".into()],
            ..patch()
        };
        assert!(normalize(&patch(), &sample).is_err());
    }
}
