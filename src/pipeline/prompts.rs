use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("var regex"));

/// Where a component's prompt comes from: exactly one of an inline
/// template, a file path, or a compiled-artifact reference.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptSource {
    pub template: Option<String>,
    pub file: Option<String>,
    pub artifact: Option<String>,
    pub artifact_field: Option<ArtifactField>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactField {
    SystemPrompt,
    UserPrompt,
    Template,
}

/// Compiled-prompt JSON produced by the offline optimizer.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptArtifact {
    pub name: Option<String>,
    pub system_prompt: Option<String>,
    pub user_prompt: Option<String>,
    pub template: Option<String>,
    pub few_shots: Vec<FewShot>,
    pub params: Option<ArtifactParams>,
    pub provenance: serde_json::Value,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FewShot {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArtifactParams {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedPrompt {
    pub system: Option<String>,
    pub template: Option<String>,
    pub few_shots: Vec<FewShot>,
    pub params: Option<ArtifactParams>,
    /// Provenance reference: `inline`, `file:<path>` or `artifact:<id>`.
    /// Artifact bodies are never recorded, only the reference.
    pub source: Option<String>,
}

/// Resolve a prompt source. File paths are taken relative to the config
/// file's directory; artifact ids are looked up in the `promptArtifacts`
/// map.
pub fn resolve(
    source: &PromptSource,
    config_dir: &Path,
    artifacts: &HashMap<String, String>,
) -> anyhow::Result<ResolvedPrompt> {
    let picks = [
        source.template.is_some(),
        source.file.is_some(),
        source.artifact.is_some(),
    ]
    .iter()
    .filter(|b| **b)
    .count();
    if picks != 1 {
        return Err(anyhow!(
            "prompt source must set exactly one of template, file, artifact"
        ));
    }

    if let Some(template) = source.template.as_ref() {
        return Ok(ResolvedPrompt {
            template: Some(template.clone()),
            source: Some("inline".to_string()),
            ..ResolvedPrompt::default()
        });
    }

    if let Some(file) = source.file.as_ref() {
        let path = join_config_dir(config_dir, file);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read prompt file: {}", path.display()))?;
        return Ok(ResolvedPrompt {
            template: Some(text),
            source: Some(format!("file:{file}")),
            ..ResolvedPrompt::default()
        });
    }

    let id = source.artifact.as_deref().expect("artifact source");
    let rel = artifacts
        .get(id)
        .ok_or_else(|| anyhow!("unknown prompt artifact: {id}"))?;
    let path = join_config_dir(config_dir, rel);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("read prompt artifact: {}", path.display()))?;
    let artifact: PromptArtifact = serde_json::from_str(&text)
        .with_context(|| format!("parse prompt artifact: {}", path.display()))?;

    let field = source.artifact_field.unwrap_or(ArtifactField::Template);
    let template = match field {
        ArtifactField::SystemPrompt => artifact.system_prompt.clone(),
        ArtifactField::UserPrompt => artifact.user_prompt.clone(),
        ArtifactField::Template => artifact
            .template
            .clone()
            .or_else(|| artifact.user_prompt.clone()),
    };
    Ok(ResolvedPrompt {
        system: artifact.system_prompt,
        template,
        few_shots: artifact.few_shots,
        params: artifact.params,
        source: Some(format!("artifact:{id}")),
    })
}

pub fn join_config_dir(config_dir: &Path, rel: &str) -> PathBuf {
    let p = PathBuf::from(rel);
    if p.is_absolute() {
        p
    } else {
        config_dir.join(p)
    }
}

/// Expand `{{ name }}` tokens from a variable map. Missing names render as
/// the empty string; there is no escaping, conditionals or iteration.
#[must_use]
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    VAR_RE
        .replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_string())
                .unwrap_or_default()
        })
        .into_owned()
}

pub const DEFAULT_TRANSLATE_SYSTEM: &str =
    "You are a professional Japanese-to-English translator for narrative fiction. \
You render dialogue, narration and sound effects faithfully and naturally.";

pub const DEFAULT_TRANSLATE_TEMPLATE: &str = r#"{{constraints}}

Preceding context:
{{context}}

Narrative state:
{{state}}

Translate the user's Japanese text into {{targetLang}}. Output ONLY the translation, nothing else."#;

pub const DEFAULT_STATE_TEMPLATE: &str = r#"Return STRICT JSON only (one JSON object).
Extract narrative facts from the utterance so a downstream translator can resolve speakers and implicature.

Schema:
{"utterance":"...","speaker":"...","addressee":"...","entities":[{"name":"...","desc":"..."}],"coreMeaning":"...","implicature":"..."}

CONTEXT:
{{context}}

UTTERANCE:
{{text}}"#;

pub const DEFAULT_VERIFY_TEMPLATE: &str = r#"You are a strict translation reviewer.
Return STRICT JSON only (one JSON object). List every defect in the candidate translation.

Schema:
{"issues":[{"id":"...","type":"MISTRANSLATION|OMISSION|ADDITION|TERM_INCONSISTENCY|PRONOUN_REFERENCE|SPEAKER_MISMATCH|STYLE_VIOLATION|FORMAT_VIOLATION|SAFETY_OR_POLICY|OTHER","severity":"critical|major|minor","rationale":"...","fixSuggestion":"...","confidence":0.0}]}

{{constraints}}

CONTEXT:
{{context}}

SOURCE (Japanese):
{{text}}

CANDIDATE TRANSLATION:
{{draft}}"#;

pub const DEFAULT_REPAIR_TEMPLATE: &str = r#"Fix the translation so every listed issue is resolved.
Return ONLY the fixed translation. Do not add new information.

SOURCE (Japanese):
{{source}}

CONTEXT:
{{context}}

CURRENT TRANSLATION:
{{current}}

ISSUES (JSON):
{{issues}}

CONSTRAINTS (JSON):
{{constraints}}

STATE (JSON):
{{state}}"#;

pub const DEFAULT_JUDGE_TEMPLATE: &str = r#"You are scoring a Japanese-to-English translation.
Return STRICT JSON only (one JSON object). Every score lies in [0,1].

Schema:
{"adequacy":0.0,"fluency":0.0,"constraintCompliance":0.0,"styleFit":0.0,"overall":0.0}

{{constraints}}

SOURCE (Japanese):
{{text}}

REFERENCE (may be empty):
{{reference}}

TRANSLATION UNDER REVIEW:
{{final}}"#;

/// Default prompt files written by `init-config`, one per component.
#[must_use]
pub fn default_prompt_files() -> Vec<(&'static str, &'static str)> {
    vec![
        ("translate.txt", DEFAULT_TRANSLATE_TEMPLATE),
        ("state.json.txt", DEFAULT_STATE_TEMPLATE),
        ("verify.json.txt", DEFAULT_VERIFY_TEMPLATE),
        ("repair.txt", DEFAULT_REPAIR_TEMPLATE),
        ("judge.json.txt", DEFAULT_JUDGE_TEMPLATE),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_variables_with_optional_whitespace() {
        let out = render_template("a {{x}} b {{ x }} c {{missing}} d", &[("x", "1")]);
        assert_eq!(out, "a 1 b 1 c  d");
    }

    #[test]
    fn template_without_placeholders_round_trips() {
        let tmpl = "no placeholders {here} at all";
        assert_eq!(render_template(tmpl, &[]), tmpl);
    }

    #[test]
    fn requires_exactly_one_source() {
        let err = resolve(
            &PromptSource::default(),
            Path::new("."),
            &HashMap::new(),
        );
        assert!(err.is_err());
        let both = PromptSource {
            template: Some("t".into()),
            file: Some("f".into()),
            ..PromptSource::default()
        };
        assert!(resolve(&both, Path::new("."), &HashMap::new()).is_err());
    }

    #[test]
    fn inline_template_resolves() {
        let src = PromptSource {
            template: Some("hello {{name}}".into()),
            ..PromptSource::default()
        };
        let r = resolve(&src, Path::new("."), &HashMap::new()).expect("resolve");
        assert_eq!(r.template.as_deref(), Some("hello {{name}}"));
        assert_eq!(r.source.as_deref(), Some("inline"));
    }

    #[test]
    fn artifact_resolves_fields_and_params() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("translator.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "name": "translator",
                "systemPrompt": "You are a careful JA-EN translator.",
                "template": "# Source\n{{text}}",
                "fewShots": [{"role": "user", "content": "例文"}],
                "params": {"temperature": 0.0, "maxOutputTokens": 800},
                "provenance": {"datasetSize": 2}
            })
            .to_string(),
        )
        .expect("write artifact");

        let mut artifacts = HashMap::new();
        artifacts.insert("translator".to_string(), "translator.json".to_string());
        let src = PromptSource {
            artifact: Some("translator".into()),
            ..PromptSource::default()
        };
        let r = resolve(&src, dir.path(), &artifacts).expect("resolve");
        assert_eq!(r.system.as_deref(), Some("You are a careful JA-EN translator."));
        assert_eq!(r.template.as_deref(), Some("# Source\n{{text}}"));
        assert_eq!(r.few_shots.len(), 1);
        assert_eq!(r.params.expect("params").max_output_tokens, Some(800));
        assert_eq!(r.source.as_deref(), Some("artifact:translator"));
    }

    #[test]
    fn artifact_field_selects_the_template() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.json");
        std::fs::write(
            &path,
            r#"{"systemPrompt":"sys","userPrompt":"usr","template":"tpl"}"#,
        )
        .expect("write artifact");
        let mut artifacts = HashMap::new();
        artifacts.insert("a".to_string(), "a.json".to_string());
        let src = PromptSource {
            artifact: Some("a".into()),
            artifact_field: Some(ArtifactField::UserPrompt),
            ..PromptSource::default()
        };
        let r = resolve(&src, dir.path(), &artifacts).expect("resolve");
        assert_eq!(r.template.as_deref(), Some("usr"));
    }
}
