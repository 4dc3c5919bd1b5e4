use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::constraints::ConstraintsPatch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Narration,
    Dialogue,
    Sfx,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Segment {
    /// Time index; segment order within a scene.
    pub t: i64,
    pub kind: SegmentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub text: String,
}

/// Source narrative unit as stored by the external scene store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub scene_id: String,
    #[serde(default = "default_lang_src")]
    pub lang_src: String,
    #[serde(default = "default_lang_tgt")]
    pub lang_tgt: String,
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub world_state: serde_json::Value,
    #[serde(default)]
    pub character_state: serde_json::Value,
    #[serde(default)]
    pub constraints: ConstraintsPatch,
    #[serde(default)]
    pub eval_targets: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_lang_src() -> String {
    "ja".to_string()
}

fn default_lang_tgt() -> String {
    "en".to_string()
}

/// One `(scene, segment)` pairing as presented to the pipeline.
#[derive(Clone, Debug)]
pub struct Sample {
    pub id: String,
    pub text: String,
    pub context: String,
    pub constraints: ConstraintsPatch,
    pub reference: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct DatasetRow {
    id: String,
    ja: JaField,
    #[serde(default)]
    constraints: ConstraintsPatch,
    #[serde(default)]
    reference: Option<ReferenceField>,
}

#[derive(Clone, Debug, Deserialize)]
struct JaField {
    text: String,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct ReferenceField {
    #[serde(default)]
    en: Option<String>,
}

/// Parse one dataset JSON object into a Sample.
pub fn parse_sample_json(text: &str) -> anyhow::Result<Sample> {
    let row: DatasetRow = serde_json::from_str(text.trim()).context("parse sample json")?;
    Ok(Sample {
        id: row.id,
        text: row.ja.text,
        context: row.ja.context.unwrap_or_default(),
        constraints: row.constraints,
        reference: row.reference.and_then(|r| r.en),
    })
}

/// Read a dataset JSONL file, one sample per non-blank line.
pub fn read_dataset(path: &Path) -> anyhow::Result<Vec<Sample>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open dataset: {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read dataset line {}", lineno + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(
            parse_sample_json(&line)
                .with_context(|| format!("parse dataset line {}", lineno + 1))?,
        );
    }
    Ok(out)
}

/// Fan a scene out into per-segment samples. Segments are ordered by `t`;
/// the context carries the last two preceding segments.
#[must_use]
pub fn expand_scene(scene: &Scene) -> Vec<Sample> {
    let mut segments: Vec<&Segment> = scene.segments.iter().collect();
    segments.sort_by_key(|s| s.t);

    let mut constraints = scene.constraints.clone();
    constraints.target_lang = Some(scene.lang_tgt.clone());

    segments
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            let context = segments[i.saturating_sub(2)..i]
                .iter()
                .map(|s| render_context_line(s))
                .collect::<Vec<String>>()
                .join("\n");
            Sample {
                id: format!("{}:{}", scene.scene_id, seg.t),
                text: seg.text.clone(),
                context,
                constraints: constraints.clone(),
                reference: None,
            }
        })
        .collect()
}

/// `"[kind] speaker: text"`; the kind prefix is dropped for dialogue and the
/// speaker prefix when the speaker is unknown.
fn render_context_line(seg: &Segment) -> String {
    let mut out = String::new();
    match seg.kind {
        SegmentKind::Dialogue => {}
        SegmentKind::Narration => out.push_str("[narration] "),
        SegmentKind::Sfx => out.push_str("[sfx] "),
    }
    if let Some(speaker) = seg.speaker.as_deref().filter(|s| !s.trim().is_empty()) {
        out.push_str(speaker);
        out.push_str(": ");
    }
    out.push_str(&seg.text);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene() -> Scene {
        serde_json::from_value(serde_json::json!({
            "sceneId": "sc1",
            "langTgt": "en",
            "segments": [
                {"t": 3, "kind": "dialogue", "speaker": "ミナ", "text": "行こう。"},
                {"t": 1, "kind": "narration", "text": "夜が明けた。"},
                {"t": 2, "kind": "sfx", "text": "ガタン"}
            ]
        }))
        .expect("scene json")
    }

    #[test]
    fn expansion_sorts_by_t_and_builds_ids() {
        let samples = expand_scene(&scene());
        let ids: Vec<&str> = samples.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["sc1:1", "sc1:2", "sc1:3"]);
        assert_eq!(samples[0].constraints.target_lang.as_deref(), Some("en"));
    }

    #[test]
    fn context_keeps_last_two_segments() {
        let samples = expand_scene(&scene());
        assert_eq!(samples[0].context, "");
        assert_eq!(samples[1].context, "[narration] 夜が明けた。");
        assert_eq!(samples[2].context, "[narration] 夜が明けた。\n[sfx] ガタン");
    }

    #[test]
    fn dialogue_drops_kind_and_unknown_speaker_drops_prefix() {
        let seg = Segment {
            t: 1,
            kind: SegmentKind::Dialogue,
            speaker: Some("ミナ".into()),
            text: "行こう。".into(),
        };
        assert_eq!(render_context_line(&seg), "ミナ: 行こう。");
        let seg = Segment {
            t: 1,
            kind: SegmentKind::Dialogue,
            speaker: None,
            text: "行こう。".into(),
        };
        assert_eq!(render_context_line(&seg), "行こう。");
    }

    #[test]
    fn dataset_rows_parse_optional_fields() {
        let line = r#"{"id":"s1","ja":{"text":"こんにちは、世界。"},"reference":{"en":"Hello, world."}}"#;
        let row: DatasetRow = serde_json::from_str(line).expect("row");
        assert_eq!(row.id, "s1");
        assert_eq!(row.reference.and_then(|r| r.en).as_deref(), Some("Hello, world."));
    }
}
