use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::dataset::Scene;
use crate::experiment::{Experiment, ExperimentStatus};
use crate::record::{Condition, RunRecord};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SceneFilter {
    pub split: Option<String>,
    pub scene_ids: Vec<String>,
    pub tags: Vec<String>,
}

impl SceneFilter {
    #[must_use]
    pub fn matches(&self, scene: &Scene) -> bool {
        if let Some(split) = self.split.as_deref() {
            if scene.split.as_deref() != Some(split) {
                return false;
            }
        }
        if !self.scene_ids.is_empty() && !self.scene_ids.contains(&scene.scene_id) {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| scene.tags.contains(t)) {
            return false;
        }
        true
    }
}

/// The CRUD and batch-query surface the engine consumes from the external
/// relational store. The engine treats implementations as opaque handles and
/// assumes per-row serialization only.
pub trait RunStore: Send + Sync {
    fn list_scenes(&self, filter: &SceneFilter) -> anyhow::Result<Vec<Scene>>;
    /// Idempotent by `(runId, sampleId, condition)`.
    fn append_run(&self, record: &RunRecord) -> anyhow::Result<()>;
    fn set_experiment_status(&self, id: &str, status: ExperimentStatus) -> anyhow::Result<()>;
    fn get_experiment(&self, id: &str) -> anyhow::Result<Experiment>;
    fn list_runs(&self, experiment_id: &str) -> anyhow::Result<Vec<RunRecord>>;
    fn delete_runs_for_experiment(&self, experiment_id: &str) -> anyhow::Result<()>;
}

/// In-process store used by tests and as a default sink target. Runs are
/// associated to an experiment through their run id.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    scenes: Vec<Scene>,
    experiments: HashMap<String, Experiment>,
    runs: HashMap<(String, String, Condition), RunRecord>,
}

impl MemoryStore {
    pub fn add_scene(&self, scene: Scene) {
        self.inner.lock().expect("store mutex").scenes.push(scene);
    }

    pub fn put_experiment(&self, experiment: Experiment) {
        self.inner
            .lock()
            .expect("store mutex")
            .experiments
            .insert(experiment.id.clone(), experiment);
    }

    /// Deleting an experiment cascades to its runs.
    pub fn delete_experiment(&self, id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner.experiments.remove(id);
        inner.runs.retain(|(run_id, _, _), _| run_id != id);
        Ok(())
    }
}

impl RunStore for MemoryStore {
    fn list_scenes(&self, filter: &SceneFilter) -> anyhow::Result<Vec<Scene>> {
        let inner = self.inner.lock().expect("store mutex");
        Ok(inner
            .scenes
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    fn append_run(&self, record: &RunRecord) -> anyhow::Result<()> {
        let key = (
            record.run_id.clone(),
            record.sample_id.clone(),
            record.condition,
        );
        self.inner
            .lock()
            .expect("store mutex")
            .runs
            .insert(key, record.clone());
        Ok(())
    }

    fn set_experiment_status(&self, id: &str, status: ExperimentStatus) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store mutex");
        let experiment = inner
            .experiments
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown experiment: {id}"))?;
        experiment.status = status;
        Ok(())
    }

    fn get_experiment(&self, id: &str) -> anyhow::Result<Experiment> {
        let inner = self.inner.lock().expect("store mutex");
        inner
            .experiments
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown experiment: {id}"))
    }

    fn list_runs(&self, experiment_id: &str) -> anyhow::Result<Vec<RunRecord>> {
        let inner = self.inner.lock().expect("store mutex");
        let mut out: Vec<RunRecord> = inner
            .runs
            .iter()
            .filter(|((run_id, _, _), _)| run_id == experiment_id)
            .map(|(_, r)| r.clone())
            .collect();
        out.sort_by(|a, b| {
            a.sample_id
                .cmp(&b.sample_id)
                .then_with(|| a.condition.as_str().cmp(b.condition.as_str()))
        });
        Ok(out)
    }

    fn delete_runs_for_experiment(&self, experiment_id: &str) -> anyhow::Result<()> {
        self.inner
            .lock()
            .expect("store mutex")
            .runs
            .retain(|(run_id, _, _), _| run_id != experiment_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene(id: &str, split: Option<&str>, tags: &[&str]) -> Scene {
        serde_json::from_value(serde_json::json!({
            "sceneId": id,
            "segments": [],
            "split": split,
            "tags": tags,
        }))
        .expect("scene")
    }

    #[test]
    fn filter_matches_split_ids_and_tags() {
        let store = MemoryStore::default();
        store.add_scene(scene("a", Some("dev"), &["fantasy"]));
        store.add_scene(scene("b", Some("test"), &["slice"]));

        let by_split = store
            .list_scenes(&SceneFilter {
                split: Some("dev".into()),
                ..SceneFilter::default()
            })
            .expect("list");
        assert_eq!(by_split.len(), 1);
        assert_eq!(by_split[0].scene_id, "a");

        let by_tag = store
            .list_scenes(&SceneFilter {
                tags: vec!["slice".into()],
                ..SceneFilter::default()
            })
            .expect("list");
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].scene_id, "b");

        let by_id = store
            .list_scenes(&SceneFilter {
                scene_ids: vec!["a".into()],
                ..SceneFilter::default()
            })
            .expect("list");
        assert_eq!(by_id.len(), 1);
    }

    #[test]
    fn append_run_is_idempotent_per_triple() {
        use crate::record::{
            Condition, RunRecord, RunScores, RunStatus, Timings, TranslationText, Usage,
        };

        let record = |en: &str| RunRecord {
            run_id: "exp1".into(),
            condition: Condition::A0,
            sample_id: "sc1:1".into(),
            draft: TranslationText::default(),
            final_text: TranslationText { en: en.into() },
            issues: vec![],
            hard_checks: vec![],
            scores: RunScores::default(),
            usage: Usage::default(),
            timings: Timings::default(),
            state: None,
            normalized_constraints: crate::constraints::normalize(
                &Default::default(),
                &Default::default(),
            )
            .expect("normalize"),
            trace: None,
            status: RunStatus::Ok,
        };

        let store = MemoryStore::default();
        store.append_run(&record("first")).expect("append");
        store.append_run(&record("second")).expect("append");
        let runs = store.list_runs("exp1").expect("list");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].final_text.en, "second");

        store.delete_runs_for_experiment("exp1").expect("delete");
        assert!(store.list_runs("exp1").expect("list").is_empty());
    }
}
