use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::dataset::{expand_scene, Sample};
use crate::record::Condition;
use crate::sink::{JsonlWriter, StoreSink};
use crate::store::{RunStore, SceneFilter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Completed,
    Failed,
}

/// A run plan over stored scenes. The config document is kept raw and
/// parsed at start time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub config: serde_json::Value,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub scene_filter: SceneFilter,
    pub status: ExperimentStatus,
}

/// Typed start failure carrying an HTTP-style status hint. Stored state is
/// untouched when validation fails.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("experiment is not in draft status")]
    NotDraft,
    #[error("conditions must be a non-empty subset of A0..A3")]
    BadConditions,
    #[error("config: {0}")]
    BadConfig(String),
    #[error("scene filter matched no scenes")]
    EmptyScenes,
    #[error("sample expansion produced no samples")]
    EmptySamples,
    #[error("store: {0}")]
    Store(String),
}

impl StartError {
    #[must_use]
    pub fn status_hint(&self) -> u16 {
        match self {
            StartError::NotDraft => 409,
            StartError::BadConditions => 400,
            StartError::BadConfig(_) | StartError::EmptyScenes | StartError::EmptySamples => 422,
            StartError::Store(_) => 500,
        }
    }
}

/// Handle to a launched experiment; the run proceeds on a background
/// thread. Cancellation is cooperative and is not a failure.
pub struct ExperimentHandle {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ExperimentHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

/// Validate and launch. Output goes to `<outputDir>/<experiment id>.jsonl`;
/// each record is also fed to the store through the bounded sink.
pub fn start_experiment(
    store: Arc<dyn RunStore>,
    experiment: &Experiment,
    config_dir: PathBuf,
) -> Result<ExperimentHandle, StartError> {
    if experiment.status != ExperimentStatus::Draft {
        return Err(StartError::NotDraft);
    }
    let mut conditions: Vec<Condition> = Vec::new();
    for &c in &experiment.conditions {
        if !conditions.contains(&c) {
            conditions.push(c);
        }
    }
    if conditions.is_empty() {
        return Err(StartError::BadConditions);
    }
    let config = AppConfig::from_value(&experiment.config)
        .map_err(|err| StartError::BadConfig(format!("{err:#}")))?;

    let scenes = store
        .list_scenes(&experiment.scene_filter)
        .map_err(|err| StartError::Store(format!("{err:#}")))?;
    if scenes.is_empty() {
        return Err(StartError::EmptyScenes);
    }
    let samples: Vec<Sample> = scenes.iter().flat_map(expand_scene).collect();
    if samples.is_empty() {
        return Err(StartError::EmptySamples);
    }

    store
        .set_experiment_status(&experiment.id, ExperimentStatus::Running)
        .map_err(|err| StartError::Store(format!("{err:#}")))?;

    let cancel = Arc::new(AtomicBool::new(false));
    let handle = {
        let cancel = Arc::clone(&cancel);
        let store = Arc::clone(&store);
        let experiment_id = experiment.id.clone();
        std::thread::spawn(move || {
            let result = execute(&config, &config_dir, &experiment_id, samples, &conditions, &store, &cancel);
            let status = match result {
                Ok(()) => ExperimentStatus::Completed,
                Err(err) => {
                    tracing::error!(experiment = %experiment_id, "experiment failed: {err:#}");
                    ExperimentStatus::Failed
                }
            };
            if let Err(err) = store.set_experiment_status(&experiment_id, status) {
                tracing::warn!(experiment = %experiment_id, "status update failed: {err:#}");
            }
        })
    };
    Ok(ExperimentHandle { cancel, handle })
}

fn execute(
    config: &AppConfig,
    config_dir: &std::path::Path,
    experiment_id: &str,
    samples: Vec<Sample>,
    conditions: &[Condition],
    store: &Arc<dyn RunStore>,
    cancel: &AtomicBool,
) -> anyhow::Result<()> {
    let settings = config.resolved_settings(config_dir);
    let runner = config.build_runner(config_dir, experiment_id.to_string())?;

    let dump = crate::pipeline::trace::PromptDump::new(
        settings.resolved_prompt_dir.clone(),
        experiment_id,
    );
    runner.dump_prompts(&dump)?;

    let output = settings.output_dir.join(format!("{experiment_id}.jsonl"));
    let writer = JsonlWriter::create(&output, true)?;
    let sink = StoreSink::spawn(Arc::clone(store));

    let outcome = runner.run(&samples, conditions, &writer, Some(&sink), cancel);
    sink.finish();
    let written = writer.finish()?;
    let outcome = outcome?;
    tracing::info!(
        experiment = %experiment_id,
        written,
        cancelled = outcome.cancelled,
        "experiment finished"
    );
    Ok(())
}

/// Cascade an experiment deletion to its runs. The experiment row itself
/// belongs to the external store's surface.
pub fn delete_experiment_runs(store: &dyn RunStore, experiment_id: &str) -> anyhow::Result<()> {
    store.delete_runs_for_experiment(experiment_id)
}
