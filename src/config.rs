use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::constraints::ConstraintsPatch;
use crate::hardcheck::HardCheckSettings;
use crate::llm::limiter::RateLimiter;
use crate::llm::openai::OpenAiProvider;
use crate::llm::{Gateway, ModelSpec, ProviderKind};
use crate::pipeline::judge::Judge;
use crate::pipeline::prompts::{self, PromptSource, ResolvedPrompt};
use crate::pipeline::repair::Repairer;
use crate::pipeline::runner::Runner;
use crate::pipeline::state::StateBuilder;
use crate::pipeline::trace::Tracer;
use crate::pipeline::translate::Translator;
use crate::pipeline::verify::Verifier;
use crate::pipeline::LlmComponent;
use crate::progress::ConsoleProgress;

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_MAX_REPAIRS: usize = 1;
pub const DEFAULT_JUDGE_RUNS: usize = 3;

/// The experiment configuration document, parsed from YAML or JSON.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub run_settings: RunSettingsSection,
    pub defaults: DefaultsSection,
    pub components: ComponentsSection,
    /// Artifact id -> compiled-prompt JSON path.
    pub prompt_artifacts: HashMap<String, String>,
    pub langfuse: LangfuseSection,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunSettingsSection {
    pub concurrency: Option<usize>,
    pub rpm: Option<u32>,
    pub tpm: Option<u32>,
    pub max_repairs: Option<usize>,
    pub judge_runs: Option<usize>,
    pub output_dir: Option<String>,
    pub cache_dir: Option<String>,
    pub resolved_prompt_dir: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DefaultsSection {
    pub constraints: ConstraintsPatch,
    pub hard_checks: HardChecksSection,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HardChecksSection {
    pub no_disallowed_japanese: Option<bool>,
    pub glossary_strict_matches: Option<bool>,
    pub no_meta_talk: Option<bool>,
    pub format_preserved: Option<bool>,
    pub max_length: Option<usize>,
}

impl HardChecksSection {
    #[must_use]
    pub fn settings(&self) -> HardCheckSettings {
        HardCheckSettings {
            no_disallowed_japanese: self.no_disallowed_japanese.unwrap_or(true),
            glossary_strict_matches: self.glossary_strict_matches.unwrap_or(true),
            no_meta_talk: self.no_meta_talk.unwrap_or(true),
            format_preserved: self.format_preserved.unwrap_or(true),
            max_length: self.max_length,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentsSection {
    pub translator: Option<ComponentConfig>,
    pub translator_with_state: Option<ComponentConfig>,
    pub state_builder: Option<ComponentConfig>,
    pub verifier: Option<ComponentConfig>,
    pub repairer: Option<ComponentConfig>,
    pub judge: Option<ComponentConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    pub model: ModelSpec,
    #[serde(default)]
    pub prompt: Option<PromptSource>,
    #[serde(default)]
    pub params: Option<ComponentParams>,
}

/// Sampling overrides applied on top of the model spec.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LangfuseSection {
    pub enabled: bool,
    pub base_url: Option<String>,
}

/// Effective run settings with defaults applied and directories resolved
/// relative to the config file's directory.
#[derive(Clone, Debug)]
pub struct ResolvedRunSettings {
    pub concurrency: usize,
    pub rpm: Option<u32>,
    pub tpm: Option<u32>,
    pub max_repairs: usize,
    pub judge_runs: usize,
    pub output_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub resolved_prompt_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let cfg: AppConfig = if is_json {
            serde_json::from_str(&text).context("parse config json")?
        } else {
            serde_yaml::from_str(&text).context("parse config yaml")?
        };
        Ok(cfg)
    }

    pub fn from_value(value: &serde_json::Value) -> anyhow::Result<Self> {
        serde_json::from_value(value.clone()).context("parse experiment config")
    }

    #[must_use]
    pub fn resolved_settings(&self, config_dir: &Path) -> ResolvedRunSettings {
        let rel = |p: &Option<String>| {
            p.as_deref()
                .map(|p| prompts::join_config_dir(config_dir, p))
        };
        ResolvedRunSettings {
            concurrency: self
                .run_settings
                .concurrency
                .unwrap_or(DEFAULT_CONCURRENCY)
                .max(1),
            rpm: self.run_settings.rpm,
            tpm: self.run_settings.tpm,
            max_repairs: self.run_settings.max_repairs.unwrap_or(DEFAULT_MAX_REPAIRS),
            judge_runs: self
                .run_settings
                .judge_runs
                .unwrap_or(DEFAULT_JUDGE_RUNS)
                .max(1),
            output_dir: rel(&self.run_settings.output_dir)
                .unwrap_or_else(|| config_dir.join("runs")),
            cache_dir: rel(&self.run_settings.cache_dir)
                .or_else(|| Some(config_dir.join("cache"))),
            resolved_prompt_dir: rel(&self.run_settings.resolved_prompt_dir),
        }
    }

    /// Build the orchestrator: one gateway (providers + cache + shared
    /// limiter) and every configured component with its resolved prompt.
    pub fn build_runner(&self, config_dir: &Path, run_id: String) -> anyhow::Result<Runner> {
        let settings = self.resolved_settings(config_dir);

        let needs_openai = [
            &self.components.translator,
            &self.components.translator_with_state,
            &self.components.state_builder,
            &self.components.verifier,
            &self.components.repairer,
            &self.components.judge,
        ]
        .iter()
        .any(|c| {
            c.as_ref()
                .is_some_and(|c| c.model.provider == ProviderKind::OpenAi)
        });
        let openai = if needs_openai {
            Some(OpenAiProvider::from_env(None).context("configure openai provider")?)
        } else {
            None
        };

        let limiter = Arc::new(RateLimiter::new(settings.rpm, settings.tpm));
        let gateway: Arc<Gateway> =
            Arc::new(Gateway::new(openai, settings.cache_dir.clone(), limiter));

        let component = |cfg: &Option<ComponentConfig>, name: &str| -> anyhow::Result<Option<LlmComponent>> {
            let Some(cfg) = cfg.as_ref() else {
                return Ok(None);
            };
            let prompt = match cfg.prompt.as_ref() {
                Some(source) => prompts::resolve(source, config_dir, &self.prompt_artifacts)
                    .with_context(|| format!("resolve {name} prompt"))?,
                None => ResolvedPrompt::default(),
            };
            let mut spec = cfg.model.clone();
            if let Some(params) = cfg.params {
                spec.temperature = params.temperature.or(spec.temperature);
                spec.top_p = params.top_p.or(spec.top_p);
                spec.max_output_tokens = params.max_output_tokens.or(spec.max_output_tokens);
            }
            Ok(Some(LlmComponent::new(
                Arc::clone(&gateway) as Arc<dyn crate::llm::ChatClient>,
                spec,
                prompt,
            )))
        };

        let translator = component(&self.components.translator, "translator")?
            .map(|llm| Translator { llm })
            .ok_or_else(|| anyhow!("components.translator is required"))?;
        let translator_with_state =
            component(&self.components.translator_with_state, "translatorWithState")?
                .map(|llm| Translator { llm });

        Ok(Runner {
            run_id,
            defaults: self.defaults.constraints.clone(),
            translator,
            translator_with_state,
            state_builder: StateBuilder {
                llm: component(&self.components.state_builder, "stateBuilder")?,
            },
            verifier: Verifier {
                llm: component(&self.components.verifier, "verifier")?,
                settings: self.defaults.hard_checks.settings(),
            },
            repairer: Repairer {
                llm: component(&self.components.repairer, "repairer")?,
            },
            judge: Judge {
                llm: component(&self.components.judge, "judge")?,
                runs: settings.judge_runs,
            },
            max_repairs: settings.max_repairs,
            concurrency: settings.concurrency,
            tracer: Tracer::new(self.langfuse.enabled),
            progress: ConsoleProgress::new(true),
        })
    }
}

pub const DEFAULT_CONFIG_FILENAME: &str = "scenebench.yaml";

const DEFAULT_CONFIG_TEXT: &str = r#"# scenebench experiment configuration
runSettings:
  concurrency: 2
  # rpm: 60
  # tpm: 90000
  maxRepairs: 1
  judgeRuns: 3
  outputDir: runs
  cacheDir: cache
  resolvedPromptDir: resolved-prompts

defaults:
  constraints:
    targetLang: en
  hardChecks:
    noDisallowedJapanese: true
    glossaryStrictMatches: true
    noMetaTalk: true
    formatPreserved: true
    # maxLength: 800

components:
  translator:
    model:
      provider: mock
      name: mock-small
      temperature: 0.2
    prompt:
      file: prompts/translate.txt
  verifier:
    model:
      provider: mock
      name: mock-small
    prompt:
      file: prompts/verify.json.txt
  repairer:
    model:
      provider: mock
      name: mock-small
    prompt:
      file: prompts/repair.txt
  judge:
    model:
      provider: mock
      name: mock-small
    prompt:
      file: prompts/judge.json.txt

langfuse:
  enabled: false
"#;

/// Write a starter config plus the default prompt files. Existing files are
/// left alone unless `force` is set.
pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let config_path = dir.join(DEFAULT_CONFIG_FILENAME);
    if config_path.exists() && !force {
        return Err(anyhow!(
            "config already exists: {} (pass --force to overwrite)",
            config_path.display()
        ));
    }
    std::fs::write(&config_path, DEFAULT_CONFIG_TEXT)
        .with_context(|| format!("write config: {}", config_path.display()))?;

    let prompts_dir = dir.join("prompts");
    std::fs::create_dir_all(&prompts_dir)
        .with_context(|| format!("create prompts dir: {}", prompts_dir.display()))?;
    for (name, text) in prompts::default_prompt_files() {
        let path = prompts_dir.join(name);
        if path.exists() && !force {
            continue;
        }
        std::fs::write(&path, text)
            .with_context(|| format!("write prompt: {}", path.display()))?;
    }
    Ok(config_path)
}
