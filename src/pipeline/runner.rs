use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::constraints::{normalize, Constraints, ConstraintsPatch};
use crate::dataset::Sample;
use crate::llm::cache::sha256_hex;
use crate::progress::ConsoleProgress;
use crate::record::{
    Condition, Issue, IssueType, RunRecord, RunScores, RunStatus, Severity, StageMs, State,
    Timings, TranslationText, Usage,
};
use crate::sink::{JsonlWriter, StoreSink};

use super::judge::Judge;
use super::repair::Repairer;
use super::state::StateBuilder;
use super::trace::{PromptDump, Tracer};
use super::translate::Translator;
use super::verify::{Verification, Verifier};

/// Drives every `(sample, condition)` pair through the five-stage flow with
/// a bounded worker pool. Emission order is unconstrained; the final set of
/// log lines equals `samples x conditions`.
pub struct Runner {
    pub run_id: String,
    pub defaults: ConstraintsPatch,
    pub translator: Translator,
    pub translator_with_state: Option<Translator>,
    pub state_builder: StateBuilder,
    pub verifier: Verifier,
    pub repairer: Repairer,
    pub judge: Judge,
    pub max_repairs: usize,
    pub concurrency: usize,
    pub tracer: Tracer,
    pub progress: ConsoleProgress,
}

pub struct RunOutcome {
    pub written: usize,
    pub cancelled: bool,
}

impl Runner {
    /// Run the full pair matrix, streaming records to the JSONL writer and
    /// the optional store sink. Cancellation is cooperative: checked before
    /// each pair is admitted; in-flight pairs complete and are written.
    pub fn run(
        &self,
        samples: &[Sample],
        conditions: &[Condition],
        writer: &JsonlWriter,
        store_sink: Option<&StoreSink>,
        cancel: &AtomicBool,
    ) -> anyhow::Result<RunOutcome> {
        let mut queue: VecDeque<(usize, Condition)> = VecDeque::new();
        for (i, _) in samples.iter().enumerate() {
            for &c in conditions {
                queue.push_back((i, c));
            }
        }
        let total = queue.len();
        let jobs = Mutex::new(queue);
        let sink_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..self.concurrency.max(1) {
                scope.spawn(|| loop {
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    let job = jobs.lock().expect("job queue mutex").pop_front();
                    let Some((idx, condition)) = job else {
                        break;
                    };
                    let sample = &samples[idx];
                    let record = self.run_pair(sample, condition);
                    if let Err(err) = writer.append(&record) {
                        let mut slot = sink_error.lock().expect("sink error mutex");
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                        cancel.store(true, Ordering::SeqCst);
                        break;
                    }
                    if let Some(sink) = store_sink {
                        sink.push(record);
                    }
                    self.progress.tick("pairs", total);
                });
            }
        });

        if let Some(err) = sink_error.lock().expect("sink error mutex").take() {
            return Err(err);
        }
        let leftover = jobs.lock().expect("job queue mutex").len();
        Ok(RunOutcome {
            written: total - leftover,
            cancelled: leftover > 0,
        })
    }

    /// One pair, never panics outward: unexpected failures become a record
    /// with status `error` so no pair is silently lost.
    pub fn run_pair(&self, sample: &Sample, condition: Condition) -> RunRecord {
        let started = Instant::now();
        match self.try_run_pair(sample, condition, started) {
            Ok(record) => record,
            Err(err) => {
                tracing::error!(
                    sample = %sample.id,
                    condition = condition.as_str(),
                    "pair failed: {err:#}"
                );
                self.error_record(sample, condition, &err, started)
            }
        }
    }

    fn try_run_pair(
        &self,
        sample: &Sample,
        condition: Condition,
        started: Instant,
    ) -> anyhow::Result<RunRecord> {
        let caps = condition.caps();
        let mut usage = Usage::default();
        let mut stage_ms = StageMs::default();
        let mut trace = self
            .tracer
            .start(format!("{}:{}:{}", self.run_id, sample.id, condition.as_str()));

        let constraints = normalize(&self.defaults, &sample.constraints)?;

        let state: Option<State> = if caps.has_state {
            let t = Instant::now();
            let (state, u) = self.state_builder.build(sample);
            usage.add(u);
            stage_ms.state = Some(t.elapsed().as_millis() as u64);
            if let Some(rec) = trace.as_mut() {
                rec.record("state", t);
            }
            Some(state)
        } else {
            None
        };

        let translator = if caps.has_state {
            self.translator_with_state.as_ref().unwrap_or(&self.translator)
        } else {
            &self.translator
        };
        let t = Instant::now();
        let (draft, u) = translator.translate(sample, &constraints, state.as_ref())?;
        usage.add(u);
        stage_ms.translate = t.elapsed().as_millis() as u64;
        if let Some(rec) = trace.as_mut() {
            rec.record("translate", t);
        }

        let mut current = draft.clone();
        let t = Instant::now();
        let mut verification = self.verifier.verify(sample, &constraints, &current);
        usage.add(verification.usage);
        stage_ms.verify = t.elapsed().as_millis() as u64;
        if let Some(rec) = trace.as_mut() {
            rec.record("verify", t);
        }

        if caps.has_verify_repair {
            for _ in 0..self.max_repairs {
                if verification.clean() {
                    break;
                }
                let t = Instant::now();
                let (fixed, u) = self.repairer.repair(
                    sample,
                    &constraints,
                    &current,
                    &verification.issues,
                    state.as_ref(),
                )?;
                usage.add(u);
                stage_ms.repair =
                    Some(stage_ms.repair.unwrap_or(0) + t.elapsed().as_millis() as u64);
                if let Some(rec) = trace.as_mut() {
                    rec.record("repair", t);
                }
                current = fixed;

                let t = Instant::now();
                verification = self.verifier.verify(sample, &constraints, &current);
                usage.add(verification.usage);
                stage_ms.verify += t.elapsed().as_millis() as u64;
                if let Some(rec) = trace.as_mut() {
                    rec.record("verify", t);
                }
            }
        }

        let t = Instant::now();
        let (judge_scores, u) = self.judge.judge(sample, &constraints, &current);
        usage.add(u);
        stage_ms.judge = t.elapsed().as_millis() as u64;
        if let Some(rec) = trace.as_mut() {
            rec.record("judge", t);
        }

        let status = if verification.clean() {
            RunStatus::Ok
        } else {
            RunStatus::NeedsReview
        };
        Ok(self.assemble(
            sample,
            condition,
            draft,
            current,
            verification,
            judge_scores,
            state,
            constraints,
            usage,
            stage_ms,
            started,
            trace.map(super::trace::TraceRecorder::finish),
            status,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        sample: &Sample,
        condition: Condition,
        draft: String,
        current: String,
        verification: Verification,
        judge_scores: crate::record::ScoreBreakdown,
        state: Option<State>,
        constraints: Constraints,
        usage: Usage,
        stage_ms: StageMs,
        started: Instant,
        trace: Option<crate::record::TraceInfo>,
        status: RunStatus,
    ) -> RunRecord {
        RunRecord {
            run_id: self.run_id.clone(),
            condition,
            sample_id: sample.id.clone(),
            draft: TranslationText { en: draft },
            final_text: TranslationText { en: current },
            issues: verification.issues,
            hard_checks: verification.hard_checks,
            scores: RunScores {
                overall: judge_scores.overall,
                judge: judge_scores,
            },
            usage,
            timings: Timings {
                stage_ms,
                total_ms: started.elapsed().as_millis() as u64,
            },
            state,
            normalized_constraints: constraints,
            trace,
            status,
        }
    }

    fn error_record(
        &self,
        sample: &Sample,
        condition: Condition,
        err: &anyhow::Error,
        started: Instant,
    ) -> RunRecord {
        let rationale = format!("{err:#}");
        let issue = Issue {
            id: sha256_hex(&rationale)[..12].to_string(),
            kind: IssueType::Other,
            severity: Severity::Critical,
            rationale,
            fix_suggestion: String::new(),
            confidence: 1.0,
        };
        let constraints = normalize(&self.defaults, &sample.constraints)
            .or_else(|_| normalize(&ConstraintsPatch::default(), &ConstraintsPatch::default()))
            .expect("empty constraints normalize");
        RunRecord {
            run_id: self.run_id.clone(),
            condition,
            sample_id: sample.id.clone(),
            draft: TranslationText::default(),
            final_text: TranslationText::default(),
            issues: vec![issue],
            hard_checks: Vec::new(),
            scores: RunScores::default(),
            usage: Usage::default(),
            timings: Timings {
                stage_ms: StageMs::default(),
                total_ms: started.elapsed().as_millis() as u64,
            },
            state: None,
            normalized_constraints: constraints,
            trace: None,
            status: RunStatus::Error,
        }
    }

    /// Write each component's resolved prompt once per run.
    pub fn dump_prompts(&self, dump: &PromptDump) -> anyhow::Result<()> {
        let mut components: Vec<(&str, Option<&super::LlmComponent>)> = vec![
            ("translator", Some(&self.translator.llm)),
            ("stateBuilder", self.state_builder.llm.as_ref()),
            ("verifier", self.verifier.llm.as_ref()),
            ("repairer", self.repairer.llm.as_ref()),
            ("judge", self.judge.llm.as_ref()),
        ];
        if let Some(t) = self.translator_with_state.as_ref() {
            components.push(("translatorWithState", Some(&t.llm)));
        }
        for (name, component) in components {
            let Some(component) = component else { continue };
            let mut text = String::new();
            if let Some(system) = component.prompt.system.as_deref() {
                text.push_str("# system\n");
                text.push_str(system);
                text.push_str("\n\n");
            }
            if let Some(template) = component.prompt.template.as_deref() {
                text.push_str(template);
            }
            if let Some(source) = component.prompt.source.as_deref() {
                text.push_str(&format!("\n\n# source: {source}\n"));
            }
            dump.write_component(name, &text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use super::*;
    use crate::hardcheck::HardCheckSettings;
    use crate::llm::limiter::RateLimiter;
    use crate::llm::{Gateway, ModelSpec, ProviderKind};
    use crate::pipeline::prompts::ResolvedPrompt;
    use crate::pipeline::LlmComponent;

    fn mock_spec() -> ModelSpec {
        ModelSpec {
            provider: ProviderKind::Mock,
            name: "mock".into(),
            temperature: None,
            top_p: None,
            max_output_tokens: None,
            json_mode: None,
        }
    }

    fn mock_runner() -> Runner {
        let gateway: Arc<Gateway> =
            Arc::new(Gateway::new(None, None, Arc::new(RateLimiter::new(None, None))));
        Runner {
            run_id: "test-run".into(),
            defaults: ConstraintsPatch::default(),
            translator: Translator {
                llm: LlmComponent::new(gateway, mock_spec(), ResolvedPrompt::default()),
            },
            translator_with_state: None,
            state_builder: StateBuilder { llm: None },
            verifier: Verifier {
                llm: None,
                settings: HardCheckSettings::default(),
            },
            repairer: Repairer { llm: None },
            judge: Judge { llm: None, runs: 1 },
            max_repairs: 1,
            concurrency: 2,
            tracer: Tracer::new(false),
            progress: ConsoleProgress::new(false),
        }
    }

    fn sample(id: &str, text: &str) -> Sample {
        Sample {
            id: id.into(),
            text: text.into(),
            context: String::new(),
            constraints: ConstraintsPatch::default(),
            reference: None,
        }
    }

    #[test]
    fn a0_pair_has_no_state_and_no_repair_timing() {
        let runner = mock_runner();
        let record = runner.run_pair(&sample("s1", "こんにちは、世界。"), Condition::A0);
        assert!(record.state.is_none());
        assert!(record.timings.stage_ms.repair.is_none());
        assert_eq!(record.final_text.en, "こんにちは, 世界.");
        assert_eq!(record.status, RunStatus::NeedsReview);
    }

    #[test]
    fn a1_pair_carries_state_without_repair() {
        let runner = mock_runner();
        let record = runner.run_pair(&sample("s1", "こんにちは。"), Condition::A1);
        let state = record.state.expect("state present");
        assert_eq!(state.utterance, "こんにちは。");
        assert!(record.timings.stage_ms.repair.is_none());
    }

    #[test]
    fn scores_overall_mirrors_judge_overall() {
        let runner = mock_runner();
        let record = runner.run_pair(&sample("s1", "こんにちは。"), Condition::A0);
        assert!((record.scores.overall - record.scores.judge.overall).abs() < f32::EPSILON);
    }

    #[test]
    fn invalid_constraints_produce_error_record() {
        let runner = mock_runner();
        let mut s = sample("s1", "テスト。");
        s.constraints.banned_patterns.push("([broken".into());
        let record = runner.run_pair(&s, Condition::A0);
        assert_eq!(record.status, RunStatus::Error);
        assert_eq!(record.issues.len(), 1);
        assert_eq!(record.issues[0].kind, IssueType::Other);
        assert_eq!(record.issues[0].severity, Severity::Critical);
    }

    #[test]
    fn matrix_writes_samples_times_conditions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.jsonl");
        let writer = JsonlWriter::create(&path, false).expect("writer");
        let runner = mock_runner();
        let samples = vec![sample("s1", "一。"), sample("s2", "二。"), sample("s3", "三。")];
        let outcome = runner
            .run(
                &samples,
                &Condition::ALL,
                &writer,
                None,
                &AtomicBool::new(false),
            )
            .expect("run");
        assert_eq!(outcome.written, 12);
        assert!(!outcome.cancelled);
        assert_eq!(writer.finish().expect("finish"), 12);
    }
}
