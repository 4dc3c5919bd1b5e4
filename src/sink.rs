use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context};

use crate::record::RunRecord;
use crate::store::RunStore;

/// Bound on in-flight store writes; back-pressure blocks workers rather
/// than letting pending writes accumulate.
const STORE_QUEUE_DEPTH: usize = 64;

/// Single serialized writer for the run log. Workers hand over completed
/// records; the writer thread appends one line each and flushes, so lines
/// are never interleaved or lost.
pub struct JsonlWriter {
    tx: Option<Sender<String>>,
    handle: Option<JoinHandle<anyhow::Result<usize>>>,
    path: PathBuf,
}

impl JsonlWriter {
    pub fn create(path: &Path, overwrite: bool) -> anyhow::Result<Self> {
        if path.exists() && !overwrite {
            return Err(anyhow!(
                "output already exists: {} (pass --overwrite to replace)",
                path.display()
            ));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create output dir: {}", parent.display()))?;
        }
        let file = std::fs::File::create(path)
            .with_context(|| format!("create output: {}", path.display()))?;

        let (tx, rx) = mpsc::channel::<String>();
        let display = path.display().to_string();
        let handle = std::thread::spawn(move || -> anyhow::Result<usize> {
            let mut out = std::io::BufWriter::new(file);
            let mut written = 0usize;
            for line in rx {
                writeln!(out, "{line}").with_context(|| format!("append run log: {display}"))?;
                out.flush().with_context(|| format!("flush run log: {display}"))?;
                written += 1;
            }
            Ok(written)
        });
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            path: path.to_path_buf(),
        })
    }

    /// Serialize and enqueue one record. Fails once the writer thread has
    /// died; an append failure is fatal to the run.
    pub fn append(&self, record: &RunRecord) -> anyhow::Result<()> {
        let line = serde_json::to_string(record).context("serialize run record")?;
        self.tx
            .as_ref()
            .expect("writer running")
            .send(line)
            .map_err(|_| anyhow!("run log writer stopped: {}", self.path.display()))
    }

    /// Close the channel, join the writer and surface any I/O error. Returns
    /// the number of lines written.
    pub fn finish(mut self) -> anyhow::Result<usize> {
        drop(self.tx.take());
        let handle = self.handle.take().expect("writer running");
        handle
            .join()
            .map_err(|_| anyhow!("run log writer panicked"))?
    }
}

/// Optional per-record sink feeding the persistent store through a bounded
/// channel. A failed append is retried once, then downgraded to a warning.
pub struct StoreSink {
    tx: Option<SyncSender<RunRecord>>,
    handle: Option<JoinHandle<()>>,
}

impl StoreSink {
    #[must_use]
    pub fn spawn(store: Arc<dyn RunStore>) -> Self {
        let (tx, rx) = mpsc::sync_channel::<RunRecord>(STORE_QUEUE_DEPTH);
        let handle = std::thread::spawn(move || {
            for record in rx {
                if let Err(first) = store.append_run(&record) {
                    if let Err(second) = store.append_run(&record) {
                        tracing::warn!(
                            run_id = %record.run_id,
                            sample_id = %record.sample_id,
                            "store append failed twice, dropping: {first:#}; retry: {second:#}"
                        );
                    }
                }
            }
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Blocks when the queue is full; store slowness back-pressures workers.
    pub fn push(&self, record: RunRecord) {
        if let Some(tx) = self.tx.as_ref() {
            if tx.send(record).is_err() {
                tracing::warn!("store sink thread stopped, record dropped");
            }
        }
    }

    pub fn finish(mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::{normalize, ConstraintsPatch};
    use crate::record::{
        Condition, RunScores, RunStatus, Timings, TranslationText, Usage,
    };
    use crate::store::MemoryStore;

    fn record(sample_id: &str) -> RunRecord {
        RunRecord {
            run_id: "r1".into(),
            condition: Condition::A0,
            sample_id: sample_id.into(),
            draft: TranslationText { en: "d".into() },
            final_text: TranslationText { en: "f".into() },
            issues: vec![],
            hard_checks: vec![],
            scores: RunScores::default(),
            usage: Usage::default(),
            timings: Timings::default(),
            state: None,
            normalized_constraints: normalize(
                &ConstraintsPatch::default(),
                &ConstraintsPatch::default(),
            )
            .expect("normalize"),
            trace: None,
            status: RunStatus::Ok,
        }
    }

    #[test]
    fn writer_appends_one_line_per_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.jsonl");
        let writer = JsonlWriter::create(&path, false).expect("create");
        writer.append(&record("a")).expect("append");
        writer.append(&record("b")).expect("append");
        assert_eq!(writer.finish().expect("finish"), 2);

        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let _: RunRecord = serde_json::from_str(line).expect("valid json line");
        }
    }

    #[test]
    fn refuses_to_clobber_without_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.jsonl");
        std::fs::write(&path, "existing").expect("seed");
        assert!(JsonlWriter::create(&path, false).is_err());
        assert!(JsonlWriter::create(&path, true).is_ok());
    }

    #[test]
    fn store_sink_delivers_records() {
        let store = Arc::new(MemoryStore::default());
        let sink = StoreSink::spawn(store.clone());
        sink.push(record("a"));
        sink.push(record("b"));
        sink.finish();
        assert_eq!(store.list_runs("r1").expect("list").len(), 2);
    }
}
