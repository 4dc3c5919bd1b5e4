use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;

use crate::record::{SpanRecord, TraceInfo};

/// Writes each component's resolved prompt under
/// `<resolvedPromptDir>/<runId>/<component>.txt`, once per run.
pub struct PromptDump {
    dir: PathBuf,
    enabled: bool,
}

impl PromptDump {
    pub fn new(base: Option<PathBuf>, run_id: &str) -> Self {
        match base {
            Some(base) => Self {
                dir: base.join(sanitize_filename(run_id)),
                enabled: true,
            },
            None => Self {
                dir: PathBuf::new(),
                enabled: false,
            },
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_component(&self, component: &str, text: &str) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create prompt dump dir: {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.txt", sanitize_filename(component)));
        std::fs::write(&path, text)
            .with_context(|| format!("write prompt dump: {}", path.display()))?;
        Ok(())
    }
}

fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            _ => out.push(ch),
        }
    }
    out
}

/// Tracing façade. Disabled it is a no-op; enabled it records named spans
/// per pair and surfaces them on the RunRecord. No network I/O here; the
/// export surface is an external collaborator.
#[derive(Clone, Copy, Debug, Default)]
pub struct Tracer {
    enabled: bool,
}

impl Tracer {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    #[must_use]
    pub fn start(&self, trace_id: String) -> Option<TraceRecorder> {
        self.enabled.then(|| TraceRecorder {
            trace_id,
            spans: Vec::new(),
        })
    }
}

pub struct TraceRecorder {
    trace_id: String,
    spans: Vec<SpanRecord>,
}

impl TraceRecorder {
    pub fn record(&mut self, name: &str, started: Instant) {
        self.spans.push(SpanRecord {
            name: name.to_string(),
            ms: started.elapsed().as_millis() as u64,
        });
    }

    #[must_use]
    pub fn finish(self) -> TraceInfo {
        tracing::debug!(trace_id = %self.trace_id, spans = self.spans.len(), "trace finished");
        TraceInfo {
            trace_id: self.trace_id,
            spans: self.spans,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracer_records_nothing() {
        assert!(Tracer::new(false).start("t1".into()).is_none());
    }

    #[test]
    fn enabled_tracer_collects_spans() {
        let mut rec = Tracer::new(true).start("t1".into()).expect("recorder");
        rec.record("translate", Instant::now());
        let info = rec.finish();
        assert_eq!(info.trace_id, "t1");
        assert_eq!(info.spans.len(), 1);
        assert_eq!(info.spans[0].name, "translate");
    }

    #[test]
    fn prompt_dump_writes_under_run_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dump = PromptDump::new(Some(dir.path().to_path_buf()), "run/1");
        dump.write_component("translator", "prompt text").expect("write");
        let path = dir.path().join("run_1").join("translator.txt");
        assert_eq!(std::fs::read_to_string(path).expect("read"), "prompt text");
    }

    #[test]
    fn absent_dump_dir_is_a_noop() {
        let dump = PromptDump::new(None, "r");
        dump.write_component("translator", "x").expect("noop");
    }
}
