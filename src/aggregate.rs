use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{anyhow, Context};
use serde::Serialize;

use crate::record::{RunRecord, RunStatus, Severity};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableFormat {
    Json,
    Csv,
}

impl std::str::FromStr for TableFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(TableFormat::Json),
            "csv" => Ok(TableFormat::Csv),
            other => Err(anyhow!("unknown format: {other}")),
        }
    }
}

/// One summary row per `(runId, condition)` group.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRow {
    pub run_id: String,
    pub condition: String,
    pub samples: usize,
    pub avg_overall: f64,
    pub min_overall: f64,
    pub max_overall: f64,
    pub failure_rate: f64,
    pub critical_issues: usize,
}

/// Expand `--runs` globs and read every record. Arguments that match no
/// file are treated as literal paths so shell-expanded lists also work.
pub fn read_run_records(patterns: &[String]) -> anyhow::Result<Vec<RunRecord>> {
    let mut paths: Vec<std::path::PathBuf> = Vec::new();
    for pattern in patterns {
        let matched = glob::glob(pattern)
            .with_context(|| format!("bad glob: {pattern}"))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("walk glob: {pattern}"))?;
        if matched.is_empty() {
            paths.push(std::path::PathBuf::from(pattern));
        } else {
            paths.extend(matched);
        }
    }
    paths.sort();
    paths.dedup();

    let mut out = Vec::new();
    for path in &paths {
        for (record, _) in read_jsonl_lines(path)? {
            out.push(record);
        }
    }
    Ok(out)
}

fn read_jsonl_lines(path: &Path) -> anyhow::Result<Vec<(RunRecord, String)>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("open runs: {}", path.display()))?;
    let mut out = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {} line {}", path.display(), lineno + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: RunRecord = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), lineno + 1))?;
        out.push((record, line));
    }
    Ok(out)
}

#[must_use]
pub fn aggregate_rows(records: &[RunRecord]) -> Vec<AggregateRow> {
    let mut groups: BTreeMap<(String, String), Vec<&RunRecord>> = BTreeMap::new();
    for r in records {
        groups
            .entry((r.run_id.clone(), r.condition.as_str().to_string()))
            .or_default()
            .push(r);
    }
    groups
        .into_iter()
        .map(|((run_id, condition), rs)| {
            let overalls: Vec<f64> = rs.iter().map(|r| f64::from(r.scores.overall)).collect();
            let failures = rs.iter().filter(|r| r.status != RunStatus::Ok).count();
            let critical_issues = rs
                .iter()
                .flat_map(|r| r.issues.iter())
                .filter(|i| i.severity == Severity::Critical)
                .count();
            AggregateRow {
                run_id,
                condition,
                samples: rs.len(),
                avg_overall: overalls.iter().sum::<f64>() / overalls.len().max(1) as f64,
                min_overall: overalls.iter().copied().fold(f64::INFINITY, f64::min),
                max_overall: overalls.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                failure_rate: failures as f64 / rs.len().max(1) as f64,
                critical_issues,
            }
        })
        .collect()
}

pub fn write_rows(rows: &[AggregateRow], output: &Path, format: TableFormat) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(output)
        .with_context(|| format!("create output: {}", output.display()))?;
    match format {
        TableFormat::Json => {
            let text = serde_json::to_string_pretty(rows).context("serialize rows")?;
            file.write_all(text.as_bytes())?;
            file.write_all(b"\n")?;
        }
        TableFormat::Csv => {
            writeln!(
                file,
                "runId,condition,samples,avgOverall,minOverall,maxOverall,failureRate,criticalIssues"
            )?;
            for r in rows {
                writeln!(
                    file,
                    "{},{},{},{:.4},{:.4},{:.4},{:.4},{}",
                    csv_field(&r.run_id),
                    r.condition,
                    r.samples,
                    r.avg_overall,
                    r.min_overall,
                    r.max_overall,
                    r.failure_rate,
                    r.critical_issues
                )?;
            }
        }
    }
    Ok(())
}

fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Copy records needing attention: `status = needs_review` or overall score
/// under the threshold. Lines are copied verbatim.
pub fn extract_failures(
    patterns: &[String],
    output: &Path,
    threshold: f64,
) -> anyhow::Result<usize> {
    let mut paths: Vec<std::path::PathBuf> = Vec::new();
    for pattern in patterns {
        let matched = glob::glob(pattern)
            .with_context(|| format!("bad glob: {pattern}"))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("walk glob: {pattern}"))?;
        if matched.is_empty() {
            paths.push(std::path::PathBuf::from(pattern));
        } else {
            paths.extend(matched);
        }
    }
    paths.sort();
    paths.dedup();

    let mut file = std::fs::File::create(output)
        .with_context(|| format!("create output: {}", output.display()))?;
    let mut copied = 0usize;
    for path in &paths {
        for (record, line) in read_jsonl_lines(path)? {
            if record.status == RunStatus::NeedsReview
                || f64::from(record.scores.overall) < threshold
            {
                writeln!(file, "{line}")?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}
