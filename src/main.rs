use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scenebench::aggregate::{self, TableFormat};
use scenebench::config::AppConfig;
use scenebench::dataset::read_dataset;
use scenebench::pipeline::trace::PromptDump;
use scenebench::record::Condition;
use scenebench::sink::JsonlWriter;

#[derive(Parser, Debug)]
#[command(name = "scenebench")]
#[command(about = "Offline evaluation harness for narrative JA->EN translation pipelines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an entire experiment over a dataset JSONL
    Run {
        /// Config file (YAML or JSON)
        #[arg(long)]
        config: PathBuf,

        /// Dataset JSONL (one sample per line)
        #[arg(long)]
        input: PathBuf,

        /// Run log JSONL to write
        #[arg(long)]
        output: PathBuf,

        /// Conditions to run, comma separated (default: A0,A1,A2,A3)
        #[arg(long)]
        conditions: Option<String>,

        /// Run id recorded on every record (default: random)
        #[arg(long)]
        run_id: Option<String>,

        /// Replace the output file if it exists
        #[arg(long)]
        overwrite: bool,
    },

    /// Run a single sample and print the result
    RunOne {
        /// Config file (YAML or JSON)
        #[arg(long)]
        config: PathBuf,

        /// Sample JSON file (default: read stdin)
        #[arg(long)]
        sample: Option<PathBuf>,

        /// Condition to run (A0..A3)
        #[arg(long, default_value = "A0")]
        condition: String,

        /// Output format: text (final.en) or json (full record)
        #[arg(long, default_value = "text")]
        output_format: String,
    },

    /// Write a starter config and default prompt files, then exit
    InitConfig {
        /// Directory to write into (default: current directory)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Overwrite existing config/prompt files
        #[arg(long)]
        force: bool,
    },

    /// Summarize run JSONL files into per-(runId, condition) rows
    Aggregate {
        /// Run JSONL globs or paths
        #[arg(long, required = true, num_args = 1..)]
        runs: Vec<String>,

        /// Output file
        #[arg(long)]
        output: PathBuf,

        /// Output format: json or csv
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Copy records that need review or score below a threshold
    ExtractFailures {
        /// Run JSONL globs or paths
        #[arg(long, required = true, num_args = 1..)]
        runs: Vec<String>,

        /// Output JSONL file
        #[arg(long)]
        output: PathBuf,

        /// Overall-score threshold
        #[arg(long, default_value_t = 0.9)]
        threshold: f64,
    },
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            input,
            output,
            conditions,
            run_id,
            overwrite,
        } => run(&config, &input, &output, conditions.as_deref(), run_id, overwrite),
        Command::RunOne {
            config,
            sample,
            condition,
            output_format,
        } => run_one(&config, sample.as_deref(), &condition, &output_format),
        Command::InitConfig { dir, force } => {
            let dir = dir
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_else(|| PathBuf::from("."));
            let path = scenebench::config::init_default_config(&dir, force)?;
            eprintln!("wrote config: {}", path.display());
            Ok(())
        }
        Command::Aggregate {
            runs,
            output,
            format,
        } => {
            let format: TableFormat = format.parse()?;
            let records = aggregate::read_run_records(&runs)?;
            let rows = aggregate::aggregate_rows(&records);
            aggregate::write_rows(&rows, &output, format)?;
            eprintln!("wrote {} rows to {}", rows.len(), output.display());
            Ok(())
        }
        Command::ExtractFailures {
            runs,
            output,
            threshold,
        } => {
            let copied = aggregate::extract_failures(&runs, &output, threshold)?;
            eprintln!("copied {} records to {}", copied, output.display());
            Ok(())
        }
    }
}

/// `LOG_LEVEL` selects the minimum level, default info.
fn init_logging() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(
    config_path: &Path,
    input: &Path,
    output: &Path,
    conditions: Option<&str>,
    run_id: Option<String>,
    overwrite: bool,
) -> anyhow::Result<()> {
    let config = AppConfig::load(config_path)?;
    let config_dir = config_dir_of(config_path);
    let samples = read_dataset(input)?;
    let conditions = parse_conditions(conditions)?;
    let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let settings = config.resolved_settings(&config_dir);
    let runner = config.build_runner(&config_dir, run_id.clone())?;
    runner.progress.info(format!(
        "run {}: {} samples x {} conditions",
        run_id,
        samples.len(),
        conditions.len()
    ));

    let dump = PromptDump::new(settings.resolved_prompt_dir.clone(), &run_id);
    runner.dump_prompts(&dump)?;

    let writer = JsonlWriter::create(output, overwrite)?;
    let outcome = runner.run(&samples, &conditions, &writer, None, &AtomicBool::new(false));
    let written = writer.finish()?;
    let outcome = outcome?;
    runner.progress.info(format!(
        "done: {written} records -> {}{}",
        output.display(),
        if outcome.cancelled { " (cancelled)" } else { "" }
    ));
    Ok(())
}

fn run_one(
    config_path: &Path,
    sample_path: Option<&Path>,
    condition: &str,
    output_format: &str,
) -> anyhow::Result<()> {
    let config = AppConfig::load(config_path)?;
    let config_dir = config_dir_of(config_path);
    let condition: Condition = condition.parse()?;

    let text = match sample_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("read sample: {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read sample from stdin")?;
            buf
        }
    };
    let sample = scenebench::dataset::parse_sample_json(&text)?;

    let runner = config.build_runner(&config_dir, uuid::Uuid::new_v4().to_string())?;
    let record = runner.run_pair(&sample, condition);
    match output_format {
        "json" => println!("{}", serde_json::to_string_pretty(&record)?),
        "text" => println!("{}", record.final_text.en),
        other => return Err(anyhow::anyhow!("unknown output format: {other}")),
    }
    Ok(())
}

fn config_dir_of(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn parse_conditions(csv: Option<&str>) -> anyhow::Result<Vec<Condition>> {
    let Some(csv) = csv else {
        return Ok(Condition::ALL.to_vec());
    };
    let mut out = Vec::new();
    for part in csv.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let c: Condition = part.parse()?;
        if !out.contains(&c) {
            out.push(c);
        }
    }
    if out.is_empty() {
        return Err(anyhow::anyhow!("no conditions given"));
    }
    Ok(out)
}
