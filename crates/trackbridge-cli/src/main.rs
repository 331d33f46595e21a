//! trackbridge CLI: inspect local tracking stores and log runs from the shell.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use tracing::info;

use trackbridge::backend::FileStore;
use trackbridge::{telemetry, MetricBatch, MetricValue, RunConfig, TrackingAdapter, TrackingBackend};

#[derive(Parser)]
#[command(
    name = "trackbridge",
    about = "trackbridge: best-effort experiment tracking for training loops",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List experiments, or the runs of one experiment
    List {
        /// Path to the local tracking store
        #[arg(long, default_value = "./mlruns")]
        store: PathBuf,
        /// Show runs for a specific experiment (by name)
        #[arg(long, short)]
        experiment: Option<String>,
    },
    /// Inspect a run: info, params, latest metrics and artifacts
    Inspect {
        /// Run id
        run_id: String,
        /// Path to the local tracking store
        #[arg(long, default_value = "./mlruns")]
        store: PathBuf,
    },
    /// Export the metric history of a run to CSV or JSON
    Export {
        /// Run id
        run_id: String,
        /// Path to the local tracking store
        #[arg(long, default_value = "./mlruns")]
        store: PathBuf,
        /// Output format
        #[arg(long, short, default_value = "csv", value_parser = ["csv", "json"])]
        format: String,
        /// Output file (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Track a run from a YAML config, a JSONL metrics file and artifacts
    Log {
        /// Run configuration (YAML)
        #[arg(long, short)]
        config: PathBuf,
        /// Metrics file: one JSON object per line, optional "step" field
        #[arg(long, short)]
        metrics: Option<PathBuf>,
        /// File or directory to upload (repeatable)
        #[arg(long = "artifact")]
        artifacts: Vec<PathBuf>,
        /// Trained model to package and register
        #[arg(long)]
        model: Option<PathBuf>,
        /// Override the config's tracking URI
        #[arg(long)]
        tracking_uri: Option<String>,
    },
}

fn main() -> Result<()> {
    let _guard = telemetry::init_logging("info", None);

    let cli = Cli::parse();

    match cli.command {
        Commands::List { store, experiment } => {
            cmd_list(store, experiment)?;
        }
        Commands::Inspect { run_id, store } => {
            cmd_inspect(store, run_id)?;
        }
        Commands::Export { run_id, store, format, output } => {
            cmd_export(store, run_id, format, output)?;
        }
        Commands::Log { config, metrics, artifacts, model, tracking_uri } => {
            cmd_log(config, metrics, artifacts, model, tracking_uri)?;
        }
    }

    Ok(())
}

// ─── Command implementations ──────────────────────────────────────────────────

fn open_store(store: &Path) -> Result<FileStore> {
    if !store.exists() {
        anyhow::bail!("Tracking store not found: {}", store.display());
    }
    Ok(FileStore::open(store)?)
}

fn cmd_list(store: PathBuf, experiment: Option<String>) -> Result<()> {
    let fs_store = open_store(&store)?;

    if let Some(exp_name) = experiment {
        let exp = fs_store
            .get_experiment_by_name(&exp_name)?
            .with_context(|| format!("No experiment named '{}'", exp_name))?;
        let runs = fs_store.list_runs(&exp.experiment_id)?;

        if runs.is_empty() {
            println!("No runs found for experiment '{}'", exp_name);
            return Ok(());
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Run ID", "Name", "Status", "Started", "Duration"]);

        for run in &runs {
            let duration = run
                .end_time
                .map(|end| format_duration((end - run.start_time) as f64 / 1000.0))
                .unwrap_or_else(|| "running".to_string());
            table.add_row([
                run.run_id.as_str(),
                run.run_name.as_str(),
                &run.status.to_string(),
                &format_millis(run.start_time),
                &duration,
            ]);
        }

        println!("Experiment: {} (id {})", exp.name, exp.experiment_id);
        println!("{}", table);
    } else {
        let experiments = fs_store.list_experiments()?;

        if experiments.is_empty() {
            println!("No experiments found in '{}'", store.display());
            return Ok(());
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["ID", "Experiment", "Runs", "Created"]);

        for exp in &experiments {
            let runs = fs_store.list_runs(&exp.experiment_id).unwrap_or_default();
            table.add_row([
                exp.experiment_id.as_str(),
                exp.name.as_str(),
                &runs.len().to_string(),
                &exp.creation_time.map(format_millis).unwrap_or_else(|| "-".into()),
            ]);
        }

        println!("Experiments in: {}", store.display());
        println!("{}", table);
    }

    Ok(())
}

fn cmd_inspect(store: PathBuf, run_id: String) -> Result<()> {
    let fs_store = open_store(&store)?;
    let run = fs_store.get_run(&run_id)?;

    println!("Run: {} ({})", run.info.run_name, run.info.run_id);
    println!("Experiment: {}", run.info.experiment_id);
    println!("Status: {}", run.info.status);
    println!("Started: {}", format_millis(run.info.start_time));
    if let Some(end) = run.info.end_time {
        println!("Duration: {}", format_duration((end - run.info.start_time) as f64 / 1000.0));
    }
    println!();

    if !run.data.params.is_empty() {
        println!("── Params ({}) ─────────────────────────", run.data.params.len());
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Param", "Value"]);
        for p in &run.data.params {
            table.add_row([p.key.as_str(), p.value.as_str()]);
        }
        println!("{}", table);
    }

    let latest = fs_store.latest_metrics(&run_id)?;
    if !latest.is_empty() {
        println!("── Latest Metrics ──────────────────────");
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Metric", "Value", "Step"]);
        for (key, m) in &latest {
            table.add_row([
                key.as_str(),
                &m.value.to_string(),
                &m.step.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            ]);
        }
        println!("{}", table);
    }

    let artifacts = fs_store.list_artifacts(&run_id)?;
    if !artifacts.is_empty() {
        println!("── Artifacts ({}) ──────────────────────", artifacts.len());
        for a in &artifacts {
            println!("  {} ({} bytes)", a.path, a.size);
        }
    }

    Ok(())
}

fn cmd_export(
    store: PathBuf,
    run_id: String,
    format: String,
    output: Option<PathBuf>,
) -> Result<()> {
    let fs_store = open_store(&store)?;
    let rows = fs_store.read_metrics(&run_id)?;

    let content = match format.as_str() {
        "json" => serde_json::to_string_pretty(&rows)?,
        "csv" => {
            let mut out = String::from("key,step,value,timestamp\n");
            for m in &rows {
                out += &format!(
                    "{},{},{},{}\n",
                    escape_csv(&m.key),
                    m.step.map(|s| s.to_string()).unwrap_or_default(),
                    m.value,
                    m.timestamp
                );
            }
            out
        }
        _ => anyhow::bail!("Unknown format: {}", format),
    };

    match output {
        Some(path) => {
            fs::write(&path, &content)?;
            println!("Exported {} rows to {}", rows.len(), path.display());
        }
        None => print!("{}", content),
    }

    Ok(())
}

fn cmd_log(
    config: PathBuf,
    metrics: Option<PathBuf>,
    artifacts: Vec<PathBuf>,
    model: Option<PathBuf>,
    tracking_uri: Option<String>,
) -> Result<()> {
    let mut run_config = RunConfig::from_yaml_file(&config)
        .with_context(|| format!("Failed to read run config {}", config.display()))?;
    if let Some(uri) = tracking_uri {
        run_config.tracking_uri = Some(uri);
    }

    let mut adapter = TrackingAdapter::new(&run_config);
    let Some(run_id) = adapter.run_id().map(str::to_string) else {
        println!("Tracking disabled; nothing was logged.");
        return Ok(());
    };

    if let Some(path) = metrics {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read metrics {}", path.display()))?;
        let mut lines = 0usize;
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (batch, step) = parse_metrics_line(line)
                .with_context(|| format!("{}:{}: invalid metrics line", path.display(), n + 1))?;
            adapter.log_metrics(&batch, step, false)?;
            lines += 1;
        }
        info!(run_id = %run_id, lines, "logged metrics");
    }

    for artifact in &artifacts {
        adapter.log_artifacts(artifact, None)?;
    }
    if let Some(model_path) = model {
        adapter.log_model(&model_path, None)?;
    }
    adapter.finish_run()?;

    println!("Logged run {}", run_id);
    Ok(())
}

// ─── Utilities ────────────────────────────────────────────────────────────────

/// One JSONL metrics record: numeric fields plus an optional `step`.
fn parse_metrics_line(line: &str) -> Result<(MetricBatch, Option<u64>)> {
    let serde_json::Value::Object(mut fields) = serde_json::from_str::<serde_json::Value>(line)? else {
        anyhow::bail!("expected a JSON object");
    };
    let step = match fields.remove("step") {
        Some(v) => Some(v.as_u64().context("step must be a non-negative integer")?),
        None => None,
    };
    let batch: HashMap<String, MetricValue> = fields
        .into_iter()
        .filter_map(|(k, v)| serde_json::from_value::<MetricValue>(v).ok().map(|v| (k, v)))
        .collect();
    Ok((batch, step))
}

/// Quote a CSV field when it holds a delimiter, quote or line break.
fn escape_csv(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn format_millis(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_duration(secs: f64) -> String {
    let secs = secs as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_line_with_step() {
        let (batch, step) = parse_metrics_line(r#"{"step": 3, "loss": 0.5, "tag": "x"}"#).unwrap();
        assert_eq!(step, Some(3));
        assert_eq!(batch.get("loss"), Some(&MetricValue::Float(0.5)));
        assert!(!batch.contains_key("step"));
    }

    #[test]
    fn metrics_line_must_be_object() {
        assert!(parse_metrics_line("[1, 2]").is_err());
        assert!(parse_metrics_line(r#"{"step": -1}"#).is_err());
    }

    #[test]
    fn csv_fields_are_quoted_when_needed() {
        assert_eq!(escape_csv("val-loss"), "val-loss");
        assert_eq!(escape_csv("loss,smoothed"), "\"loss,smoothed\"");
        assert_eq!(escape_csv("the \"best\" acc"), "\"the \"\"best\"\" acc\"");
        assert_eq!(escape_csv("multi\nline"), "\"multi\nline\"");
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(42.0), "42s");
        assert_eq!(format_duration(125.0), "2m 5s");
        assert_eq!(format_duration(3720.0), "1h 2m");
    }
}
