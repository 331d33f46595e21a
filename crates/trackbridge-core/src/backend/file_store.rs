//! Local file store: MLflow-style experiment/run layout on disk.
//!
//! ```text
//! <root>/<experiment_id>/meta.yaml
//! <root>/<experiment_id>/<run_id>/meta.yaml
//!                                 params.yaml
//!                                 tags.yaml
//!                                 metrics.parquet
//!                                 artifacts/
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tracing::debug;
use uuid::Uuid;

use super::{artifact_dest, copy_tree, now_millis, walk_files, TrackingBackend};
use crate::error::{Result, TrackError};
use crate::models::{Experiment, KeyValue, Metric, Run, RunData, RunInfo, RunStatus};

const META_FILE: &str = "meta.yaml";
const PARAMS_FILE: &str = "params.yaml";
const TAGS_FILE: &str = "tags.yaml";
const METRICS_FILE: &str = "metrics.parquet";
const ARTIFACTS_DIR: &str = "artifacts";
pub const RUN_NAME_TAG: &str = "mlflow.runName";

/// A file below a run's `artifacts/` directory.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ArtifactInfo {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub ext: String,
}

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = fs::canonicalize(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn experiment_dir(&self, experiment_id: &str) -> PathBuf {
        self.root.join(experiment_id)
    }

    // ─── Experiments ─────────────────────────────────────────────────────────

    pub fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let mut experiments = vec![];
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let meta = entry.path().join(META_FILE);
            if meta.exists() {
                experiments.push(load_yaml::<Experiment>(&meta)?);
            }
        }
        experiments.sort_by_key(|e| e.experiment_id.parse::<u64>().unwrap_or(u64::MAX));
        Ok(experiments)
    }

    pub fn get_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        let meta = self.experiment_dir(experiment_id).join(META_FILE);
        if !meta.exists() {
            return Err(TrackError::ExperimentNotFound(experiment_id.to_string()));
        }
        load_yaml(&meta)
    }

    pub fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        Ok(self.list_experiments()?.into_iter().find(|e| e.name == name))
    }

    pub fn create_experiment(&self, name: &str) -> Result<Experiment> {
        let next_id = self
            .list_experiments()?
            .iter()
            .filter_map(|e| e.experiment_id.parse::<u64>().ok())
            .max()
            .map(|id| id + 1)
            .unwrap_or(0);
        let experiment_id = next_id.to_string();
        let dir = self.experiment_dir(&experiment_id);
        fs::create_dir_all(&dir)?;

        let experiment = Experiment {
            experiment_id,
            name: name.to_string(),
            artifact_location: format!("file://{}", dir.display()),
            lifecycle_stage: "active".to_string(),
            creation_time: Some(now_millis()),
        };
        save_yaml(&dir.join(META_FILE), &experiment)?;
        debug!(experiment = %experiment.name, id = %experiment.experiment_id, "created experiment");
        Ok(experiment)
    }

    // ─── Runs ────────────────────────────────────────────────────────────────

    /// Runs of an experiment, newest first.
    pub fn list_runs(&self, experiment_id: &str) -> Result<Vec<RunInfo>> {
        let dir = self.experiment_dir(experiment_id);
        if !dir.exists() {
            return Err(TrackError::ExperimentNotFound(experiment_id.to_string()));
        }
        let mut runs = vec![];
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.path().join(META_FILE);
            if entry.file_type()?.is_dir() && meta.exists() {
                runs.push(load_yaml::<RunInfo>(&meta)?);
            }
        }
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(runs)
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        if run_id.is_empty() || run_id.contains(['/', '\\', '.']) {
            return Err(TrackError::RunNotFound(run_id.to_string()));
        }
        for entry in fs::read_dir(&self.root)? {
            let candidate = entry?.path().join(run_id);
            if candidate.join(META_FILE).exists() {
                return Ok(candidate);
            }
        }
        Err(TrackError::RunNotFound(run_id.to_string()))
    }

    fn load_run_info(&self, run_dir: &Path) -> Result<RunInfo> {
        load_yaml(&run_dir.join(META_FILE))
    }

    /// Directory of a run that is still accepting data.
    fn active_run_dir(&self, run_id: &str) -> Result<PathBuf> {
        let dir = self.run_dir(run_id)?;
        let info = self.load_run_info(&dir)?;
        if info.status != RunStatus::Running {
            return Err(TrackError::RunNotActive(run_id.to_string()));
        }
        Ok(dir)
    }

    // ─── Reads used by the CLI ───────────────────────────────────────────────

    /// Every metric sample of a run, in logging order.
    pub fn read_metrics(&self, run_id: &str) -> Result<Vec<Metric>> {
        read_metrics_file(&self.run_dir(run_id)?.join(METRICS_FILE))
    }

    /// Latest sample per metric key: highest step, then newest timestamp.
    pub fn latest_metrics(&self, run_id: &str) -> Result<BTreeMap<String, Metric>> {
        Ok(latest_per_key(self.read_metrics(run_id)?))
    }

    pub fn params(&self, run_id: &str) -> Result<BTreeMap<String, String>> {
        load_string_map(&self.run_dir(run_id)?.join(PARAMS_FILE))
    }

    pub fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactInfo>> {
        let dir = self.run_dir(run_id)?.join(ARTIFACTS_DIR);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut out = vec![];
        for (file, rel) in walk_files(&dir)? {
            out.push(ArtifactInfo {
                name: file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("")
                    .to_string(),
                size: file.metadata()?.len(),
                ext: file
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("")
                    .to_lowercase(),
                path: rel,
            });
        }
        Ok(out)
    }
}

impl TrackingBackend for FileStore {
    fn tracking_uri(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn get_or_create_experiment(&self, name: &str) -> Result<String> {
        match self.get_experiment_by_name(name)? {
            Some(existing) if existing.lifecycle_stage != "active" => Err(TrackError::Other(
                format!("experiment '{}' is {}", name, existing.lifecycle_stage),
            )),
            Some(existing) => Ok(existing.experiment_id),
            None => Ok(self.create_experiment(name)?.experiment_id),
        }
    }

    fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo> {
        self.get_experiment(experiment_id)?;

        let run_id = Uuid::new_v4().simple().to_string();
        let dir = self.experiment_dir(experiment_id).join(&run_id);
        let artifacts = dir.join(ARTIFACTS_DIR);
        fs::create_dir_all(&artifacts)?;

        let info = RunInfo {
            run_id,
            run_name: run_name.to_string(),
            experiment_id: experiment_id.to_string(),
            status: RunStatus::Running,
            start_time: now_millis(),
            end_time: None,
            artifact_uri: format!("file://{}", artifacts.display()),
            lifecycle_stage: "active".to_string(),
        };
        save_yaml(&dir.join(META_FILE), &info)?;

        let tags = BTreeMap::from([(RUN_NAME_TAG.to_string(), run_name.to_string())]);
        save_yaml(&dir.join(TAGS_FILE), &tags)?;
        Ok(info)
    }

    fn get_run(&self, run_id: &str) -> Result<Run> {
        let dir = self.run_dir(run_id)?;
        let info = self.load_run_info(&dir)?;
        let data = RunData {
            metrics: latest_per_key(read_metrics_file(&dir.join(METRICS_FILE))?)
                .into_values()
                .collect(),
            params: to_key_values(load_string_map(&dir.join(PARAMS_FILE))?),
            tags: to_key_values(load_string_map(&dir.join(TAGS_FILE))?),
        };
        Ok(Run { info, data })
    }

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let path = self.active_run_dir(run_id)?.join(PARAMS_FILE);
        let mut params = load_string_map(&path)?;
        match params.get(key) {
            Some(existing) if existing == value => return Ok(()),
            Some(existing) => {
                return Err(TrackError::ParamConflict {
                    key: key.to_string(),
                    existing: existing.clone(),
                    attempted: value.to_string(),
                })
            }
            None => {}
        }
        params.insert(key.to_string(), value.to_string());
        save_yaml(&path, &params)
    }

    fn log_metrics(&self, run_id: &str, metrics: &[Metric]) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let path = self.active_run_dir(run_id)?.join(METRICS_FILE);
        append_metrics(&path, metrics)
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let path = self.active_run_dir(run_id)?.join(TAGS_FILE);
        let mut tags = load_string_map(&path)?;
        tags.insert(key.to_string(), value.to_string());
        save_yaml(&path, &tags)
    }

    fn log_artifact(
        &self,
        run_id: &str,
        local_file: &Path,
        artifact_path: Option<&str>,
    ) -> Result<()> {
        let base = self.active_run_dir(run_id)?.join(ARTIFACTS_DIR);
        let dest_dir = artifact_dest(&base, artifact_path)?;
        let name = local_file.file_name().ok_or_else(|| {
            TrackError::Other(format!("not a file: {}", local_file.display()))
        })?;
        fs::create_dir_all(&dest_dir)?;
        fs::copy(local_file, dest_dir.join(name))?;
        Ok(())
    }

    fn log_artifacts(
        &self,
        run_id: &str,
        local_dir: &Path,
        artifact_path: Option<&str>,
    ) -> Result<()> {
        let base = self.active_run_dir(run_id)?.join(ARTIFACTS_DIR);
        let dest_dir = artifact_dest(&base, artifact_path)?;
        copy_tree(local_dir, &dest_dir)
    }

    fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let dir = self.run_dir(run_id)?;
        let mut info = self.load_run_info(&dir)?;
        info.status = status;
        info.end_time = Some(now_millis());
        save_yaml(&dir.join(META_FILE), &info)
    }
}

// ─── YAML I/O ────────────────────────────────────────────────────────────────

fn save_yaml<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_yaml::to_string(data)?;
    fs::write(path, content)?;
    Ok(())
}

fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

fn load_string_map(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    load_yaml(path)
}

fn to_key_values(map: BTreeMap<String, String>) -> Vec<KeyValue> {
    map.into_iter()
        .map(|(key, value)| KeyValue { key, value })
        .collect()
}

fn latest_per_key(metrics: Vec<Metric>) -> BTreeMap<String, Metric> {
    let mut latest: BTreeMap<String, Metric> = BTreeMap::new();
    for m in metrics {
        let newer = latest
            .get(&m.key)
            .map(|cur| (m.step.unwrap_or(0), m.timestamp) >= (cur.step.unwrap_or(0), cur.timestamp))
            .unwrap_or(true);
        if newer {
            latest.insert(m.key.clone(), m);
        }
    }
    latest
}

// ─── Parquet metrics I/O ─────────────────────────────────────────────────────

fn metrics_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("value", DataType::Float64, false),
        Field::new("step", DataType::Int64, true),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
    ]))
}

/// Append metric samples to a Parquet file.
/// Strategy: read existing → extend → write back. Calls are batched by the
/// training loop, so O(n) per call is acceptable.
fn append_metrics(path: &Path, metrics: &[Metric]) -> Result<()> {
    let mut all = read_metrics_file(path)?;
    all.extend_from_slice(metrics);
    write_parquet(path, &metrics_to_record_batch(&all)?)
}

fn read_metrics_file(path: &Path) -> Result<Vec<Metric>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let file = fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut out = vec![];
    for batch in reader {
        out.extend(record_batch_to_metrics(&batch?)?);
    }
    Ok(out)
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = fs::File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn metrics_to_record_batch(metrics: &[Metric]) -> Result<RecordBatch> {
    let keys: ArrayRef = Arc::new(StringArray::from_iter_values(
        metrics.iter().map(|m| m.key.as_str()),
    ));
    let values: ArrayRef = Arc::new(Float64Array::from_iter_values(
        metrics.iter().map(|m| m.value),
    ));
    let steps: ArrayRef = Arc::new(Int64Array::from(
        metrics.iter().map(|m| m.step).collect::<Vec<_>>(),
    ));
    let timestamps: ArrayRef = Arc::new(
        TimestampMicrosecondArray::from(
            metrics
                .iter()
                .map(|m| m.timestamp * 1000)
                .collect::<Vec<_>>(),
        )
        .with_timezone_opt(Some("UTC".to_string())),
    );
    Ok(RecordBatch::try_new(
        metrics_schema(),
        vec![keys, values, steps, timestamps],
    )?)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| TrackError::Other(format!("metrics file has no usable '{name}' column")))
}

fn record_batch_to_metrics(batch: &RecordBatch) -> Result<Vec<Metric>> {
    let keys = column::<StringArray>(batch, "key")?;
    let values = column::<Float64Array>(batch, "value")?;
    let steps = column::<Int64Array>(batch, "step")?;
    let timestamps = column::<TimestampMicrosecondArray>(batch, "timestamp")?;

    Ok((0..batch.num_rows())
        .map(|i| Metric {
            key: keys.value(i).to_string(),
            value: values.value(i),
            step: (!steps.is_null(i)).then(|| steps.value(i)),
            timestamp: timestamps.value(i) / 1000,
        })
        .collect())
}
