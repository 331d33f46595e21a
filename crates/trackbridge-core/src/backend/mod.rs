//! Tracking backends: the outbound side of the adapter.
//!
//! A backend speaks the MLflow data model (experiments, runs, params,
//! metrics, tags, artifacts). Two implementations ship with the crate: a
//! local [`FileStore`] and an MLflow [`RestBackend`].

pub mod file_store;
pub mod model;
pub mod rest;

use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;

use crate::error::{Result, TrackError};
use crate::models::{Metric, Run, RunInfo, RunStatus};

pub use file_store::{ArtifactInfo, FileStore};
pub use rest::{RestBackend, RestSettings};

/// Operations the adapter needs from an experiment-tracking service.
///
/// All calls are synchronous and blocking.
pub trait TrackingBackend {
    /// Where this backend stores its data, for log lines.
    fn tracking_uri(&self) -> String;

    /// Look up an experiment by name, creating it when missing. Returns its id.
    fn get_or_create_experiment(&self, name: &str) -> Result<String>;

    fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo>;

    fn get_run(&self, run_id: &str) -> Result<Run>;

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    fn log_metrics(&self, run_id: &str, metrics: &[Metric]) -> Result<()>;

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Upload one file under `artifact_path` (artifact root when `None`).
    fn log_artifact(&self, run_id: &str, local_file: &Path, artifact_path: Option<&str>)
        -> Result<()>;

    /// Upload the contents of a directory under `artifact_path`.
    fn log_artifacts(&self, run_id: &str, local_dir: &Path, artifact_path: Option<&str>)
        -> Result<()>;

    /// Package a model and upload it under `model_name`.
    fn log_model(&self, run_id: &str, model_path: &Path, model_name: &str) -> Result<()> {
        let staged = model::stage_model(run_id, model_path, model_name)?;
        self.log_artifacts(run_id, staged.dir(), Some(model_name))?;

        let previous = self
            .get_run(run_id)?
            .tag(model::MODEL_HISTORY_TAG)
            .map(str::to_string);
        let history = model::append_history(previous.as_deref(), staged.descriptor())?;
        self.set_tag(run_id, model::MODEL_HISTORY_TAG, &history)
    }

    fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()>;
}

/// Pick a backend for a tracking URI.
///
/// `http://` and `https://` select the REST client; `file:` URIs and plain
/// paths select the local file store.
pub fn connect(uri: &str) -> Result<Box<dyn TrackingBackend>> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Box::new(RestBackend::new(uri)?));
    }
    match local_path(uri) {
        Some(path) => Ok(Box::new(FileStore::open(path)?)),
        None => Err(TrackError::UnsupportedUri(uri.to_string())),
    }
}

/// Local filesystem path behind `file://`, `file:` or a bare path.
pub(crate) fn local_path(uri: &str) -> Option<PathBuf> {
    if let Some(rest) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if let Some(rest) = uri.strip_prefix("file:") {
        return Some(PathBuf::from(rest));
    }
    if uri.trim().is_empty() {
        return None;
    }
    match uri.split_once(':') {
        // Single-letter "schemes" are Windows drive letters.
        Some((scheme, _))
            if scheme.len() > 1
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) =>
        {
            None
        }
        _ => Some(PathBuf::from(uri)),
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Join a relative artifact path onto `base`, rejecting anything that
/// would escape it.
pub(crate) fn artifact_dest(base: &Path, artifact_path: Option<&str>) -> Result<PathBuf> {
    let Some(rel) = artifact_path.filter(|p| !p.is_empty()) else {
        return Ok(base.to_path_buf());
    };
    let rel = Path::new(rel);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(TrackError::Other(format!(
            "artifact path must be relative and stay inside the run: {}",
            rel.display()
        )));
    }
    Ok(base.join(rel))
}

/// Every regular file under `dir`, with its `/`-separated path relative to `dir`.
pub(crate) fn walk_files(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut out = vec![];
    collect(dir, dir, &mut out)?;
    out.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(out)
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, String)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((path, rel));
        }
    }
    Ok(())
}

/// Recursively copy the contents of `src` into `dst`.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for (file, rel) in walk_files(src)? {
        let target = dst.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&file, &target)?;
    }
    fs::create_dir_all(dst)?;
    Ok(())
}
