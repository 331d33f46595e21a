//! The tracking adapter: best-effort bridge between a training loop and a
//! tracking backend.
//!
//! Construction never fails. If the backend cannot be reached the adapter
//! comes up disabled and every logging call turns into a no-op, so a dead
//! tracking server never takes a training run down with it.
//!
//! Setup-time work (construction, parameter logging) absorbs its errors and
//! reports them as warnings. Per-iteration calls (metrics, artifacts, model,
//! finish) return their errors to the caller.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::backend::{self, TrackingBackend};
use crate::config::RunConfig;
use crate::error::{Result, TrackError};
use crate::flatten::flatten;
use crate::models::{Metric, MetricBatch, ParamTree, RunStatus};

/// Observable lifecycle of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Backend setup failed; nothing is ever sent.
    Disabled,
    /// A run is open on the backend.
    Active,
    /// The run has been finished.
    Ended,
}

struct TrackingSession {
    backend: Box<dyn TrackingBackend>,
    experiment_id: String,
    run_id: String,
}

enum Session {
    Disabled,
    Active(TrackingSession),
    Ended { run_id: String },
}

pub struct TrackingAdapter {
    session: Session,
    model_name: String,
    param_prefix: String,
    separator: String,
}

impl TrackingAdapter {
    /// Connect to the backend named by the config's tracking URI and start a run.
    pub fn new(config: &RunConfig) -> Self {
        let uri = config.resolved_tracking_uri();
        match backend::connect(&uri) {
            Ok(backend) => Self::with_backend(config, backend),
            Err(e) => {
                warn!("Tracking disabled: cannot use tracking URI '{}': {}", uri, e);
                Self::disabled(config)
            }
        }
    }

    /// Start a run on an already constructed backend.
    pub fn with_backend(config: &RunConfig, backend: Box<dyn TrackingBackend>) -> Self {
        let mut adapter = Self::disabled(config);
        match start_session(config, backend) {
            Ok(session) => {
                info!(
                    run_id = %session.run_id,
                    experiment = %config.experiment,
                    "Tracking run {} at {}",
                    session.run_id,
                    session.backend.tracking_uri()
                );
                adapter.session = Session::Active(session);
            }
            Err(e) => {
                warn!("Tracking disabled: failed to start run '{}': {}", config.name, e);
                return adapter;
            }
        }
        adapter.log_params(&config.to_param_tree());
        adapter
    }

    fn disabled(config: &RunConfig) -> Self {
        Self {
            session: Session::Disabled,
            model_name: config.model_name(),
            param_prefix: config.param_prefix.clone(),
            separator: config.separator.clone(),
        }
    }

    pub fn state(&self) -> AdapterState {
        match self.session {
            Session::Disabled => AdapterState::Disabled,
            Session::Active(_) => AdapterState::Active,
            Session::Ended { .. } => AdapterState::Ended,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.session, Session::Active(_))
    }

    /// Id of the run, once one was started.
    pub fn run_id(&self) -> Option<&str> {
        match &self.session {
            Session::Active(s) => Some(&s.run_id),
            Session::Ended { run_id } => Some(run_id),
            Session::Disabled => None,
        }
    }

    pub fn experiment_id(&self) -> Option<&str> {
        match &self.session {
            Session::Active(s) => Some(&s.experiment_id),
            _ => None,
        }
    }

    /// Default name for [`log_model`](Self::log_model).
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    fn active(&self) -> Option<&TrackingSession> {
        match &self.session {
            Session::Active(s) => Some(s),
            _ => None,
        }
    }

    /// Log a (possibly nested) parameter tree. Keys already on the run and
    /// blank values are skipped. Failures are logged and swallowed.
    pub fn log_params(&self, params: &ParamTree) {
        let Some(session) = self.active() else {
            return;
        };
        if let Err(e) = self.try_log_params(session, params) {
            warn!("Failed to log parameters: {}", e);
        }
    }

    fn try_log_params(&self, session: &TrackingSession, params: &ParamTree) -> Result<()> {
        let run = session.backend.get_run(&session.run_id)?;
        let mut sent = 0usize;
        for (key, value) in flatten(params, &self.separator) {
            if run.param(&key).is_some() || value.is_blank() {
                continue;
            }
            session
                .backend
                .log_param(&session.run_id, &key, &value.to_string())?;
            sent += 1;
        }
        debug!(run_id = %session.run_id, count = sent, "logged parameters");
        Ok(())
    }

    /// Log numeric metrics at an optional step. Non-numeric values are
    /// dropped and `:` in names becomes `-`. With `as_param_snapshot` the
    /// names get the configured parameter prefix.
    pub fn log_metrics(
        &self,
        metrics: &MetricBatch,
        step: Option<u64>,
        as_param_snapshot: bool,
    ) -> Result<()> {
        let Some(session) = self.active() else {
            return Ok(());
        };
        let prefix = if as_param_snapshot {
            self.param_prefix.as_str()
        } else {
            ""
        };
        let step = step
            .map(|s| i64::try_from(s).map_err(|_| TrackError::StepOutOfRange(s)))
            .transpose()?;
        let timestamp = backend::now_millis();
        let mut batch: Vec<Metric> = metrics
            .iter()
            .filter_map(|(name, value)| {
                value.as_f64().map(|v| Metric {
                    key: format!("{}{}", prefix, sanitize_metric_name(name)),
                    value: v,
                    timestamp,
                    step,
                })
            })
            .collect();
        if batch.is_empty() {
            return Ok(());
        }
        batch.sort_by(|a, b| a.key.cmp(&b.key));
        session.backend.log_metrics(&session.run_id, &batch)
    }

    /// Upload a file or a directory. Directories land under their own base
    /// name; files under `relative_path` (artifact root when `None`).
    pub fn log_artifacts(&self, path: &Path, relative_path: Option<&str>) -> Result<()> {
        let Some(session) = self.active() else {
            return Ok(());
        };
        if path.is_dir() {
            let base_name = path.file_name().and_then(|n| n.to_str());
            session
                .backend
                .log_artifacts(&session.run_id, path, base_name)
        } else {
            session
                .backend
                .log_artifact(&session.run_id, path, relative_path)
        }
    }

    /// Package and register a trained model, under `model_name` or the
    /// adapter's default model name.
    pub fn log_model(&self, model_path: &Path, model_name: Option<&str>) -> Result<()> {
        let Some(session) = self.active() else {
            return Ok(());
        };
        let name = model_name.unwrap_or(&self.model_name);
        session.backend.log_model(&session.run_id, model_path, name)
    }

    /// End the run as `FINISHED`. No-op unless active.
    pub fn finish_run(&mut self) -> Result<()> {
        self.finish_run_with_status(RunStatus::Finished)
    }

    pub fn finish_run_with_status(&mut self, status: RunStatus) -> Result<()> {
        let Session::Active(session) = &self.session else {
            return Ok(());
        };
        let run_id = session.run_id.clone();
        let result = session.backend.end_run(&run_id, status);
        self.session = Session::Ended { run_id };
        result
    }
}

impl Drop for TrackingAdapter {
    fn drop(&mut self) {
        // Best-effort close of a run the caller never finished.
        if !self.is_active() {
            return;
        }
        let status = if std::thread::panicking() {
            RunStatus::Failed
        } else {
            RunStatus::Finished
        };
        if let Err(e) = self.finish_run_with_status(status) {
            warn!("Failed to end tracking run on drop: {}", e);
        }
    }
}

fn start_session(
    config: &RunConfig,
    backend: Box<dyn TrackingBackend>,
) -> Result<TrackingSession> {
    config.validate()?;
    let experiment_id = backend.get_or_create_experiment(&config.experiment)?;
    let run = backend.create_run(&experiment_id, &config.name)?;
    Ok(TrackingSession {
        backend,
        experiment_id,
        run_id: run.run_id,
    })
}

/// Tracking backends reject `:` in metric names.
pub fn sanitize_metric_name(name: &str) -> String {
    name.replace(':', "-")
}
