//! Run configuration: the nested option namespace handed to the adapter.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackError};
use crate::flatten::DEFAULT_SEPARATOR;
use crate::models::{ParamTree, ParamValue};

/// Environment variable consulted when no tracking URI is configured.
pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";
/// Local file store used when nothing else is configured.
pub const DEFAULT_TRACKING_URI: &str = "./mlruns";
pub const DEFAULT_EXPERIMENT: &str = "Default";
pub const DEFAULT_PARAM_PREFIX: &str = "param/";
/// Model name used when no weights path was supplied.
pub const FALLBACK_MODEL_NAME: &str = "model";

fn default_experiment() -> String {
    DEFAULT_EXPERIMENT.to_string()
}

fn default_param_prefix() -> String {
    DEFAULT_PARAM_PREFIX.to_string()
}

fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

/// Configuration for a single tracked run.
///
/// Known keys are typed; every other key lands in `options` and is logged
/// as a (flattened) parameter alongside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Name of this run (required)
    pub name: String,
    /// Experiment the run is grouped under
    #[serde(default = "default_experiment")]
    pub experiment: String,
    /// Backend location: `http(s)://...`, `file:...` or a plain directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_uri: Option<String>,
    /// Initial weights; their file stem becomes the default model name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<PathBuf>,
    /// Prefix for metrics logged as parameter snapshots
    #[serde(default = "default_param_prefix")]
    pub param_prefix: String,
    /// Separator used when flattening nested options
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Free-form hyperparameters, possibly nested
    #[serde(flatten)]
    pub options: ParamTree,
}

impl RunConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            experiment: default_experiment(),
            tracking_uri: None,
            weights: None,
            param_prefix: default_param_prefix(),
            separator: default_separator(),
            options: ParamTree::new(),
        }
    }

    pub fn with_experiment(mut self, experiment: impl Into<String>) -> Self {
        self.experiment = experiment.into();
        self
    }

    pub fn with_tracking_uri(mut self, uri: impl Into<String>) -> Self {
        self.tracking_uri = Some(uri.into());
        self
    }

    pub fn with_weights(mut self, weights: impl Into<PathBuf>) -> Self {
        self.weights = Some(weights.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Load a run configuration from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TrackError::InvalidConfig("run name must not be empty".into()));
        }
        if self.experiment.trim().is_empty() {
            return Err(TrackError::InvalidConfig(
                "experiment name must not be empty".into(),
            ));
        }
        if self.separator.is_empty() {
            return Err(TrackError::InvalidConfig("separator must not be empty".into()));
        }
        Ok(())
    }

    /// Explicit URI, then `MLFLOW_TRACKING_URI`, then `./mlruns`.
    pub fn resolved_tracking_uri(&self) -> String {
        self.tracking_uri
            .clone()
            .or_else(|| env::var(TRACKING_URI_ENV).ok().filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| DEFAULT_TRACKING_URI.to_string())
    }

    /// Stem of the weights file, or the fallback name.
    pub fn model_name(&self) -> String {
        self.weights
            .as_deref()
            .and_then(|w| w.file_stem())
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| FALLBACK_MODEL_NAME.to_string())
    }

    /// The configuration as a parameter tree. The tracking URI is left out
    /// since it may embed credentials.
    pub fn to_param_tree(&self) -> ParamTree {
        let mut tree = self.options.clone();
        tree.insert("name".into(), self.name.as_str().into());
        tree.insert("experiment".into(), self.experiment.as_str().into());
        tree.insert("weights".into(), self.weights.clone().into());
        tree.insert("param_prefix".into(), self.param_prefix.as_str().into());
        tree.insert("separator".into(), self.separator.as_str().into());
        tree
    }
}
