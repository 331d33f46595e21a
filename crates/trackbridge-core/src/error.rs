//! Error types for trackbridge-core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tracking server returned {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {0} is not active")]
    RunNotActive(String),

    #[error("Parameter '{key}' already logged as '{existing}', refusing to overwrite with '{attempted}'")]
    ParamConflict {
        key: String,
        existing: String,
        attempted: String,
    },

    #[error("Metric step {0} does not fit in a signed 64-bit integer")]
    StepOutOfRange(u64),

    #[error("Unsupported URI: {0}")]
    UnsupportedUri(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

impl TrackError {
    /// True when the server reported that the requested entity does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            TrackError::ExperimentNotFound(_) | TrackError::RunNotFound(_) => true,
            TrackError::Api { status, code, .. } => {
                *status == 404 || code == "RESOURCE_DOES_NOT_EXIST"
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TrackError>;
