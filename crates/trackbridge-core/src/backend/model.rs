//! Model packaging: a model file plus an `MLmodel` descriptor, staged in a
//! temporary directory before upload.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use uuid::Uuid;

use crate::error::{Result, TrackError};

/// Run tag holding a JSON list of every model logged to the run.
pub const MODEL_HISTORY_TAG: &str = "mlflow.log-model.history";
pub const FLAVOR: &str = "trackbridge";
const DESCRIPTOR_FILE: &str = "MLmodel";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlavorConf {
    /// Path of the packaged model data, relative to the model directory.
    pub data: String,
}

/// Contents of the `MLmodel` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub artifact_path: String,
    pub run_id: String,
    pub utc_time_created: String,
    pub model_uuid: String,
    pub flavors: BTreeMap<String, FlavorConf>,
}

/// A packaged model on local disk. The staging directory is removed on drop.
#[derive(Debug)]
pub struct StagedModel {
    dir: TempDir,
    descriptor: ModelDescriptor,
}

impl StagedModel {
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }
}

/// Copy `model_path` (file or directory) into a fresh staging directory
/// under `data/` and write the descriptor next to it.
pub fn stage_model(run_id: &str, model_path: &Path, model_name: &str) -> Result<StagedModel> {
    let file_name = model_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            TrackError::Other(format!("model path has no file name: {}", model_path.display()))
        })?
        .to_string();
    if !model_path.exists() {
        return Err(TrackError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("model not found: {}", model_path.display()),
        )));
    }

    let dir = tempfile::Builder::new().prefix("trackbridge-model-").tempdir()?;
    let model_uuid = Uuid::new_v4().simple().to_string();
    let staged = StagedModel {
        dir,
        descriptor: ModelDescriptor {
            artifact_path: model_name.to_string(),
            run_id: run_id.to_string(),
            utc_time_created: Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            model_uuid,
            flavors: BTreeMap::from([(
                FLAVOR.to_string(),
                FlavorConf {
                    data: format!("data/{file_name}"),
                },
            )]),
        },
    };

    let data_dir = staged.dir().join("data");
    fs::create_dir_all(&data_dir)?;
    if model_path.is_dir() {
        super::copy_tree(model_path, &data_dir.join(&file_name))?;
    } else {
        fs::copy(model_path, data_dir.join(&file_name))?;
    }
    let yaml = serde_yaml::to_string(&staged.descriptor)?;
    fs::write(staged.dir().join(DESCRIPTOR_FILE), yaml)?;

    Ok(staged)
}

/// Append `descriptor` to the JSON list stored in the history tag.
pub fn append_history(previous: Option<&str>, descriptor: &ModelDescriptor) -> Result<String> {
    let mut entries: Vec<serde_json::Value> = match previous {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
        _ => vec![],
    };
    entries.push(serde_json::to_value(descriptor)?);
    Ok(serde_json::to_string(&entries)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_file_with_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let weights = tmp.path().join("best.pt");
        fs::write(&weights, b"weights").unwrap();

        let staged = stage_model("run1", &weights, "best").unwrap();
        let dir = staged.dir().to_path_buf();
        let dir_name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(dir_name.starts_with("trackbridge-model-"));
        assert_eq!(fs::read(dir.join("data/best.pt")).unwrap(), b"weights");

        let descriptor: ModelDescriptor =
            serde_yaml::from_str(&fs::read_to_string(dir.join("MLmodel")).unwrap()).unwrap();
        assert_eq!(descriptor.artifact_path, "best");
        assert_eq!(descriptor.run_id, "run1");
        assert_eq!(descriptor.flavors[FLAVOR].data, "data/best.pt");

        drop(staged);
        assert!(!dir.exists(), "staging dir should be cleaned up");
    }

    #[test]
    fn missing_model_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(stage_model("r", &tmp.path().join("nope.pt"), "nope").is_err());
    }

    #[test]
    fn history_accumulates() {
        let tmp = tempfile::tempdir().unwrap();
        let weights = tmp.path().join("last.pt");
        fs::write(&weights, b"w").unwrap();
        let staged = stage_model("run1", &weights, "last").unwrap();

        let first = append_history(None, staged.descriptor()).unwrap();
        let second = append_history(Some(&first), staged.descriptor()).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&second).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["artifact_path"], "last");
    }
}
