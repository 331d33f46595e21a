//! MLflow REST API client (`/api/2.0/mlflow/...`).

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{artifact_dest, copy_tree, local_path, now_millis, walk_files, TrackingBackend};
use crate::error::{Result, TrackError};
use crate::models::{Experiment, KeyValue, Metric, Run, RunInfo, RunStatus};

/// Maximum number of metrics per `runs/log-batch` request.
pub const MAX_METRICS_PER_BATCH: usize = 1000;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// HTTP client settings, usually read from the `MLFLOW_*` environment.
#[derive(Debug, Clone, Default)]
pub struct RestSettings {
    pub timeout: Option<Duration>,
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RestSettings {
    pub fn from_env() -> Self {
        let var = |name: &str| env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            timeout: var("MLFLOW_HTTP_REQUEST_TIMEOUT")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs),
            token: var("MLFLOW_TRACKING_TOKEN"),
            username: var("MLFLOW_TRACKING_USERNAME"),
            password: var("MLFLOW_TRACKING_PASSWORD"),
        }
    }
}

#[derive(Deserialize, Default)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ExperimentResponse {
    experiment: Experiment,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Deserialize)]
struct RunResponse {
    run: Run,
}

/// Where a run's artifacts physically live.
#[derive(Debug, PartialEq)]
enum ArtifactRepo {
    /// Proxied through the tracking server (`mlflow-artifacts:`).
    Proxied(String),
    /// A directory reachable from this machine.
    Local(PathBuf),
}

impl ArtifactRepo {
    fn parse(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix("mlflow-artifacts:") {
            // mlflow-artifacts://host:port/path carries an authority we ignore.
            let path = match rest.strip_prefix("//") {
                Some(with_host) => with_host.split_once('/').map(|(_, p)| p).unwrap_or(""),
                None => rest,
            };
            return Ok(ArtifactRepo::Proxied(path.trim_matches('/').to_string()));
        }
        local_path(uri)
            .map(ArtifactRepo::Local)
            .ok_or_else(|| TrackError::UnsupportedUri(uri.to_string()))
    }
}

pub struct RestBackend {
    base: String,
    client: Client,
    settings: RestSettings,
    artifact_uris: Mutex<HashMap<String, String>>,
}

impl RestBackend {
    pub fn new(uri: &str) -> Result<Self> {
        Self::with_settings(uri, RestSettings::from_env())
    }

    pub fn with_settings(uri: &str, settings: RestSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(
                settings
                    .timeout
                    .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            )
            .build()?;
        Ok(Self {
            base: uri.trim_end_matches('/').to_string(),
            client,
            settings,
            artifact_uris: Mutex::new(HashMap::new()),
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base, endpoint)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.settings.token {
            req.bearer_auth(token)
        } else if let Some(user) = &self.settings.username {
            req.basic_auth(user, self.settings.password.as_ref())
        } else {
            req
        }
    }

    fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = self.authorize(req).send()?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or_else(|_| ApiErrorBody {
                error_code: String::new(),
                message: text,
            });
            return Err(TrackError::Api {
                status: status.as_u16(),
                code: body.error_code,
                message: body.message,
            });
        }
        Ok(resp.json::<T>()?)
    }

    fn get<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<T> {
        self.send(self.client.get(self.api_url(endpoint)).query(query))
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, endpoint: &str, body: &B) -> Result<T> {
        self.send(self.client.post(self.api_url(endpoint)).json(body))
    }

    fn artifact_repo(&self, run_id: &str) -> Result<ArtifactRepo> {
        let cached = self
            .artifact_uris
            .lock()
            .ok()
            .and_then(|m| m.get(run_id).cloned());
        let uri = match cached {
            Some(uri) => uri,
            None => {
                let uri = self.get_run(run_id)?.info.artifact_uri;
                if let Ok(mut m) = self.artifact_uris.lock() {
                    m.insert(run_id.to_string(), uri.clone());
                }
                uri
            }
        };
        ArtifactRepo::parse(&uri)
    }

    fn upload(&self, repo_path: &str, dest: &str, file: &Path) -> Result<()> {
        let url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}",
            self.base,
            join_url_path(&[repo_path, dest])
        );
        debug!(%url, file = %file.display(), "uploading artifact");
        let body = fs::read(file)?;
        let _: serde_json::Value = self.send(self.client.put(url).body(body))?;
        Ok(())
    }
}

fn join_url_path(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

impl TrackingBackend for RestBackend {
    fn tracking_uri(&self) -> String {
        self.base.clone()
    }

    fn get_or_create_experiment(&self, name: &str) -> Result<String> {
        match self.get::<ExperimentResponse>("experiments/get-by-name", &[("experiment_name", name)]) {
            Ok(found) if found.experiment.lifecycle_stage != "active" => Err(TrackError::Other(
                format!("experiment '{}' is {}", name, found.experiment.lifecycle_stage),
            )),
            Ok(found) => Ok(found.experiment.experiment_id),
            Err(e) if e.is_not_found() => {
                let created: CreateExperimentResponse =
                    self.post("experiments/create", &json!({ "name": name }))?;
                Ok(created.experiment_id)
            }
            Err(e) => Err(e),
        }
    }

    fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo> {
        let body = json!({
            "experiment_id": experiment_id,
            "run_name": run_name,
            "start_time": now_millis(),
            "tags": [KeyValue { key: super::file_store::RUN_NAME_TAG.to_string(), value: run_name.to_string() }],
        });
        let created: RunResponse = self.post("runs/create", &body)?;
        Ok(created.run.info)
    }

    fn get_run(&self, run_id: &str) -> Result<Run> {
        match self.get::<RunResponse>("runs/get", &[("run_id", run_id)]) {
            Ok(found) => Ok(found.run),
            Err(e) if e.is_not_found() => Err(TrackError::RunNotFound(run_id.to_string())),
            Err(e) => Err(e),
        }
    }

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let _: serde_json::Value = self.post(
            "runs/log-parameter",
            &json!({ "run_id": run_id, "key": key, "value": value }),
        )?;
        Ok(())
    }

    fn log_metrics(&self, run_id: &str, metrics: &[Metric]) -> Result<()> {
        for chunk in metrics.chunks(MAX_METRICS_PER_BATCH) {
            let _: serde_json::Value = self.post(
                "runs/log-batch",
                &json!({ "run_id": run_id, "metrics": chunk }),
            )?;
        }
        Ok(())
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let _: serde_json::Value = self.post(
            "runs/set-tag",
            &json!({ "run_id": run_id, "key": key, "value": value }),
        )?;
        Ok(())
    }

    fn log_artifact(
        &self,
        run_id: &str,
        local_file: &Path,
        artifact_path: Option<&str>,
    ) -> Result<()> {
        let name = local_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TrackError::Other(format!("not a file: {}", local_file.display())))?;
        match self.artifact_repo(run_id)? {
            ArtifactRepo::Proxied(repo) => {
                let dest = join_url_path(&[artifact_path.unwrap_or(""), name]);
                self.upload(&repo, &dest, local_file)
            }
            ArtifactRepo::Local(dir) => {
                let dest_dir = artifact_dest(&dir, artifact_path)?;
                fs::create_dir_all(&dest_dir)?;
                fs::copy(local_file, dest_dir.join(name))?;
                Ok(())
            }
        }
    }

    fn log_artifacts(
        &self,
        run_id: &str,
        local_dir: &Path,
        artifact_path: Option<&str>,
    ) -> Result<()> {
        match self.artifact_repo(run_id)? {
            ArtifactRepo::Proxied(repo) => {
                for (file, rel) in walk_files(local_dir)? {
                    let dest = join_url_path(&[artifact_path.unwrap_or(""), &rel]);
                    self.upload(&repo, &dest, &file)?;
                }
                Ok(())
            }
            ArtifactRepo::Local(dir) => copy_tree(local_dir, &artifact_dest(&dir, artifact_path)?),
        }
    }

    fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let _: serde_json::Value = self.post(
            "runs/update",
            &json!({ "run_id": run_id, "status": status, "end_time": now_millis() }),
        )?;
        if let Ok(mut m) = self.artifact_uris.lock() {
            m.remove(run_id);
        }
        Ok(())
    }
}
