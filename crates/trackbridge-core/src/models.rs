//! Data models shared by the adapter and the tracking backends.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A nested configuration tree: option name -> value.
pub type ParamTree = BTreeMap<String, ParamValue>;

/// A configuration value. `Nested` is the only non-leaf variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ParamValue>),
    Nested(ParamTree),
}

impl ParamValue {
    pub fn is_nested(&self) -> bool {
        matches!(self, ParamValue::Nested(_))
    }

    /// True for values that must never be sent as a parameter: null, or a
    /// string form that is empty after trimming.
    pub fn is_blank(&self) -> bool {
        match self {
            ParamValue::Null => true,
            other => other.to_string().trim().is_empty(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => Ok(()),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{:?}", x),
            ParamValue::Text(s) => f.write_str(s),
            ParamValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            ParamValue::Nested(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}
impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}
impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}
impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Int(v as i64)
    }
}
impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}
impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v as f64)
    }
}
impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}
impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}
impl From<PathBuf> for ParamValue {
    fn from(v: PathBuf) -> Self {
        ParamValue::Text(v.display().to_string())
    }
}
impl From<&Path> for ParamValue {
    fn from(v: &Path) -> Self {
        ParamValue::Text(v.display().to_string())
    }
}
impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ParamValue::Null)
    }
}
impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self {
        ParamValue::List(v.into_iter().map(Into::into).collect())
    }
}
impl From<ParamTree> for ParamValue {
    fn from(v: ParamTree) -> Self {
        ParamValue::Nested(v)
    }
}

/// A single metric value: float, int, bool or string.
/// Only the numeric variants are ever sent to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Float(f) => Some(*f),
            MetricValue::Int(i) => Some(*i as f64),
            MetricValue::Bool(_) | MetricValue::Text(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}
impl From<f32> for MetricValue {
    fn from(v: f32) -> Self {
        MetricValue::Float(v as f64)
    }
}
impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}
impl From<i32> for MetricValue {
    fn from(v: i32) -> Self {
        MetricValue::Int(v as i64)
    }
}
impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::Int(v as i64)
    }
}
impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}
impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}
impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

/// Metric name -> value, as handed over by the training loop.
pub type MetricBatch = HashMap<String, MetricValue>;

/// One metric sample as stored by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    #[serde(with = "metric_float")]
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
}

/// JSON has no NaN or infinity; MLflow spells them as strings.
mod metric_float {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if *value == f64::INFINITY {
            serializer.serialize_str("Infinity")
        } else if *value == f64::NEG_INFINITY {
            serializer.serialize_str("-Infinity")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Named(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(v) => Ok(v),
            Raw::Named(name) => match name.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(de::Error::custom(format!("invalid metric value: {other}"))),
            },
        }
    }
}

/// A key/value pair (parameter or tag).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Scheduled => write!(f, "SCHEDULED"),
            RunStatus::Finished => write!(f, "FINISHED"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Killed => write!(f, "KILLED"),
        }
    }
}

fn default_lifecycle() -> String {
    "active".to_string()
}

/// Metadata of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    #[serde(default)]
    pub run_name: String,
    pub experiment_id: String,
    pub status: RunStatus,
    /// Milliseconds since the Unix epoch.
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub artifact_uri: String,
    #[serde(default = "default_lifecycle")]
    pub lifecycle_stage: String,
}

/// Logged data of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunData {
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub params: Vec<KeyValue>,
    #[serde(default)]
    pub tags: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub info: RunInfo,
    #[serde(default)]
    pub data: RunData,
}

impl Run {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.data
            .params
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.data
            .tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// A named grouping of runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    #[serde(default)]
    pub artifact_location: String,
    #[serde(default = "default_lifecycle")]
    pub lifecycle_stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_metrics_use_named_values() {
        let metric = |value| Metric {
            key: "loss".into(),
            value,
            timestamp: 1,
            step: None,
        };
        let json = serde_json::to_value(metric(f64::NAN)).unwrap();
        assert_eq!(json["value"], "NaN");
        assert_eq!(serde_json::to_value(metric(f64::INFINITY)).unwrap()["value"], "Infinity");
        assert_eq!(
            serde_json::to_value(metric(f64::NEG_INFINITY)).unwrap()["value"],
            "-Infinity"
        );
        assert_eq!(serde_json::to_value(metric(0.5)).unwrap()["value"], 0.5);

        let back: Metric = serde_json::from_value(json).unwrap();
        assert!(back.value.is_nan());
        let bad = serde_json::json!({"key": "loss", "value": "lots", "timestamp": 1});
        assert!(serde_json::from_value::<Metric>(bad).is_err());
    }

    #[test]
    fn blank_detection() {
        assert!(ParamValue::Null.is_blank());
        assert!(ParamValue::from("").is_blank());
        assert!(ParamValue::from("  \t").is_blank());
        assert!(!ParamValue::from("adam").is_blank());
        assert!(!ParamValue::Int(0).is_blank());
        assert!(!ParamValue::Bool(false).is_blank());
    }

    #[test]
    fn display_forms() {
        assert_eq!(ParamValue::Float(0.01).to_string(), "0.01");
        assert_eq!(ParamValue::Float(1.0).to_string(), "1.0");
        assert_eq!(ParamValue::from(vec![640, 640]).to_string(), "[640, 640]");
        assert_eq!(ParamValue::from(None::<String>), ParamValue::Null);
    }

    #[test]
    fn yaml_values_pick_the_narrowest_variant() {
        let tree: ParamTree =
            serde_yaml::from_str("lr: 0.01\nepochs: 3\ncache: ~\nimgsz: [640, 480]\n").unwrap();
        assert_eq!(tree["lr"], ParamValue::Float(0.01));
        assert_eq!(tree["epochs"], ParamValue::Int(3));
        assert_eq!(tree["cache"], ParamValue::Null);
        assert_eq!(
            tree["imgsz"],
            ParamValue::List(vec![ParamValue::Int(640), ParamValue::Int(480)])
        );
    }

    #[test]
    fn only_numbers_are_metrics() {
        assert_eq!(MetricValue::from(2).as_f64(), Some(2.0));
        assert_eq!(MetricValue::from(0.5).as_f64(), Some(0.5));
        assert_eq!(MetricValue::from(true).as_f64(), None);
        assert_eq!(MetricValue::from("epoch1").as_f64(), None);
    }

    #[test]
    fn run_status_wire_form() {
        let json = serde_json::to_string(&RunStatus::Finished).unwrap();
        assert_eq!(json, "\"FINISHED\"");
        assert_eq!(RunStatus::Killed.to_string(), "KILLED");
    }
}
