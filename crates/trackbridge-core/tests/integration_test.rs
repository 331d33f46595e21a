//! Integration tests: the adapter writing into a local file store.

use std::collections::HashMap;
use std::fs;

use tempfile::TempDir;
use trackbridge_core::{
    AdapterState, FileStore, MetricValue, ParamTree, ParamValue, RunConfig, RunStatus, TrackError,
    TrackingAdapter, TrackingBackend,
};

fn make_adapter(tmp: &TempDir, run: &str) -> TrackingAdapter {
    let config = RunConfig::new(run)
        .with_experiment("file_store_test")
        .with_tracking_uri(tmp.path().join("mlruns").display().to_string())
        .with_weights("yolov5s.pt")
        .with_option("epochs", 3)
        .with_option(
            "hyp",
            ParamValue::Nested(
                serde_yaml::from_str("lr0: 0.01\nmomentum: 0.937\n").unwrap(),
            ),
        );
    TrackingAdapter::new(&config)
}

fn open_store(tmp: &TempDir) -> FileStore {
    FileStore::open(tmp.path().join("mlruns")).unwrap()
}

#[test]
fn test_run_is_created_with_flattened_params() {
    let tmp = TempDir::new().unwrap();
    let mut adapter = make_adapter(&tmp, "exp1");
    assert_eq!(adapter.state(), AdapterState::Active);
    let run_id = adapter.run_id().unwrap().to_string();

    let store = open_store(&tmp);
    let params = store.params(&run_id).unwrap();
    assert_eq!(params.get("epochs").map(String::as_str), Some("3"));
    assert_eq!(params.get("hyp/lr0").map(String::as_str), Some("0.01"));
    assert_eq!(params.get("hyp/momentum").map(String::as_str), Some("0.937"));
    assert_eq!(params.get("weights").map(String::as_str), Some("yolov5s.pt"));

    let run = store.get_run(&run_id).unwrap();
    assert_eq!(run.info.run_name, "exp1");
    assert_eq!(run.info.status, RunStatus::Running);
    assert_eq!(run.tag("mlflow.runName"), Some("exp1"));

    adapter.finish_run().unwrap();
}

#[test]
fn test_metrics_written_to_parquet() {
    let tmp = TempDir::new().unwrap();
    let mut adapter = make_adapter(&tmp, "metrics");
    let run_id = adapter.run_id().unwrap().to_string();

    for epoch in 0..5u64 {
        let mut m = HashMap::new();
        m.insert("train/box_loss".to_string(), MetricValue::Float(1.0 - epoch as f64 * 0.1));
        m.insert("metrics/mAP:0.5".to_string(), MetricValue::Float(epoch as f64 * 0.1));
        m.insert("note".to_string(), MetricValue::from("ignored"));
        adapter.log_metrics(&m, Some(epoch), false).unwrap();
    }
    adapter.finish_run().unwrap();

    let store = open_store(&tmp);
    let rows = store.read_metrics(&run_id).unwrap();
    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(|m| m.key != "note"));

    let latest = store.latest_metrics(&run_id).unwrap();
    assert_eq!(latest["metrics/mAP-0.5"].step, Some(4));
    assert!((latest["train/box_loss"].value - 0.6).abs() < 1e-9);
}

#[test]
fn test_second_param_call_is_noop_on_store() {
    let tmp = TempDir::new().unwrap();
    let mut adapter = make_adapter(&tmp, "params");
    let run_id = adapter.run_id().unwrap().to_string();

    // Same key, different value: the run already has `epochs`, so it is skipped
    // instead of tripping the store's write-once rule.
    let mut tree = ParamTree::new();
    tree.insert("epochs".into(), ParamValue::Int(300));
    tree.insert("imgsz".into(), ParamValue::Int(640));
    adapter.log_params(&tree);

    let params = open_store(&tmp).params(&run_id).unwrap();
    assert_eq!(params.get("epochs").map(String::as_str), Some("3"));
    assert_eq!(params.get("imgsz").map(String::as_str), Some("640"));

    adapter.finish_run().unwrap();
}

#[test]
fn test_store_rejects_param_overwrite() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let exp = store.get_or_create_experiment("direct").unwrap();
    let run = store.create_run(&exp, "r").unwrap();

    store.log_param(&run.run_id, "lr", "0.1").unwrap();
    store.log_param(&run.run_id, "lr", "0.1").unwrap();
    let err = store.log_param(&run.run_id, "lr", "0.2").unwrap_err();
    assert!(matches!(err, TrackError::ParamConflict { .. }));
}

#[test]
fn test_artifacts_file_and_directory() {
    let tmp = TempDir::new().unwrap();
    let mut adapter = make_adapter(&tmp, "artifacts");
    let run_id = adapter.run_id().unwrap().to_string();

    let src = tmp.path().join("outputs");
    fs::create_dir_all(src.join("plots")).unwrap();
    fs::write(src.join("plots/confusion_matrix.png"), b"png").unwrap();
    fs::write(src.join("plots/results.csv"), b"epoch,loss").unwrap();
    fs::write(src.join("opt.yaml"), b"epochs: 3").unwrap();

    adapter.log_artifacts(&src.join("plots"), None).unwrap();
    adapter.log_artifacts(&src.join("opt.yaml"), Some("config")).unwrap();
    adapter.log_artifacts(&src.join("opt.yaml"), None).unwrap();
    adapter.finish_run().unwrap();

    let mut paths: Vec<String> = open_store(&tmp)
        .list_artifacts(&run_id)
        .unwrap()
        .into_iter()
        .map(|a| a.path)
        .collect();
    paths.sort();
    assert_eq!(
        paths,
        vec![
            "config/opt.yaml",
            "opt.yaml",
            "plots/confusion_matrix.png",
            "plots/results.csv",
        ]
    );
}

#[test]
fn test_log_model_packages_descriptor() {
    let tmp = TempDir::new().unwrap();
    let mut adapter = make_adapter(&tmp, "model");
    let run_id = adapter.run_id().unwrap().to_string();

    let weights = tmp.path().join("best.pt");
    fs::write(&weights, b"trained").unwrap();
    adapter.log_model(&weights, None).unwrap();
    adapter.finish_run().unwrap();

    let store = open_store(&tmp);
    let paths: Vec<String> = store
        .list_artifacts(&run_id)
        .unwrap()
        .into_iter()
        .map(|a| a.path)
        .collect();
    assert!(paths.contains(&"yolov5s/MLmodel".to_string()));
    assert!(paths.contains(&"yolov5s/data/best.pt".to_string()));

    let run = store.get_run(&run_id).unwrap();
    assert!(run.tag("mlflow.log-model.history").is_some());
}

#[test]
fn test_run_status_written_on_finish() {
    let tmp = TempDir::new().unwrap();
    let mut adapter = make_adapter(&tmp, "status");
    let run_id = adapter.run_id().unwrap().to_string();
    adapter.finish_run().unwrap();

    let store = open_store(&tmp);
    let run = store.get_run(&run_id).unwrap();
    assert_eq!(run.info.status, RunStatus::Finished);
    assert!(run.info.end_time.is_some());

    // An ended run refuses further writes at the store level.
    let err = store.log_param(&run_id, "late", "1").unwrap_err();
    assert!(matches!(err, TrackError::RunNotActive(_)));
}

#[test]
fn test_runs_share_experiment() {
    let tmp = TempDir::new().unwrap();
    let mut a = make_adapter(&tmp, "a");
    let mut b = make_adapter(&tmp, "b");
    a.finish_run().unwrap();
    b.finish_run().unwrap();

    let store = open_store(&tmp);
    let experiments = store.list_experiments().unwrap();
    assert_eq!(experiments.len(), 1);
    let runs = store.list_runs(&experiments[0].experiment_id).unwrap();
    assert_eq!(runs.len(), 2);
}

#[test]
fn test_unwritable_store_disables_tracking() {
    let tmp = TempDir::new().unwrap();
    let blocker = tmp.path().join("not_a_dir");
    fs::write(&blocker, b"file").unwrap();

    let config = RunConfig::new("r").with_tracking_uri(blocker.join("mlruns").display().to_string());
    let mut adapter = TrackingAdapter::new(&config);
    assert_eq!(adapter.state(), AdapterState::Disabled);

    let mut m = HashMap::new();
    m.insert("loss".to_string(), MetricValue::Float(0.5));
    adapter.log_metrics(&m, Some(0), false).unwrap();
    adapter.finish_run().unwrap();
}
