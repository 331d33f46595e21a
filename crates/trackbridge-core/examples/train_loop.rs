//! Example of wiring trackbridge into a (simulated) training loop.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use trackbridge_core::telemetry;
use trackbridge_core::{MetricValue, RunConfig, TrackingAdapter};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = telemetry::init_logging("info", None);

    // 1. Describe the run; nested options become "optimizer/lr" etc.
    let config = RunConfig::new("sine_fit")
        .with_experiment("rust_examples")
        .with_option("epochs", 20)
        .with_option(
            "optimizer",
            trackbridge_core::ParamValue::Nested(serde_yaml::from_str("name: sgd\nlr: 0.01\n")?),
        );

    // 2. Start tracking. Falls back to a disabled adapter if the backend is down.
    let mut tracker = TrackingAdapter::new(&config);
    println!("Tracking state: {:?}", tracker.state());

    // 3. Training loop
    for epoch in 0..20u64 {
        let mut metrics = HashMap::new();
        metrics.insert(
            "train:loss".to_string(),
            MetricValue::Float((-(epoch as f64) * 0.2).exp()),
        );
        metrics.insert("lr".to_string(), MetricValue::Float(0.01));
        tracker.log_metrics(&metrics, Some(epoch), false)?;
        thread::sleep(Duration::from_millis(20));
    }

    // 4. Close the run
    tracker.finish_run()?;
    Ok(())
}
