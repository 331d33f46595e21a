//! trackbridge-core: best-effort experiment tracking for training loops.
//!
//! The central design principle: tracking never fails training. A
//! [`TrackingAdapter`] that cannot reach its backend comes up disabled and
//! silently drops everything logged to it.

pub mod adapter;
pub mod backend;
pub mod config;
pub mod error;
pub mod flatten;
pub mod models;
pub mod telemetry;

pub use adapter::{AdapterState, TrackingAdapter};
pub use backend::{FileStore, RestBackend, TrackingBackend};
pub use config::RunConfig;
pub use error::TrackError;
pub use flatten::{flatten, FlatParams};
pub use models::{Metric, MetricBatch, MetricValue, ParamTree, ParamValue, RunStatus};
