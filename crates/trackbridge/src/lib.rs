#![doc = include_str!("../../../README.md")]
//!

//! This crate re-exports the tracking adapter, backends and configuration
//! from `trackbridge-core`.

pub use trackbridge_core::*;
