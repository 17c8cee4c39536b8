//! Thin RPC clients for the external model services.

pub mod classifier;
pub mod clustering;
mod wire;

use serde::Deserialize;

/// One label with its predicted probability.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LabelProbability {
    pub label: String,
    pub probability: f64,
}

/// Classification result of one pixel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PixelResult {
    pub x: i32,
    pub y: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub results: Vec<LabelProbability>,
}

pub use classifier::run_model;
pub use clustering::{clusterize_spread, PestSpreadSample};
