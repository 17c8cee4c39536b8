//! Orchestrator jobs for the canopy pipeline.
//!
//! Everything below this crate is a library; only these jobs know about
//! plots, models and the persisted layout.

pub mod dataset;
pub mod evaluate;

pub use dataset::create_dataset;
pub use evaluate::evaluate_plot;
