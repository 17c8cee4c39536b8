//! Shared building blocks for the canopy crates.

pub mod dates;
pub mod error;
pub mod notification;
pub mod properties;

pub use error::{Error, Result};
