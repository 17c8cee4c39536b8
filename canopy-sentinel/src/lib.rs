//! Satellite tile access for the canopy pipeline.
//!
//! Covers the raster engine wrapper, spectral index math, per-pixel status
//! classification, plot geometry lookup and the Copernicus download client.

pub mod geometry;
pub mod indices;
pub mod raster;
pub mod status;
pub mod tiles;

pub use indices::IndexGrid;
pub use raster::TileGrid;
pub use status::{BandValues, PixelStatus};
