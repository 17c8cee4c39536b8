//! Raster engine access.
//!
//! The underlying engine is not reentrant: every call into it must hold the
//! process-wide lock taken by [`with_raster_engine`]. Violating this is
//! undefined behavior, so nothing in this module touches GDAL outside the
//! lock, and the rest of the workspace only sees plain owned data
//! ([`TileGrid`]) that is safe to share across threads.

use std::path::Path;
use std::sync::{Mutex, Once};

use gdal::errors::CplErrType;
use gdal::raster::RasterCreationOption;
use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
use gdal::{Dataset, DriverManager};
use log::debug;

use canopy_utils::{Error, Result};

static RASTER_ENGINE_LOCK: Mutex<()> = Mutex::new(());
static INSTALL_HANDLER: Once = Once::new();

/// Run `f` while holding the global raster engine lock.
///
/// Warnings from the engine are suppressed on first use; hard errors still
/// propagate through the individual call results.
pub fn with_raster_engine<R>(f: impl FnOnce() -> R) -> R {
    let _guard = RASTER_ENGINE_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    INSTALL_HANDLER.call_once(|| {
        gdal::config::set_error_handler(|class, code, msg| {
            if class != CplErrType::Warning {
                debug!("raster engine [{code}]: {msg}");
            }
        });
    });
    f()
}

/// A fully materialized tile: every band read into memory together with the
/// per-pixel WGS-84 coordinates, so downstream stages never touch the
/// raster engine again.
#[derive(Debug, Clone)]
pub struct TileGrid {
    pub width: usize,
    pub height: usize,
    pub geo_transform: [f64; 6],
    /// WKT of the tile's spatial reference system.
    pub spatial_ref_wkt: String,
    /// Band-major, row-major within a band.
    bands: Vec<Vec<f64>>,
    /// Row-major `(longitude, latitude)` of each pixel center.
    lonlats: Vec<(f64, f64)>,
}

impl TileGrid {
    /// Open a tile and read all of its bands under the engine lock.
    pub fn load(path: &Path) -> Result<TileGrid> {
        with_raster_engine(|| {
            let dataset = Dataset::open(path)?;
            let (width, height) = dataset.raster_size();
            let geo_transform = dataset.geo_transform()?;

            let band_count = dataset.raster_count();
            let mut bands = Vec::with_capacity(band_count as usize);
            for index in 1..=band_count {
                let band = dataset.rasterband(index)?;
                let buffer =
                    band.read_as::<f64>((0, 0), (width, height), (width, height), None)?;
                bands.push(buffer.data);
            }

            let lonlats = pixel_centers_to_lonlat(&dataset, &geo_transform, width, height)?;
            let spatial_ref_wkt = dataset.spatial_ref()?.to_wkt()?;

            Ok(TileGrid {
                width,
                height,
                geo_transform,
                spatial_ref_wkt,
                bands,
                lonlats,
            })
        })
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Full matrix of one band, row-major.
    pub fn band(&self, index: usize) -> &[f64] {
        &self.bands[index]
    }

    pub fn value(&self, band: usize, x: usize, y: usize) -> f64 {
        self.bands[band][y * self.width + x]
    }

    /// WGS-84 `(longitude, latitude)` of a pixel center.
    pub fn pixel_to_lonlat(&self, x: usize, y: usize) -> (f64, f64) {
        self.lonlats[y * self.width + x]
    }
}

/// Project every pixel center into EPSG:4326 in one bulk transform.
fn pixel_centers_to_lonlat(
    dataset: &Dataset,
    gt: &[f64; 6],
    width: usize,
    height: usize,
) -> Result<Vec<(f64, f64)>> {
    let mut xs = Vec::with_capacity(width * height);
    let mut ys = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            let (px, py) = (x as f64 + 0.5, y as f64 + 0.5);
            xs.push(gt[0] + gt[1] * px + gt[2] * py);
            ys.push(gt[3] + gt[4] * px + gt[5] * py);
        }
    }

    let source = dataset.spatial_ref()?;
    let mut target = SpatialRef::from_epsg(4326)?;
    // GeoJSON and the downstream CSV expect (lon, lat) ordering.
    target.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
    let transform = CoordTransform::new(&source, &target)?;

    let mut zs = vec![0.0; xs.len()];
    transform.transform_coords(&mut xs, &mut ys, &mut zs)?;

    Ok(xs.into_iter().zip(ys).collect())
}

/// UTM EPSG code for a WGS-84 point: 326xx north of the equator, 327xx south.
pub fn utm_epsg_for(lon: f64, lat: f64) -> u32 {
    let zone = ((lon + 180.0) / 6.0).floor() as u32 + 1;
    if lat >= 0.0 {
        32600 + zone
    } else {
        32700 + zone
    }
}

/// Warp a tile into the UTM zone of its centroid, writing a tiled,
/// LZW-compressed GeoTIFF.
pub fn reproject_auto_utm(input_path: &Path, output_path: &Path) -> Result<()> {
    with_raster_engine(|| {
        let source = Dataset::open(input_path)?;
        let (width, height) = source.raster_size();
        let gt = source.geo_transform()?;

        // Image center in the source CRS, then in WGS-84.
        let center_x = gt[0] + gt[1] * (width as f64 / 2.0);
        let center_y = gt[3] + gt[5] * (height as f64 / 2.0);
        let source_sr = source.spatial_ref()?;
        let mut wgs84 = SpatialRef::from_epsg(4326)?;
        wgs84.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        let to_wgs84 = CoordTransform::new(&source_sr, &wgs84)?;
        let mut xs = [center_x];
        let mut ys = [center_y];
        let mut zs = [0.0];
        to_wgs84.transform_coords(&mut xs, &mut ys, &mut zs)?;
        let (lon, lat) = (xs[0], ys[0]);

        let utm = SpatialRef::from_epsg(utm_epsg_for(lon, lat))?;
        let to_utm = CoordTransform::new(&source_sr, &utm)?;

        // Corner-projected bounding box of the output grid.
        let mut cx = [
            gt[0],
            gt[0] + gt[1] * width as f64,
            gt[0],
            gt[0] + gt[1] * width as f64,
        ];
        let mut cy = [
            gt[3],
            gt[3],
            gt[3] + gt[5] * height as f64,
            gt[3] + gt[5] * height as f64,
        ];
        let mut cz = [0.0; 4];
        to_utm.transform_coords(&mut cx, &mut cy, &mut cz)?;
        let (min_x, max_x) = (
            cx.iter().cloned().fold(f64::INFINITY, f64::min),
            cx.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        );
        let (min_y, max_y) = (
            cy.iter().cloned().fold(f64::INFINITY, f64::min),
            cy.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        );

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let options = [
            RasterCreationOption {
                key: "TILED",
                value: "YES",
            },
            RasterCreationOption {
                key: "COMPRESS",
                value: "LZW",
            },
        ];
        let output_name = output_path
            .to_str()
            .ok_or_else(|| Error::Schema(format!("non-utf8 path {output_path:?}")))?;
        let mut target = driver.create_with_band_type_with_options::<f32, _>(
            output_name,
            width as isize,
            height as isize,
            source.raster_count(),
            &options,
        )?;
        target.set_spatial_ref(&utm)?;
        target.set_geo_transform(&[
            min_x,
            (max_x - min_x) / width as f64,
            0.0,
            max_y,
            0.0,
            -(max_y - min_y) / height as f64,
        ])?;

        gdal::raster::reproject(&source, &target)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::utm_epsg_for;

    #[test]
    fn test_utm_epsg_northern_hemisphere() {
        // Berlin, zone 33N
        assert_eq!(utm_epsg_for(13.4, 52.5), 32633);
    }

    #[test]
    fn test_utm_epsg_southern_hemisphere() {
        // São Paulo region, zone 23S
        assert_eq!(utm_epsg_for(-46.6, -23.5), 32723);
    }

    #[test]
    fn test_utm_epsg_zone_edges() {
        assert_eq!(utm_epsg_for(-180.0, 10.0), 32601);
        assert_eq!(utm_epsg_for(179.9, 10.0), 32660);
    }
}
