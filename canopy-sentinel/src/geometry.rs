//! Plot geometry lookup from the on-disk GeoJSON library.

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use canopy_utils::properties;
use canopy_utils::{Error, Result};

#[derive(Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Deserialize)]
struct Feature {
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
    geometry: GeoJsonGeometry,
}

#[derive(Deserialize)]
struct GeoJsonGeometry {
    #[serde(rename = "type")]
    kind: String,
    coordinates: serde_json::Value,
}

/// Polygon rings of one plot, WGS-84 `(lon, lat)`.
#[derive(Debug, Clone)]
pub struct PlotGeometry {
    /// Outer ring of each polygon of the plot.
    pub rings: Vec<Vec<(f64, f64)>>,
}

impl PlotGeometry {
    /// Bounding box as `(min_lon, min_lat, max_lon, max_lat)`.
    pub fn bbox(&self) -> (f64, f64, f64, f64) {
        let mut bbox = (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (lon, lat) in self.rings.iter().flatten() {
            bbox.0 = bbox.0.min(*lon);
            bbox.1 = bbox.1.min(*lat);
            bbox.2 = bbox.2.max(*lon);
            bbox.3 = bbox.3.max(*lat);
        }
        bbox
    }

    /// Area-weighted centroid as `(latitude, longitude)`.
    ///
    /// Shoelace accumulation over the outer rings; a degenerate geometry
    /// with zero area is rejected.
    pub fn centroid(&self) -> Result<(f64, f64)> {
        let mut area_sum = 0.0;
        let mut cx = 0.0;
        let mut cy = 0.0;
        for ring in &self.rings {
            if ring.len() < 3 {
                continue;
            }
            for i in 0..ring.len() {
                let (x0, y0) = ring[i];
                let (x1, y1) = ring[(i + 1) % ring.len()];
                let cross = x0 * y1 - x1 * y0;
                area_sum += cross;
                cx += (x0 + x1) * cross;
                cy += (y0 + y1) * cross;
            }
        }
        if area_sum.abs() < f64::EPSILON {
            return Err(Error::Schema("plot geometry has zero area".to_string()));
        }
        let area = area_sum / 2.0;
        Ok((cy / (6.0 * area), cx / (6.0 * area)))
    }

    /// GeoJSON rendering of the plot polygon, for the tile request payload.
    pub fn to_geojson(&self) -> serde_json::Value {
        let polygons: Vec<serde_json::Value> = self
            .rings
            .iter()
            .map(|ring| {
                let coords: Vec<[f64; 2]> = ring.iter().map(|&(lon, lat)| [lon, lat]).collect();
                serde_json::json!([coords])
            })
            .collect();
        if polygons.len() == 1 {
            serde_json::json!({ "type": "Polygon", "coordinates": polygons[0] })
        } else {
            serde_json::json!({ "type": "MultiPolygon", "coordinates": polygons })
        }
    }
}

fn geojson_dir() -> PathBuf {
    PathBuf::from(properties::data_path("geojsons"))
}

fn parse_outer_rings(geometry: &GeoJsonGeometry) -> Result<Vec<Vec<(f64, f64)>>> {
    fn ring_from(value: &serde_json::Value) -> Result<Vec<(f64, f64)>> {
        let positions = value
            .as_array()
            .ok_or_else(|| Error::Schema("polygon ring is not an array".to_string()))?;
        positions
            .iter()
            .map(|p| {
                let pair = p
                    .as_array()
                    .filter(|a| a.len() >= 2)
                    .ok_or_else(|| Error::Schema("position is not a [lon, lat] pair".to_string()))?;
                Ok((
                    pair[0].as_f64().unwrap_or_default(),
                    pair[1].as_f64().unwrap_or_default(),
                ))
            })
            .collect()
    }

    match geometry.kind.as_str() {
        "Polygon" => {
            let rings = geometry
                .coordinates
                .as_array()
                .ok_or_else(|| Error::Schema("polygon has no rings".to_string()))?;
            let outer = rings
                .first()
                .ok_or_else(|| Error::Schema("polygon has no outer ring".to_string()))?;
            Ok(vec![ring_from(outer)?])
        }
        "MultiPolygon" => {
            let polygons = geometry
                .coordinates
                .as_array()
                .ok_or_else(|| Error::Schema("multipolygon has no polygons".to_string()))?;
            polygons
                .iter()
                .map(|polygon| {
                    let rings = polygon
                        .as_array()
                        .ok_or_else(|| Error::Schema("polygon has no rings".to_string()))?;
                    let outer = rings
                        .first()
                        .ok_or_else(|| Error::Schema("polygon has no outer ring".to_string()))?;
                    ring_from(outer)
                })
                .collect()
        }
        other => Err(Error::Schema(format!("unsupported geometry type {other}"))),
    }
}

fn load_collection(forest: &str) -> Result<FeatureCollection> {
    let path = geojson_dir().join(format!("{forest}.geojson"));
    let raw = fs::read_to_string(&path)
        .map_err(|_| Error::NotFound(format!("no geojson for forest {forest}")))?;
    Ok(serde_json::from_str(&raw)?)
}

/// Geometry of one plot, looked up by the `plot_id` feature property.
pub fn plot_geometry(forest: &str, plot: &str) -> Result<PlotGeometry> {
    let collection = load_collection(forest)?;
    for feature in &collection.features {
        let matches = feature
            .properties
            .get("plot_id")
            .and_then(|v| v.as_str())
            .map(|id| id == plot)
            .unwrap_or(false);
        if matches {
            return Ok(PlotGeometry {
                rings: parse_outer_rings(&feature.geometry)?,
            });
        }
    }
    Err(Error::NotFound(format!(
        "geometry not found for forest {forest} and plot {plot}"
    )))
}

/// All `plot_id` values of a forest's GeoJSON.
pub fn plot_ids(forest: &str) -> Result<Vec<String>> {
    let collection = load_collection(forest)?;
    Ok(collection
        .features
        .iter()
        .filter_map(|f| f.properties.get("plot_id").and_then(|v| v.as_str()))
        .map(str::to_string)
        .collect())
}

/// Forest names with a GeoJSON file in the library.
pub fn list_forests() -> Result<Vec<String>> {
    let mut forests = Vec::new();
    for entry in fs::read_dir(geojson_dir())? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(stem) = name.strip_suffix(".geojson") {
            forests.push(stem.to_string());
        }
    }
    forests.sort();
    Ok(forests)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLOT_GEOJSON: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": {"plot_id": "A-01"},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[-46.0, -23.0], [-45.9, -23.0], [-45.9, -22.9], [-46.0, -22.9], [-46.0, -23.0]]]
                }
            }
        ]
    }"#;

    fn geometry() -> PlotGeometry {
        let collection: FeatureCollection = serde_json::from_str(PLOT_GEOJSON).unwrap();
        PlotGeometry {
            rings: parse_outer_rings(&collection.features[0].geometry).unwrap(),
        }
    }

    #[test]
    fn test_bbox() {
        let (min_lon, min_lat, max_lon, max_lat) = geometry().bbox();
        assert_eq!(min_lon, -46.0);
        assert_eq!(min_lat, -23.0);
        assert_eq!(max_lon, -45.9);
        assert_eq!(max_lat, -22.9);
    }

    #[test]
    fn test_centroid_of_square() {
        let (lat, lon) = geometry().centroid().unwrap();
        assert!((lon - -45.95).abs() < 1e-9);
        assert!((lat - -22.95).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_geometry_rejected() {
        let geometry = PlotGeometry {
            rings: vec![vec![(0.0, 0.0), (1.0, 1.0)]],
        };
        assert!(geometry.centroid().is_err());
    }

    #[test]
    fn test_geojson_round_trip_shape() {
        let value = geometry().to_geojson();
        assert_eq!(value["type"], "Polygon");
        assert_eq!(value["coordinates"][0].as_array().unwrap().len(), 5);
    }
}
