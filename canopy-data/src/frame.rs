//! Temporal frame assembly from a plot's tile library.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::NaiveDate;
use log::info;
use rayon::prelude::*;

use canopy_sentinel::{IndexGrid, PixelStatus, TileGrid};
use canopy_utils::{Error, Result};

use crate::{Coordinate, PixelFrame, PixelObservation};

/// Observations of one date's tile, with its pixel grid size.
struct DateLayer {
    date: NaiveDate,
    width: usize,
    height: usize,
    observations: Vec<PixelObservation>,
}

fn read_layer(date: NaiveDate, path: &PathBuf) -> Result<DateLayer> {
    let tile = TileGrid::load(path)?;
    let indexes = IndexGrid::from_tile(&tile)?;

    let mut observations = Vec::with_capacity(indexes.width * indexes.height);
    for y in 0..indexes.height {
        for x in 0..indexes.width {
            let bands = indexes.bands_at(x, y);
            let (longitude, latitude) = tile.pixel_to_lonlat(x, y);
            observations.push(PixelObservation {
                x: x as i32,
                y: y as i32,
                latitude,
                longitude,
                ndre: bands.ndre,
                ndmi: bands.ndmi,
                psri: bands.psri,
                ndvi: bands.ndvi,
                status: bands.classify(),
            });
        }
    }

    Ok(DateLayer {
        date,
        width: indexes.width,
        height: indexes.height,
        observations,
    })
}

fn assemble_frame(forest: &str, plot: &str, mut layers: Vec<DateLayer>) -> Result<PixelFrame> {
    layers.sort_by_key(|layer| layer.date);

    if let Some(first) = layers.first() {
        for layer in &layers {
            if (layer.width, layer.height) != (first.width, first.height) {
                return Err(Error::Schema(format!(
                    "tile size mismatch for {forest}/{plot}: {}x{} on {} vs {}x{}",
                    layer.width, layer.height, layer.date, first.width, first.height
                )));
            }
        }
    }

    // Drop dates where nothing survived classification.
    let before = layers.len();
    layers.retain(|layer| {
        layer
            .observations
            .iter()
            .any(|obs| obs.status != PixelStatus::Invalid)
    });
    if layers.len() < before {
        info!(
            "discarded {} all-invalid dates for {forest}/{plot}",
            before - layers.len()
        );
    }

    let mut frame: PixelFrame = HashMap::new();
    let mut dates: BTreeSet<NaiveDate> = BTreeSet::new();
    for layer in &layers {
        dates.insert(layer.date);
        for obs in &layer.observations {
            frame
                .entry(obs.coordinate())
                .or_default()
                .insert(layer.date, *obs);
        }
    }

    if frame.is_empty() {
        return Err(Error::NotFound(format!(
            "no data available to create the dataset for forest: {forest}, plot: {plot}"
        )));
    }

    // Frame completeness: every coordinate observes every surviving date.
    for (coordinate, series) in frame.iter_mut() {
        for date in &dates {
            if !series.contains_key(date) {
                series.insert(*date, PixelObservation::unknown(*coordinate));
            }
        }
    }

    Ok(frame)
}

/// Build the `(x, y) → date → observation` cube for a plot.
///
/// All tiles must share one grid size; a date on which every pixel is
/// Invalid is discarded; every surviving coordinate gets an entry for every
/// surviving date, with Unknown placeholders where a tile produced nothing.
/// The first hard error of any tile fails the whole stage.
pub fn build_frame(
    forest: &str,
    plot: &str,
    tiles: &BTreeMap<NaiveDate, PathBuf>,
) -> Result<PixelFrame> {
    let layers: Mutex<Vec<DateLayer>> = Mutex::new(Vec::with_capacity(tiles.len()));
    tiles
        .par_iter()
        .try_for_each(|(date, path)| -> Result<()> {
            let layer = read_layer(*date, path)?;
            layers.lock().unwrap().push(layer);
            Ok(())
        })?;
    let layers = layers.into_inner().unwrap();

    assemble_frame(forest, plot, layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(x: i32, y: i32, status: PixelStatus) -> PixelObservation {
        PixelObservation {
            x,
            y,
            latitude: -23.0,
            longitude: -46.0,
            ndre: 0.3,
            ndmi: 0.2,
            psri: 0.1,
            ndvi: 0.5,
            status,
        }
    }

    fn layer(date: NaiveDate, statuses: &[PixelStatus]) -> DateLayer {
        DateLayer {
            date,
            width: statuses.len(),
            height: 1,
            observations: statuses
                .iter()
                .enumerate()
                .map(|(x, &status)| observation(x as i32, 0, status))
                .collect(),
        }
    }

    fn d(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, n).unwrap()
    }

    #[test]
    fn test_all_invalid_date_is_discarded() {
        let frame = assemble_frame(
            "f",
            "p",
            vec![
                layer(d(1), &[PixelStatus::Valid, PixelStatus::Invalid]),
                layer(d(2), &[PixelStatus::Invalid, PixelStatus::Invalid]),
            ],
        )
        .unwrap();
        for series in frame.values() {
            assert!(series.contains_key(&d(1)));
            assert!(!series.contains_key(&d(2)));
        }
    }

    #[test]
    fn test_size_mismatch_is_fatal() {
        let result = assemble_frame(
            "f",
            "p",
            vec![
                layer(d(1), &[PixelStatus::Valid]),
                layer(d(2), &[PixelStatus::Valid, PixelStatus::Valid]),
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_every_coordinate_observes_every_date() {
        let frame = assemble_frame(
            "f",
            "p",
            vec![
                layer(d(1), &[PixelStatus::Valid, PixelStatus::Unknown]),
                layer(d(2), &[PixelStatus::Valid, PixelStatus::Valid]),
            ],
        )
        .unwrap();
        assert_eq!(frame.len(), 2);
        for series in frame.values() {
            assert_eq!(series.len(), 2);
        }
    }

    #[test]
    fn test_missing_observation_becomes_unknown_placeholder() {
        let mut partial = layer(d(2), &[PixelStatus::Valid, PixelStatus::Valid]);
        partial.observations.pop();
        let frame = assemble_frame(
            "f",
            "p",
            vec![
                layer(d(1), &[PixelStatus::Valid, PixelStatus::Valid]),
                partial,
            ],
        )
        .unwrap();
        let series = &frame[&Coordinate::new(1, 0)];
        let placeholder = series[&d(2)];
        assert_eq!(placeholder.status, PixelStatus::Unknown);
        assert_eq!(placeholder.ndvi, 0.0);
    }

    #[test]
    fn test_empty_input_fails() {
        assert!(assemble_frame("f", "p", Vec::new()).is_err());
    }
}
