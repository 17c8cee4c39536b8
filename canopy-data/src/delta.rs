//! Derivative records from paired observations of a pixel.

use chrono::Days;
use log::info;

use canopy_utils::{Error, Result};

use crate::{DeltaDataset, DeltaRecord, PixelFrame};

/// Minimum number of valid observations a pixel needs before pairing.
const MIN_OBSERVATIONS: usize = 3;

/// Pair observations of each pixel into derivative records.
///
/// For each start date the earliest end date within
/// `[start + delta_min, start + delta_max]` days is used, and only that one;
/// a candidate past the upper bound ends the scan for that start. Records
/// are keyed by `(x, y, end_date)`. An entirely empty result fails the
/// stage.
pub fn build_delta_dataset(
    forest: &str,
    plot: &str,
    delta_min: i64,
    delta_max: i64,
    clean: &PixelFrame,
) -> Result<DeltaDataset> {
    let mut dataset = DeltaDataset::new();
    let mut found = 0usize;
    let mut skipped = 0usize;

    for (coordinate, series) in clean {
        if series.len() < MIN_OBSERVATIONS {
            skipped += 1;
            continue;
        }

        let dates: Vec<_> = series.keys().copied().collect();
        for (i, &start_date) in dates.iter().enumerate() {
            let min_target = start_date
                .checked_add_days(Days::new(delta_min as u64))
                .unwrap_or(start_date);
            let max_target = start_date
                .checked_add_days(Days::new(delta_max as u64))
                .unwrap_or(start_date);

            for &end_date in &dates[i + 1..] {
                if end_date > max_target {
                    skipped += 1;
                    break;
                }
                if end_date < min_target {
                    continue;
                }

                let start = &series[&start_date];
                let end = &series[&end_date];
                let delta_days = (end_date - start_date).num_days();

                dataset.entry(*coordinate).or_default().insert(
                    end_date,
                    DeltaRecord {
                        forest: forest.to_string(),
                        plot: plot.to_string(),
                        x: end.x,
                        y: end.y,
                        latitude: end.latitude,
                        longitude: end.longitude,
                        start_date,
                        end_date,
                        delta_min,
                        delta_max,
                        delta: delta_days,
                        ndre: end.ndre,
                        ndmi: end.ndmi,
                        psri: end.psri,
                        ndvi: end.ndvi,
                        ndre_derivative: (end.ndre - start.ndre) / delta_days as f64,
                        ndmi_derivative: (end.ndmi - start.ndmi) / delta_days as f64,
                        psri_derivative: (end.psri - start.psri) / delta_days as f64,
                        ndvi_derivative: (end.ndvi - start.ndvi) / delta_days as f64,
                        label: None,
                    },
                );
                found += 1;
                break;
            }
        }
    }

    info!("delta pairing for {forest}/{plot}: {found} records, {skipped} start dates skipped");

    if dataset.is_empty() {
        return Err(Error::NotFound(
            "no valid delta data found. The delta dataset is empty".to_string(),
        ));
    }
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Coordinate, PixelObservation, PixelSeries, PixelStatus};
    use chrono::NaiveDate;
    use std::collections::HashMap;

    fn day(n: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .checked_add_days(Days::new(n))
            .unwrap()
    }

    fn obs(ndvi: f64) -> PixelObservation {
        PixelObservation {
            x: 2,
            y: 5,
            latitude: -23.0,
            longitude: -46.0,
            ndre: ndvi / 2.0,
            ndmi: ndvi / 4.0,
            psri: ndvi / 8.0,
            ndvi,
            status: PixelStatus::Valid,
        }
    }

    fn frame_with_days(days: &[(u64, f64)]) -> PixelFrame {
        let series: PixelSeries = days.iter().map(|&(n, v)| (day(n), obs(v))).collect();
        let mut frame = HashMap::new();
        frame.insert(Coordinate::new(2, 5), series);
        frame
    }

    #[test]
    fn test_earliest_pairing_policy() {
        // Valid days {0, 4, 11, 18} with bounds [5, 10]:
        // day0 finds nothing (day4 too early, day11 too late),
        // day4 pairs with day11, day11 pairs with day18.
        let frame = frame_with_days(&[(0, 0.1), (4, 0.2), (11, 0.4), (18, 0.5)]);
        let dataset = build_delta_dataset("f", "p", 5, 10, &frame).unwrap();
        let records = &dataset[&Coordinate::new(2, 5)];
        assert_eq!(records.len(), 2);
        assert!(records.contains_key(&day(11)));
        assert!(records.contains_key(&day(18)));

        let first = &records[&day(11)];
        assert_eq!(first.start_date, day(4));
        assert_eq!(first.delta, 7);
    }

    #[test]
    fn test_derivative_is_change_per_day() {
        let frame = frame_with_days(&[(0, 0.2), (7, 0.9), (14, 0.9)]);
        let dataset = build_delta_dataset("f", "p", 5, 10, &frame).unwrap();
        let record = &dataset[&Coordinate::new(2, 5)][&day(7)];
        assert_eq!(record.delta, 7);
        assert!((record.ndvi_derivative - (0.9 - 0.2) / 7.0).abs() < 1e-12);
        assert!((record.ndre_derivative - (0.45 - 0.1) / 7.0).abs() < 1e-12);
        assert!(record.delta >= record.delta_min && record.delta <= record.delta_max);
    }

    #[test]
    fn test_pixel_with_too_few_observations_yields_nothing() {
        let frame = frame_with_days(&[(0, 0.2), (7, 0.4)]);
        assert!(build_delta_dataset("f", "p", 5, 10, &frame).is_err());
    }

    #[test]
    fn test_end_values_come_from_end_observation() {
        let frame = frame_with_days(&[(0, 0.2), (7, 0.8), (14, 0.6)]);
        let dataset = build_delta_dataset("f", "p", 5, 10, &frame).unwrap();
        let record = &dataset[&Coordinate::new(2, 5)][&day(7)];
        assert_eq!(record.ndvi, 0.8);
        assert_eq!(record.end_date, day(7));
    }

    #[test]
    fn test_no_pair_within_bounds_fails_stage() {
        let frame = frame_with_days(&[(0, 0.2), (20, 0.4), (40, 0.6)]);
        assert!(build_delta_dataset("f", "p", 5, 10, &frame).is_err());
    }
}
