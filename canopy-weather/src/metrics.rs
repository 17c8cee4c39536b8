//! Rolling window statistics over the daily weather series.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::HistoricalWeather;

/// Days of history aggregated ahead of each target date.
pub const WINDOW_DAYS: u64 = 30;

/// Aggregated weather over the window preceding a target date.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WeatherMetrics {
    pub avg_temperature: f64,
    pub temp_std_dev: f64,
    pub avg_humidity: f64,
    pub humidity_std_dev: f64,
    pub total_precipitation: f64,
    pub dry_days_consecutive: i64,
}

fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

fn std_dev(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mean_value = mean(data);
    let variance = data
        .iter()
        .map(|value| (value - mean_value).powi(2))
        .sum::<f64>()
        / data.len() as f64;
    variance.sqrt()
}

/// Longest run of zero-precipitation days, in chronological order.
fn longest_dry_run(precipitations: &[f64]) -> i64 {
    let mut max_dry = 0i64;
    let mut current = 0i64;
    for &precipitation in precipitations {
        if precipitation == 0.0 {
            current += 1;
            max_dry = max_dry.max(current);
        } else {
            current = 0;
        }
    }
    max_dry
}

/// Window statistics for `target_date` over `[target_date − period_days,
/// target_date)`. An empty window yields all zeros.
pub fn window_metrics(
    period_days: u64,
    target_date: NaiveDate,
    historical: &HistoricalWeather,
) -> WeatherMetrics {
    let window_start = target_date
        .checked_sub_days(Days::new(period_days))
        .unwrap_or(NaiveDate::MIN);

    let mut temperatures = Vec::new();
    let mut humidities = Vec::new();
    let mut precipitations = Vec::new();
    for (_, weather) in historical.range(window_start..target_date) {
        temperatures.push(weather.temperature);
        humidities.push(weather.humidity);
        precipitations.push(weather.precipitation);
    }

    WeatherMetrics {
        avg_temperature: mean(&temperatures),
        temp_std_dev: std_dev(&temperatures),
        avg_humidity: mean(&humidities),
        humidity_std_dev: std_dev(&humidities),
        total_precipitation: precipitations.iter().sum(),
        dry_days_consecutive: longest_dry_run(&precipitations),
    }
}

/// Window metrics for every requested date that exists in the daily series.
pub fn metrics_for_dates(
    dates: &[NaiveDate],
    historical: &HistoricalWeather,
) -> BTreeMap<NaiveDate, WeatherMetrics> {
    let mut metrics = BTreeMap::new();
    for &date in dates {
        if historical.contains_key(&date) {
            metrics.insert(date, window_metrics(WINDOW_DAYS, date, historical));
        }
    }
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Weather;
    use chrono::Days;

    fn day(n: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .checked_add_days(Days::new(n))
            .unwrap()
    }

    fn series(precipitation: &[f64]) -> HistoricalWeather {
        precipitation
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                (
                    day(i as u64),
                    Weather {
                        temperature: 20.0,
                        precipitation: p,
                        humidity: 50.0,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_window_precipitation_and_dry_run() {
        // Days T−10 … T−1; T itself must not be counted.
        let mut historical = series(&[0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 5.0, 0.0]);
        let target = day(10);
        historical.insert(
            target,
            Weather {
                temperature: 20.0,
                precipitation: 100.0,
                humidity: 50.0,
            },
        );

        let metrics = window_metrics(10, target, &historical);
        assert_eq!(metrics.total_precipitation, 7.0);
        assert_eq!(metrics.dry_days_consecutive, 5);
    }

    #[test]
    fn test_window_is_half_open() {
        let historical = series(&[1.0, 1.0, 1.0, 1.0]);
        // Window [day1, day3): exactly days 1 and 2.
        let metrics = window_metrics(2, day(3), &historical);
        assert_eq!(metrics.total_precipitation, 2.0);
    }

    #[test]
    fn test_empty_window_is_all_zeros() {
        let metrics = window_metrics(WINDOW_DAYS, day(0), &HistoricalWeather::new());
        assert_eq!(metrics, WeatherMetrics::default());
    }

    #[test]
    fn test_mean_and_std_dev() {
        let mut historical = HistoricalWeather::new();
        for (i, t) in [10.0, 20.0, 30.0].iter().enumerate() {
            historical.insert(
                day(i as u64),
                Weather {
                    temperature: *t,
                    precipitation: 0.0,
                    humidity: 2.0 * t,
                },
            );
        }
        let metrics = window_metrics(10, day(3), &historical);
        assert!((metrics.avg_temperature - 20.0).abs() < 1e-12);
        assert!((metrics.temp_std_dev - (200.0f64 / 3.0).sqrt()).abs() < 1e-9);
        assert!((metrics.avg_humidity - 40.0).abs() < 1e-12);
    }

    #[test]
    fn test_dry_run_at_window_tail() {
        let historical = series(&[3.0, 0.0, 0.0, 0.0]);
        let metrics = window_metrics(4, day(4), &historical);
        assert_eq!(metrics.dry_days_consecutive, 3);
    }

    #[test]
    fn test_metrics_only_for_known_dates() {
        let historical = series(&[0.0, 0.0]);
        let dates = [day(1), day(9)];
        let metrics = metrics_for_dates(&dates, &historical);
        assert!(metrics.contains_key(&day(1)));
        assert!(!metrics.contains_key(&day(9)));
    }
}
