//! Local weather retrieval and window statistics.

pub mod client;
pub mod metrics;

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One day of weather at a plot centroid. Humidity is the mean of the
/// per-hour readings on that calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weather {
    pub temperature: f64,
    pub precipitation: f64,
    pub humidity: f64,
}

/// Daily weather keyed by date, chronologically ordered.
pub type HistoricalWeather = BTreeMap<NaiveDate, Weather>;

pub use client::fetch_weather;
pub use metrics::{metrics_for_dates, window_metrics, WeatherMetrics};
