//! Open-Meteo archive client with on-disk caching.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDate;
use log::warn;
use serde::Deserialize;

use canopy_cache::FileCache;
use canopy_utils::dates::{format_date, parse_date};
use canopy_utils::{Error, Result};

use crate::{HistoricalWeather, Weather};

const ARCHIVE_URL: &str = "https://archive-api.open-meteo.com/v1/archive";
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct HourlyData {
    time: Vec<String>,
    relative_humidity_2m: Vec<f64>,
}

#[derive(Deserialize)]
struct DailyData {
    time: Vec<String>,
    temperature_2m_mean: Vec<f64>,
    precipitation_sum: Vec<f64>,
}

#[derive(Deserialize)]
struct WeatherResponse {
    hourly: HourlyData,
    daily: DailyData,
}

/// Mean relative humidity per calendar date.
///
/// Hourly timestamps are grouped by their `YYYY-MM-DD` prefix, which assumes
/// the provider reports hours in the same calendar timezone as the daily
/// series.
fn mean_humidity_by_day(hourly: &HourlyData) -> BTreeMap<String, f64> {
    let mut daily: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (timestamp, humidity) in hourly.time.iter().zip(&hourly.relative_humidity_2m) {
        if timestamp.len() < 10 {
            continue;
        }
        daily
            .entry(timestamp[..10].to_string())
            .or_default()
            .push(*humidity);
    }
    daily
        .into_iter()
        .map(|(date, values)| {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            (date, mean)
        })
        .collect()
}

fn parse_response(response: WeatherResponse) -> Result<HistoricalWeather> {
    let humidity = mean_humidity_by_day(&response.hourly);
    let mut parsed = HistoricalWeather::new();
    for (i, date_str) in response.daily.time.iter().enumerate() {
        let date = parse_date(date_str)?;
        parsed.insert(
            date,
            Weather {
                temperature: response.daily.temperature_2m_mean[i],
                precipitation: response.daily.precipitation_sum[i],
                humidity: humidity.get(date_str).copied().unwrap_or_default(),
            },
        );
    }
    Ok(parsed)
}

/// Fetch daily weather over `[start_date, end_date]` for a coordinate, with
/// up to `retries` attempts and a fixed backoff on failure. Successful
/// responses are cached by `(lat, lon, start, end)`.
pub async fn fetch_weather(
    latitude: f64,
    longitude: f64,
    start_date: NaiveDate,
    end_date: NaiveDate,
    retries: u32,
) -> Result<HistoricalWeather> {
    let cache: FileCache<HistoricalWeather> = FileCache::new("weather");
    let key = cache.generate_key(&[
        format!("{latitude:.6}"),
        format!("{longitude:.6}"),
        format_date(&start_date),
        format_date(&end_date),
    ]);
    if let Some(cached) = cache.get(&key) {
        return Ok(cached);
    }

    let url = format!(
        "{ARCHIVE_URL}?latitude={latitude}&longitude={longitude}&start_date={}&end_date={}\
         &daily=temperature_2m_mean,precipitation_sum&hourly=relative_humidity_2m",
        format_date(&start_date),
        format_date(&end_date),
    );

    let client = reqwest::Client::new();
    for attempt in 1..=retries {
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let body: WeatherResponse = response.json().await?;
                let parsed = parse_response(body)?;
                cache.set(&key, parsed.clone())?;
                return Ok(parsed);
            }
            Ok(response) => {
                warn!(
                    "attempt {attempt}/{retries}: weather request failed with {}",
                    response.status()
                );
            }
            Err(e) => {
                warn!("attempt {attempt}/{retries}: weather request failed: {e}");
            }
        }
        if attempt < retries {
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }

    Err(Error::Network(format!(
        "failed to retrieve weather after {retries} attempts"
    )))
}
