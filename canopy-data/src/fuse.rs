//! Fusion of delta records with weather metrics, and the persisted final
//! dataset.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use canopy_utils::dates::format_date;
use canopy_utils::{properties, Error, Result};
use canopy_weather::{metrics_for_dates, HistoricalWeather, WeatherMetrics};

use crate::DeltaRecord;

/// One row of the final per-pixel feature dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalRecord {
    pub forest: String,
    pub plot: String,
    pub x: i32,
    pub y: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub delta_min: i64,
    pub delta_max: i64,
    pub delta: i64,
    pub ndre: f64,
    pub ndmi: f64,
    pub psri: f64,
    pub ndvi: f64,
    pub ndre_derivative: f64,
    pub ndmi_derivative: f64,
    pub psri_derivative: f64,
    pub ndvi_derivative: f64,
    pub avg_temperature: f64,
    pub temp_std_dev: f64,
    pub avg_humidity: f64,
    pub humidity_std_dev: f64,
    pub total_precipitation: f64,
    pub dry_days_consecutive: i64,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn merge(record: &DeltaRecord, metrics: &WeatherMetrics) -> FinalRecord {
    FinalRecord {
        forest: record.forest.clone(),
        plot: record.plot.clone(),
        x: record.x,
        y: record.y,
        latitude: record.latitude,
        longitude: record.longitude,
        start_date: record.start_date,
        end_date: record.end_date,
        delta_min: record.delta_min,
        delta_max: record.delta_max,
        delta: record.delta,
        ndre: record.ndre,
        ndmi: record.ndmi,
        psri: record.psri,
        ndvi: record.ndvi,
        ndre_derivative: record.ndre_derivative,
        ndmi_derivative: record.ndmi_derivative,
        psri_derivative: record.psri_derivative,
        ndvi_derivative: record.ndvi_derivative,
        avg_temperature: metrics.avg_temperature,
        temp_std_dev: metrics.temp_std_dev,
        avg_humidity: metrics.avg_humidity,
        humidity_std_dev: metrics.humidity_std_dev,
        total_precipitation: metrics.total_precipitation,
        dry_days_consecutive: metrics.dry_days_consecutive,
        label: record.label.clone(),
        created_at: Utc::now(),
    }
}

/// Join every delta record with the first weather metrics entry whose date
/// falls inside `[start_date, end_date]`. A record with no matching day
/// fails the whole stage.
pub fn build_final_dataset(
    records: &[DeltaRecord],
    metrics: &BTreeMap<NaiveDate, WeatherMetrics>,
) -> Result<Vec<FinalRecord>> {
    records
        .par_iter()
        .map(|record| {
            let matched = metrics
                .range(record.start_date..=record.end_date)
                .next()
                .map(|(_, m)| m);
            match matched {
                Some(m) => Ok(merge(record, m)),
                None => Err(Error::NotFound(format!(
                    "weather not found for {} to {}",
                    record.start_date, record.end_date
                ))),
            }
        })
        .collect()
}

/// Filter delta records to the analysis window, derive window metrics for
/// their end dates and fuse.
pub fn final_data(
    records: &[DeltaRecord],
    weather: &HistoricalWeather,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Result<Vec<FinalRecord>> {
    let filtered: Vec<DeltaRecord> = records
        .iter()
        .filter(|r| {
            let in_window = |d: NaiveDate| d >= start_date && d <= end_date;
            in_window(r.start_date) || in_window(r.end_date)
        })
        .cloned()
        .collect();

    let target_dates: Vec<NaiveDate> = filtered.iter().map(|r| r.end_date).collect();
    let metrics = metrics_for_dates(&target_dates, weather);
    build_final_dataset(&filtered, &metrics)
}

fn final_file_path(forest: &str, plot: &str, date: NaiveDate, min: i64, max: i64) -> PathBuf {
    PathBuf::from(properties::data_path(&format!(
        "final/{forest}_{plot}_{}_{min}_{max}.csv",
        format_date(&date)
    )))
}

/// Persist a run's final dataset under its canonical name.
pub fn save_final_data(records: &[FinalRecord], date: NaiveDate) -> Result<()> {
    let first = records
        .first()
        .ok_or_else(|| Error::InputDomain("no final data to save".to_string()))?;
    let path = final_file_path(&first.forest, &first.plot, date, first.delta_min, first.delta_max);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(&path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    info!("final data saved to {}", path.display());
    Ok(())
}

/// A previously persisted final dataset, if one exists for these
/// parameters.
pub fn saved_final_data(
    forest: &str,
    plot: &str,
    date: NaiveDate,
    min: i64,
    max: i64,
) -> Result<Option<Vec<FinalRecord>>> {
    let path = final_file_path(forest, plot, date, min, max);
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::Reader::from_reader(File::open(&path)?);
    let records = reader
        .deserialize()
        .collect::<std::result::Result<Vec<FinalRecord>, _>>()?;
    info!("final data already exists at {}", path.display());
    Ok(Some(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;

    fn day(n: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .checked_add_days(Days::new(n))
            .unwrap()
    }

    fn delta_record(start: NaiveDate, end: NaiveDate) -> DeltaRecord {
        DeltaRecord {
            forest: "f".to_string(),
            plot: "p".to_string(),
            x: 1,
            y: 2,
            latitude: -23.0,
            longitude: -46.0,
            start_date: start,
            end_date: end,
            delta_min: 5,
            delta_max: 10,
            delta: (end - start).num_days(),
            ndre: 0.1,
            ndmi: 0.2,
            psri: 0.3,
            ndvi: 0.4,
            ndre_derivative: 0.01,
            ndmi_derivative: 0.02,
            psri_derivative: 0.03,
            ndvi_derivative: 0.04,
            label: None,
        }
    }

    fn metrics(avg_temperature: f64) -> WeatherMetrics {
        WeatherMetrics {
            avg_temperature,
            ..WeatherMetrics::default()
        }
    }

    #[test]
    fn test_join_picks_first_day_inside_the_record_window() {
        let records = vec![delta_record(day(2), day(9))];
        let mut available = BTreeMap::new();
        available.insert(day(0), metrics(10.0)); // before the window
        available.insert(day(5), metrics(20.0)); // first inside
        available.insert(day(8), metrics(30.0)); // later inside
        let fused = build_final_dataset(&records, &available).unwrap();
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].avg_temperature, 20.0);
    }

    #[test]
    fn test_missing_weather_day_fails_and_names_the_window() {
        let records = vec![delta_record(day(2), day(9))];
        let available = BTreeMap::new();
        let err = build_final_dataset(&records, &available).unwrap_err();
        assert!(err.to_string().contains("2024-06-03"));
        assert!(err.to_string().contains("2024-06-10"));
    }

    #[test]
    fn test_final_data_filters_to_analysis_window() {
        let inside = delta_record(day(2), day(9));
        let outside = delta_record(day(40), day(47));
        let weather: HistoricalWeather = (0..15)
            .map(|n| {
                (
                    day(n),
                    canopy_weather::Weather {
                        temperature: 20.0,
                        precipitation: 0.0,
                        humidity: 50.0,
                    },
                )
            })
            .collect();
        let fused = final_data(&[inside.clone(), outside], &weather, day(0), day(14)).unwrap();
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].end_date, inside.end_date);
    }

    #[test]
    fn test_final_record_csv_round_trip() {
        let record = merge(&delta_record(day(2), day(9)), &metrics(21.5));

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.serialize(&record).unwrap();
        let raw = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert!(raw.starts_with("forest,plot,x,y,latitude,longitude,start_date,end_date"));

        let mut reader = csv::Reader::from_reader(raw.as_bytes());
        let parsed: Vec<FinalRecord> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], record);
    }

    #[test]
    fn test_save_rejects_empty_dataset() {
        assert!(save_final_data(&[], day(0)).is_err());
    }
}
