//! Wire shapes shared by the model service clients.

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

use canopy_data::{DeltaRecord, FinalRecord};
use canopy_utils::{Error, Result};

pub(crate) fn to_rfc3339(date: NaiveDate) -> String {
    format!("{}T00:00:00Z", date.format("%Y-%m-%d"))
}

pub(crate) fn from_rfc3339(raw: &str) -> Result<NaiveDate> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .map_err(|e| Error::Schema(format!("failed to parse date '{raw}': {e}")))
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireWeatherMetrics {
    pub avg_temperature: f64,
    pub temp_std_dev: f64,
    pub avg_humidity: f64,
    pub humidity_std_dev: f64,
    pub total_precipitation: f64,
    pub dry_days_consecutive: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireDeltaData {
    pub forest: String,
    pub plot: String,
    pub delta_min: i64,
    pub delta_max: i64,
    pub delta: i64,
    pub start_date: String,
    pub end_date: String,
    pub x: i32,
    pub y: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub ndre: f64,
    pub ndmi: f64,
    pub psri: f64,
    pub ndvi: f64,
    pub ndre_derivative: f64,
    pub ndmi_derivative: f64,
    pub psri_derivative: f64,
    pub ndvi_derivative: f64,
    /// Empty when the record carries no label.
    pub label: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireFinalData {
    pub weather: WireWeatherMetrics,
    pub delta: WireDeltaData,
}

impl From<&DeltaRecord> for WireDeltaData {
    fn from(record: &DeltaRecord) -> Self {
        WireDeltaData {
            forest: record.forest.clone(),
            plot: record.plot.clone(),
            delta_min: record.delta_min,
            delta_max: record.delta_max,
            delta: record.delta,
            start_date: to_rfc3339(record.start_date),
            end_date: to_rfc3339(record.end_date),
            x: record.x,
            y: record.y,
            latitude: record.latitude,
            longitude: record.longitude,
            ndre: record.ndre,
            ndmi: record.ndmi,
            psri: record.psri,
            ndvi: record.ndvi,
            ndre_derivative: record.ndre_derivative,
            ndmi_derivative: record.ndmi_derivative,
            psri_derivative: record.psri_derivative,
            ndvi_derivative: record.ndvi_derivative,
            label: record.label.clone().unwrap_or_default(),
        }
    }
}

impl WireDeltaData {
    pub(crate) fn into_record(self) -> Result<DeltaRecord> {
        Ok(DeltaRecord {
            forest: self.forest,
            plot: self.plot,
            delta_min: self.delta_min,
            delta_max: self.delta_max,
            delta: self.delta,
            start_date: from_rfc3339(&self.start_date)?,
            end_date: from_rfc3339(&self.end_date)?,
            x: self.x,
            y: self.y,
            latitude: self.latitude,
            longitude: self.longitude,
            ndre: self.ndre,
            ndmi: self.ndmi,
            psri: self.psri,
            ndvi: self.ndvi,
            ndre_derivative: self.ndre_derivative,
            ndmi_derivative: self.ndmi_derivative,
            psri_derivative: self.psri_derivative,
            ndvi_derivative: self.ndvi_derivative,
            label: if self.label.is_empty() {
                None
            } else {
                Some(self.label)
            },
        })
    }
}

impl From<&FinalRecord> for WireFinalData {
    fn from(record: &FinalRecord) -> Self {
        WireFinalData {
            weather: WireWeatherMetrics {
                avg_temperature: record.avg_temperature,
                temp_std_dev: record.temp_std_dev,
                avg_humidity: record.avg_humidity,
                humidity_std_dev: record.humidity_std_dev,
                total_precipitation: record.total_precipitation,
                dry_days_consecutive: record.dry_days_consecutive,
            },
            delta: WireDeltaData {
                forest: record.forest.clone(),
                plot: record.plot.clone(),
                delta_min: record.delta_min,
                delta_max: record.delta_max,
                delta: record.delta,
                start_date: to_rfc3339(record.start_date),
                end_date: to_rfc3339(record.end_date),
                x: record.x,
                y: record.y,
                latitude: record.latitude,
                longitude: record.longitude,
                ndre: record.ndre,
                ndmi: record.ndmi,
                psri: record.psri,
                ndvi: record.ndvi,
                ndre_derivative: record.ndre_derivative,
                ndmi_derivative: record.ndmi_derivative,
                psri_derivative: record.psri_derivative,
                ndvi_derivative: record.ndvi_derivative,
                label: record.label.clone().unwrap_or_default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_round_trip() {
        let date = NaiveDate::from_ymd_opt(2024, 7, 15).unwrap();
        let raw = to_rfc3339(date);
        assert_eq!(raw, "2024-07-15T00:00:00Z");
        assert_eq!(from_rfc3339(&raw).unwrap(), date);
    }

    #[test]
    fn test_absent_label_travels_as_empty_string() {
        let record = DeltaRecord {
            forest: "f".to_string(),
            plot: "p".to_string(),
            delta_min: 5,
            delta_max: 10,
            delta: 7,
            start_date: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 7, 8).unwrap(),
            x: 1,
            y: 2,
            latitude: -23.0,
            longitude: -46.0,
            ndre: 0.1,
            ndmi: 0.2,
            psri: 0.3,
            ndvi: 0.4,
            ndre_derivative: 0.01,
            ndmi_derivative: 0.02,
            psri_derivative: 0.03,
            ndvi_derivative: 0.04,
            label: None,
        };
        let wire = WireDeltaData::from(&record);
        assert_eq!(wire.label, "");
        let back = wire.into_record().unwrap();
        assert_eq!(back, record);
    }
}
