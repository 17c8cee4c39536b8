//! Training dataset builds from labeled field observations.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{Days, Months, NaiveDate};
use log::{info, warn};
use serde::Deserialize;

use canopy_data::smooth::SmoothingClient;
use canopy_data::{delta, estimator, flatten_deltas, frame, fuse, DeltaDataset, DeltaRecord};
use canopy_sentinel::{geometry, tiles};
use canopy_utils::dates::parse_date;
use canopy_utils::{notification, properties, Error, Result};
use canopy_weather::fetch_weather;

const WEATHER_RETRIES: u32 = 10;
const WEATHER_LEAD_MONTHS: u32 = 4;

/// Columns the output CSV is deduplicated on.
const DEDUP_COLUMNS: [&str; 18] = [
    "avg_temperature",
    "temp_std_dev",
    "avg_humidity",
    "humidity_std_dev",
    "total_precipitation",
    "dry_days_consecutive",
    "ndre",
    "ndmi",
    "psri",
    "ndvi",
    "delta_min",
    "delta_max",
    "delta",
    "ndre_derivative",
    "ndmi_derivative",
    "psri_derivative",
    "ndvi_derivative",
    "label",
];

/// One labeled field observation from the training input CSV.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingRow {
    pub date: String,
    pub pest: String,
    pub severity: String,
    pub forest: String,
    pub plot: String,
}

fn samples_for_severity(_severity: &str, dataset_len: usize) -> usize {
    if dataset_len <= 2 {
        dataset_len
    } else {
        dataset_len / 2
    }
}

/// The most-decreasing delta records, labeled with the observed pest.
///
/// Sorted by ndre, ndmi and ndvi derivative ascending, then psri derivative
/// descending, keeping the top `amount`.
fn best_samples(dataset: &DeltaDataset, amount: usize, label: &str) -> Vec<DeltaRecord> {
    let mut records = flatten_deltas(dataset);
    records.sort_by(|a, b| {
        a.ndre_derivative
            .total_cmp(&b.ndre_derivative)
            .then_with(|| a.ndmi_derivative.total_cmp(&b.ndmi_derivative))
            .then_with(|| a.ndvi_derivative.total_cmp(&b.ndvi_derivative))
            .then_with(|| b.psri_derivative.total_cmp(&a.psri_derivative))
    });
    records.truncate(amount);
    for record in &mut records {
        record.label = Some(label.to_string());
    }
    records
}

fn output_path(output_name: &str) -> PathBuf {
    PathBuf::from(properties::data_path(&format!("model/{output_name}")))
}

fn append_to_output(path: &Path, records: &[fuse::FinalRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let exists = path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!exists)
        .from_writer(file);
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

async fn process_row(
    row: &TrainingRow,
    delta_days: i64,
    delta_threshold: i64,
    days_before: i64,
    output: &Path,
    port: u16,
) -> Result<usize> {
    let observation_date = parse_date(&row.date)?;
    let (delta_min, delta_max) = (delta_days, delta_days + delta_threshold);

    let final_data = match fuse::saved_final_data(
        &row.forest,
        &row.plot,
        observation_date,
        delta_min,
        delta_max,
    )? {
        Some(existing) => existing,
        None => {
            let days_to_fetch = (delta_days + delta_threshold + days_before) as u64;
            let end_date = observation_date
                .checked_sub_days(Days::new(days_before as u64))
                .ok_or_else(|| Error::InputDomain(format!("date {observation_date} underflows")))?;
            let start_date = end_date
                .checked_sub_days(Days::new(days_to_fetch))
                .ok_or_else(|| Error::InputDomain(format!("date {end_date} underflows")))?;

            let plot_geometry = geometry::plot_geometry(&row.forest, &row.plot)?;
            let tile_paths = tiles::get_images(
                &plot_geometry,
                &row.forest,
                &row.plot,
                start_date,
                end_date,
                1,
            )
            .await?;

            let (latitude, longitude) = plot_geometry.centroid()?;
            let weather_start = start_date
                .checked_sub_months(Months::new(WEATHER_LEAD_MONTHS))
                .unwrap_or(start_date);
            let weather =
                fetch_weather(latitude, longitude, weather_start, end_date, WEATHER_RETRIES).await?;

            let mut pixel_frame = frame::build_frame(&row.forest, &row.plot, &tile_paths)?;
            estimator::estimate_pixels(&mut pixel_frame);
            let clean_frame = SmoothingClient::new(port)?.clean_frame(&pixel_frame).await?;

            let delta_dataset = delta::build_delta_dataset(
                &row.forest,
                &row.plot,
                delta_min,
                delta_max,
                &clean_frame,
            )?;

            let amount = samples_for_severity(&row.severity, delta_dataset.len());
            let samples = best_samples(&delta_dataset, amount, &row.pest);
            info!(
                "best samples for pest {} with severity {}: {} of {} pixels",
                row.pest,
                row.severity,
                samples.len(),
                delta_dataset.len()
            );

            let created = fuse::final_data(&samples, &weather, start_date, end_date)?;
            fuse::save_final_data(&created, observation_date)?;
            created
        }
    };

    append_to_output(output, &final_data)?;
    Ok(final_data.len())
}

/// Build a training dataset from labeled rows.
///
/// Each row runs the full pipeline (or reuses its saved final data) and
/// appends to the output CSV; the header is written only when the file is
/// created. Per-row failures are collected; the job fails only if every row
/// fails. The output is deduplicated on the feature columns at the end.
pub async fn create_dataset(
    input_name: &str,
    output_name: &str,
    delta_days: i64,
    delta_threshold: i64,
    days_before: i64,
    port: u16,
) -> Result<()> {
    let input_path = properties::data_path(&format!("training_input/{input_name}"));
    let mut reader = csv::Reader::from_path(&input_path)
        .map_err(|e| Error::InputDomain(format!("cannot open {input_path}: {e}")))?;
    let rows = reader
        .deserialize()
        .collect::<std::result::Result<Vec<TrainingRow>, _>>()?;
    if rows.is_empty() {
        return Err(Error::InputDomain("empty csv file given".to_string()));
    }

    info!("creating dataset from {input_path} with {} samples", rows.len());
    let output = output_path(output_name);

    let mut errors: Vec<String> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        match process_row(row, delta_days, delta_threshold, days_before, &output, port).await {
            Ok(count) => info!(
                "processed row {}/{}: forest={}, plot={}, pest={}, severity={}, rows={count}",
                i + 1,
                rows.len(),
                row.forest,
                row.plot,
                row.pest,
                row.severity
            ),
            Err(e) => {
                warn!("row {}/{} failed: {e}", i + 1, rows.len());
                errors.push(format!("{}/{} on {}: {e}", row.forest, row.plot, row.date));
            }
        }
    }

    if errors.len() == rows.len() {
        return Err(Error::InputDomain(format!(
            "all rows failed during dataset creation: {}",
            errors.join("; ")
        )));
    }
    if !errors.is_empty() {
        let summary = format!(
            "Dataset creation completed with {} errors.\nErrors: {}",
            errors.len(),
            errors.join("\n")
        );
        if let Err(e) = notification::send_error_notification(&summary).await {
            warn!("failed to send notification: {e}");
        }
    }

    if let Err(e) = deduplicate_csv(&output) {
        warn!("deduplication failed: {e}");
    }

    info!("dataset created successfully at {}", output.display());
    Ok(())
}

/// Remove duplicate rows from a CSV based on the feature columns,
/// overwriting the file atomically.
fn deduplicate_csv(path: &Path) -> Result<()> {
    let mut reader = csv::Reader::from_reader(File::open(path)?);
    let headers = reader.headers()?.clone();
    let records = reader
        .records()
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let indices: Vec<Option<usize>> = DEDUP_COLUMNS
        .iter()
        .map(|column| headers.iter().position(|h| h == *column))
        .collect();

    let mut seen: HashSet<String> = HashSet::new();
    let mut deduped = Vec::new();
    for record in &records {
        let key: Vec<&str> = indices
            .iter()
            .map(|index| index.and_then(|i| record.get(i)).unwrap_or(""))
            .collect();
        if seen.insert(key.join("||")) {
            deduped.push(record.clone());
        }
    }

    if deduped.len() == records.len() {
        info!("no duplicates found ({} rows)", records.len());
        return Ok(());
    }
    info!(
        "removed {} duplicate rows, {} remain",
        records.len() - deduped.len(),
        deduped.len()
    );

    let tmp_path = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp_path)?;
        writer.write_record(&headers)?;
        for record in &deduped {
            writer.write_record(record)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_data::Coordinate;
    use std::collections::BTreeMap;

    fn record(ndre_derivative: f64, psri_derivative: f64) -> DeltaRecord {
        DeltaRecord {
            forest: "f".to_string(),
            plot: "p".to_string(),
            x: 0,
            y: 0,
            latitude: 0.0,
            longitude: 0.0,
            start_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 8).unwrap(),
            delta_min: 5,
            delta_max: 10,
            delta: 7,
            ndre: 0.1,
            ndmi: 0.2,
            psri: 0.3,
            ndvi: 0.4,
            ndre_derivative,
            ndmi_derivative: 0.0,
            psri_derivative,
            ndvi_derivative: 0.0,
            label: None,
        }
    }

    fn dataset_of(records: Vec<DeltaRecord>) -> DeltaDataset {
        let mut dataset = DeltaDataset::new();
        for (i, record) in records.into_iter().enumerate() {
            let mut by_date = BTreeMap::new();
            by_date.insert(record.end_date, record);
            dataset.insert(Coordinate::new(i as i32, 0), by_date);
        }
        dataset
    }

    #[test]
    fn test_best_samples_prefers_most_decreasing() {
        let dataset = dataset_of(vec![record(0.5, 0.0), record(-0.9, 0.0), record(-0.1, 0.0)]);
        let samples = best_samples(&dataset, 2, "defoliator");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].ndre_derivative, -0.9);
        assert_eq!(samples[1].ndre_derivative, -0.1);
        assert!(samples.iter().all(|s| s.label.as_deref() == Some("defoliator")));
    }

    #[test]
    fn test_best_samples_breaks_ties_with_descending_psri() {
        let dataset = dataset_of(vec![record(0.0, 0.1), record(0.0, 0.9)]);
        let samples = best_samples(&dataset, 1, "x");
        assert_eq!(samples[0].psri_derivative, 0.9);
    }

    #[test]
    fn test_samples_for_severity_halves_large_datasets() {
        assert_eq!(samples_for_severity("high", 2), 2);
        assert_eq!(samples_for_severity("high", 10), 5);
    }

    #[test]
    fn test_deduplicate_csv_keeps_first_occurrence() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model.csv");
        std::fs::write(
            &path,
            "ndre,ndmi,label,extra\n0.1,0.2,a,first\n0.1,0.2,a,second\n0.3,0.2,a,third\n",
        )
        .unwrap();

        deduplicate_csv(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3); // header + 2 unique rows
        assert!(contents.contains("first"));
        assert!(!contents.contains("second"));
        assert!(contents.contains("third"));
    }

    #[test]
    fn test_append_writes_header_only_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        let rows = vec![fuse::FinalRecord {
            forest: "f".to_string(),
            plot: "p".to_string(),
            x: 0,
            y: 0,
            latitude: 0.0,
            longitude: 0.0,
            start_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 8).unwrap(),
            delta_min: 5,
            delta_max: 10,
            delta: 7,
            ndre: 0.1,
            ndmi: 0.2,
            psri: 0.3,
            ndvi: 0.4,
            ndre_derivative: 0.0,
            ndmi_derivative: 0.0,
            psri_derivative: 0.0,
            ndvi_derivative: 0.0,
            avg_temperature: 20.0,
            temp_std_dev: 1.0,
            avg_humidity: 60.0,
            humidity_std_dev: 2.0,
            total_precipitation: 4.0,
            dry_days_consecutive: 3,
            label: Some("pest".to_string()),
            created_at: chrono::Utc::now(),
        }];

        append_to_output(&path, &rows).unwrap();
        append_to_output(&path, &rows).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let header_count = contents
            .lines()
            .filter(|line| line.starts_with("forest,plot"))
            .count();
        assert_eq!(header_count, 1);
        assert_eq!(contents.lines().count(), 3);
    }
}
