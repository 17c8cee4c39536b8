//! Plot evaluation: the full pipeline from tiles to classifier output.

use std::time::Instant;

use chrono::{Days, Months, NaiveDate};
use log::info;

use canopy_data::smooth::SmoothingClient;
use canopy_data::{delta, estimator, flatten_deltas, frame, fuse};
use canopy_ml::PixelResult;
use canopy_sentinel::{geometry, tiles};
use canopy_utils::{Error, Result};
use canopy_weather::fetch_weather;

const WEATHER_RETRIES: u32 = 10;
/// Months of weather history fetched ahead of the analysis window.
const WEATHER_LEAD_MONTHS: u32 = 4;

/// Analysis parameters encoded in a trained model's file name:
/// `{id}_{date}_{delta_days}_{delta_threshold}_{days_before}_training_{tag}_{ratio}.csv`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelParams {
    pub delta_days: i64,
    pub delta_threshold: i64,
    pub days_before: i64,
}

/// Parse the parameter segments of a model file name.
pub fn parse_model_name(model: &str) -> Result<ModelParams> {
    let trimmed = model.strip_suffix(".csv").unwrap_or(model);
    let parts: Vec<&str> = trimmed.split('_').collect();
    if parts.len() != 8 {
        return Err(Error::InputDomain(format!(
            "model name has {} parts, expected 8: {model}",
            parts.len()
        )));
    }

    let int_part = |index: usize, name: &str| -> Result<i64> {
        parts[index]
            .parse::<i64>()
            .map_err(|_| Error::InputDomain(format!("model name has non-numeric {name}: {model}")))
    };

    int_part(0, "model id")?;
    let delta_days = int_part(2, "delta days")?;
    let delta_threshold = int_part(3, "delta threshold")?;
    let days_before = int_part(4, "days before")?;
    if parts[5] != "training" {
        return Err(Error::InputDomain(format!(
            "expected 'training' literal in model name, got '{}'",
            parts[5]
        )));
    }
    int_part(7, "training ratio")?;

    Ok(ModelParams {
        delta_days,
        delta_threshold,
        days_before,
    })
}

/// Evaluate one plot at `end_date` with a trained model.
///
/// Runs geometry lookup, tile download, frame building, estimation,
/// smoothing, delta pairing, weather aggregation, fusion and the classifier
/// call, logging each stage's elapsed time. The first failing stage aborts
/// the job.
pub async fn evaluate_plot(
    model: &str,
    forest: &str,
    plot: &str,
    end_date: NaiveDate,
    port: u16,
) -> Result<Vec<PixelResult>> {
    let total = Instant::now();
    let params = parse_model_name(model)?;
    info!("evaluating {forest}/{plot} at {end_date} with {model}: {params:?}");

    let window_days = (params.delta_days + params.delta_threshold) as u64;
    let start_date = end_date
        .checked_sub_days(Days::new(window_days))
        .ok_or_else(|| Error::InputDomain(format!("end date {end_date} underflows")))?;

    let step = Instant::now();
    let plot_geometry = geometry::plot_geometry(forest, plot)?;
    info!("geometry lookup took {:?}", step.elapsed());

    let step = Instant::now();
    let tile_paths = tiles::get_images(&plot_geometry, forest, plot, start_date, end_date, 1).await?;
    info!("tile download took {:?} ({} tiles)", step.elapsed(), tile_paths.len());

    let step = Instant::now();
    let mut pixel_frame = frame::build_frame(forest, plot, &tile_paths)?;
    info!("frame building took {:?}", step.elapsed());

    let step = Instant::now();
    estimator::estimate_pixels(&mut pixel_frame);
    info!("estimation took {:?}", step.elapsed());

    let step = Instant::now();
    let clean_frame = SmoothingClient::new(port)?.clean_frame(&pixel_frame).await?;
    info!("smoothing took {:?}", step.elapsed());

    let step = Instant::now();
    let delta_dataset = delta::build_delta_dataset(
        forest,
        plot,
        params.delta_days,
        params.delta_threshold,
        &clean_frame,
    )?;
    info!("delta pairing took {:?}", step.elapsed());

    let (latitude, longitude) = plot_geometry.centroid()?;

    let step = Instant::now();
    let weather_start = start_date
        .checked_sub_months(Months::new(WEATHER_LEAD_MONTHS))
        .unwrap_or(start_date);
    let weather = fetch_weather(latitude, longitude, weather_start, end_date, WEATHER_RETRIES).await?;
    info!("weather fetch took {:?}", step.elapsed());

    let step = Instant::now();
    let records = flatten_deltas(&delta_dataset);
    let final_dataset = fuse::final_data(&records, &weather, start_date, end_date)?;
    info!("fusion took {:?} ({} records)", step.elapsed(), final_dataset.len());

    let step = Instant::now();
    let results = canopy_ml::run_model(model, &final_dataset, port).await?;
    info!("classifier call took {:?}", step.elapsed());

    info!("total plot evaluation time: {:?}", total.elapsed());
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_name() {
        let params = parse_model_name("3_2024-05-01_7_14_5_training_set_70.csv").unwrap();
        assert_eq!(
            params,
            ModelParams {
                delta_days: 7,
                delta_threshold: 14,
                days_before: 5,
            }
        );
    }

    #[test]
    fn test_parse_model_name_without_extension() {
        assert!(parse_model_name("3_2024-05-01_7_14_5_training_set_70").is_ok());
    }

    #[test]
    fn test_parse_model_name_rejects_wrong_arity() {
        assert!(parse_model_name("model.csv").is_err());
        assert!(parse_model_name("1_2_3_4_5_6_7_8_9.csv").is_err());
    }

    #[test]
    fn test_parse_model_name_requires_training_literal() {
        assert!(parse_model_name("3_2024-05-01_7_14_5_holdout_set_70.csv").is_err());
    }

    #[test]
    fn test_parse_model_name_rejects_non_numeric_params() {
        assert!(parse_model_name("3_2024-05-01_x_14_5_training_set_70.csv").is_err());
    }
}
