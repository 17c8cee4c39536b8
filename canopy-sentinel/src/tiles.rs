//! Copernicus tile download client and the on-disk tile library.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use log::{info, warn};
use serde::Deserialize;

use canopy_utils::dates::{format_date, DateRange};
use canopy_utils::properties::{self, Credential};
use canopy_utils::{Error, Result};

use crate::geometry::PlotGeometry;
use crate::indices::IndexGrid;
use crate::raster::{reproject_auto_utm, TileGrid};
use crate::status::PixelStatus;

const PROCESS_URL: &str = "https://sh.dataspace.copernicus.eu/api/v1/process";
const MAX_TRIES: u32 = 10;
const RETRY_BACKOFF: Duration = Duration::from_secs(5);
/// Ground resolution of the requested bands, meters per pixel.
const RESOLUTION_M: f64 = 10.0;
/// The process API rejects outputs larger than this per axis.
const MAX_AXIS_PIXELS: usize = 2500;

/// Bands requested from the process API, in the order the index calculator
/// expects them.
const EVALSCRIPT: &str = r#"
//VERSION=3
function setup() {
  return {
    input: ["B05", "B08", "B11", "B02", "B04", "B06", "CLD", "SCL"],
    output: {
      id: "default",
      bands: 8,
      sampleType: SampleType.FLOAT32,
    },
  }
}

function evaluatePixel(sample) {
  return [sample.B05, sample.B08, sample.B11, sample.B02, sample.B04, sample.B06, sample.CLD, sample.SCL];
}
"#;

fn pixels_for_distance(degrees: f64) -> usize {
    let pixels = degrees * (111_000.0 / RESOLUTION_M);
    (pixels.max(1.0) as usize).min(MAX_AXIS_PIXELS)
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Client-credentials token exchange for one credential pair.
async fn fetch_token(
    client: &reqwest::Client,
    token_url: &str,
    credential: &Credential,
) -> Result<String> {
    let params = [
        ("grant_type", "client_credentials"),
        ("client_id", credential.client_id.as_str()),
        ("client_secret", credential.client_secret.as_str()),
    ];
    let response = client.post(token_url).form(&params).send().await?;
    if !response.status().is_success() {
        return Err(Error::Auth(format!(
            "token request failed with status {}",
            response.status()
        )));
    }
    let token: TokenResponse = response.json().await?;
    Ok(token.access_token)
}

/// Request one tile from the process API.
///
/// Credential pairs are tried in order; within a pair the request is retried
/// with a fixed backoff. An unauthorized response moves on to the next pair
/// immediately.
pub async fn request_image(
    start: NaiveDate,
    end: NaiveDate,
    geometry: &PlotGeometry,
) -> Result<Vec<u8>> {
    let (min_lon, min_lat, max_lon, max_lat) = geometry.bbox();
    let width_pixels = pixels_for_distance(max_lon - min_lon);
    let height_pixels = pixels_for_distance(max_lat - min_lat);

    let payload = serde_json::json!({
        "input": {
            "bounds": { "geometry": geometry.to_geojson() },
            "data": [{
                "dataFilter": {
                    "timeRange": {
                        "from": format!("{}T00:00:00Z", format_date(&start)),
                        "to": format!("{}T23:59:59Z", format_date(&end)),
                    }
                },
                "type": "sentinel-2-l2a",
            }],
        },
        "output": {
            "width": width_pixels,
            "height": height_pixels,
            "responses": [{
                "identifier": "default",
                "format": { "type": "image/tiff" },
            }],
        },
        "evalscript": EVALSCRIPT,
        "mosaicking": "mostRecent",
    });

    let credentials = properties::copernicus_credentials()?;
    let token_url = properties::copernicus_token_url()?;
    let client = reqwest::Client::new();

    let mut last_error = Error::Network("no credentials attempted".to_string());
    for credential in &credentials {
        let token = match fetch_token(&client, &token_url, credential).await {
            Ok(token) => token,
            Err(e) => {
                warn!("token exchange failed for {}: {e}", credential.client_id);
                last_error = e;
                continue;
            }
        };

        for attempt in 1..=MAX_TRIES {
            let response = client
                .post(PROCESS_URL)
                .bearer_auth(&token)
                .json(&payload)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    let bytes = response.bytes().await?;
                    if bytes.is_empty() {
                        return Err(Error::NotFound("tile empty".to_string()));
                    }
                    return Ok(bytes.to_vec());
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if status == reqwest::StatusCode::FORBIDDEN {
                        last_error = Error::Auth(
                            "unauthorized access, check your client ID and secret".to_string(),
                        );
                        break;
                    }
                    warn!("attempt {attempt}/{MAX_TRIES} failed with {status}: {body}");
                    last_error = Error::Network(format!("tile request failed with {status}"));
                }
                Err(e) => {
                    warn!("attempt {attempt}/{MAX_TRIES} failed: {e}");
                    last_error = e.into();
                }
            }

            if attempt < MAX_TRIES {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }

    Err(last_error)
}

fn invalid_images_file() -> PathBuf {
    PathBuf::from(properties::data_path("images/invalid_images.json"))
}

fn load_invalid_images() -> Result<Vec<String>> {
    let path = invalid_images_file();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn save_invalid_images(mut names: Vec<String>) -> Result<()> {
    names.sort();
    names.dedup();
    fs::write(invalid_images_file(), serde_json::to_vec(&names)?)?;
    Ok(())
}

/// Whether every pixel of a tile classifies as Invalid.
fn tile_is_all_invalid(tile: &TileGrid) -> Result<bool> {
    let indexes = IndexGrid::from_tile(tile)?;
    for y in 0..indexes.height {
        for x in 0..indexes.width {
            if indexes.bands_at(x, y).classify() != PixelStatus::Invalid {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Collect one tile per acquisition day over `[start, end]`.
///
/// Tiles already in the on-disk library are reused; days in the invalid
/// list are skipped; freshly downloaded tiles are warped into their UTM
/// zone, and a tile whose every pixel is Invalid is deleted and remembered
/// as invalid.
pub async fn get_images(
    geometry: &PlotGeometry,
    forest: &str,
    plot: &str,
    start_date: NaiveDate,
    end_date: NaiveDate,
    interval_days: usize,
) -> Result<BTreeMap<NaiveDate, PathBuf>> {
    let mut images = BTreeMap::new();
    let mut invalid_images = load_invalid_images()?;

    let image_dir = PathBuf::from(properties::data_path(&format!("images/{forest}_{plot}")));
    fs::create_dir_all(&image_dir)?;

    for (i, date) in DateRange(start_date, end_date).enumerate() {
        if interval_days > 1 && i % interval_days != 0 {
            continue;
        }

        let image_name = format!("{forest}_{plot}_{}.tif", format_date(&date));
        let file_name = image_dir.join(&image_name);

        if invalid_images.iter().any(|n| n == &image_name) {
            continue;
        }

        if file_name.exists() {
            images.insert(date, file_name);
            continue;
        }

        let image_bytes = match request_image(date, date, geometry).await {
            Ok(bytes) => bytes,
            Err(Error::NotFound(_)) => {
                invalid_images.push(image_name);
                save_invalid_images(invalid_images.clone())?;
                continue;
            }
            Err(e) => return Err(e),
        };

        let temp_name = image_dir.join(format!("{image_name}.download"));
        fs::write(&temp_name, &image_bytes)?;
        let warp_result = reproject_auto_utm(&temp_name, &file_name);
        let _ = fs::remove_file(&temp_name);
        warp_result?;

        let tile = TileGrid::load(&file_name)?;
        if tile_is_all_invalid(&tile)? {
            info!("tile {image_name} is entirely invalid, skipping");
            if let Err(e) = fs::remove_file(&file_name) {
                warn!("failed to delete invalid tile {image_name}: {e}");
            }
            invalid_images.push(image_name);
            save_invalid_images(invalid_images.clone())?;
            continue;
        }

        images.insert(date, file_name);
    }

    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixels_for_distance_scales_with_resolution() {
        // 0.1 degree at 10 m resolution is 1110 pixels.
        assert_eq!(pixels_for_distance(0.1), 1110);
    }

    #[test]
    fn test_pixels_for_distance_clamps() {
        assert_eq!(pixels_for_distance(0.0), 1);
        assert_eq!(pixels_for_distance(10.0), MAX_AXIS_PIXELS);
    }
}
