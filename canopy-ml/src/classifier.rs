//! Classifier service client.

use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use canopy_data::FinalRecord;
use canopy_utils::{Error, Result};

use crate::wire::WireFinalData;
use crate::PixelResult;

const DEADLINE: Duration = Duration::from_secs(15 * 60);
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;
const MAX_TRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct RunModelRequest {
    model: String,
    data: Vec<WireFinalData>,
}

#[derive(Deserialize)]
struct RunModelResponse {
    results: Vec<PixelResult>,
}

/// Classify a plot's final dataset with a trained model.
pub async fn run_model(
    model: &str,
    final_data: &[FinalRecord],
    port: u16,
) -> Result<Vec<PixelResult>> {
    let request = RunModelRequest {
        model: model.to_string(),
        data: final_data.iter().map(WireFinalData::from).collect(),
    };

    let client = reqwest::Client::builder().timeout(DEADLINE).build()?;
    let url = format!("http://localhost:{port}/run-model");

    let mut last_error = Error::Network("model service unreachable".to_string());
    for attempt in 1..=MAX_TRIES {
        match client.post(&url).json(&request).send().await {
            Ok(response) if response.status().is_success() => {
                let bytes = response.bytes().await?;
                if bytes.len() > MAX_RESPONSE_BYTES {
                    return Err(Error::Network(format!(
                        "classifier response of {} bytes exceeds the {MAX_RESPONSE_BYTES} byte cap",
                        bytes.len()
                    )));
                }
                let parsed: RunModelResponse = serde_json::from_slice(&bytes)?;
                return Ok(parsed.results);
            }
            Ok(response) => {
                warn!(
                    "attempt {attempt}/{MAX_TRIES}: classifier returned {}",
                    response.status()
                );
                last_error = Error::Network(format!(
                    "classifier request failed with status {}",
                    response.status()
                ));
            }
            Err(e) => {
                warn!("attempt {attempt}/{MAX_TRIES}: classifier call failed: {e}");
                last_error = e.into();
            }
        }
        if attempt < MAX_TRIES {
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let raw = r#"{
            "results": [
                {
                    "x": 3, "y": 4,
                    "latitude": -23.1, "longitude": -46.2,
                    "results": [
                        {"label": "healthy", "probability": 0.7},
                        {"label": "defoliator", "probability": 0.3}
                    ]
                }
            ]
        }"#;
        let parsed: RunModelResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.results.len(), 1);
        let pixel = &parsed.results[0];
        assert_eq!((pixel.x, pixel.y), (3, 4));
        assert_eq!(pixel.results[0].label, "healthy");
        assert!((pixel.results[1].probability - 0.3).abs() < 1e-12);
    }
}
