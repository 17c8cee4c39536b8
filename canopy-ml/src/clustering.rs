//! Pest clustering service client.

use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use canopy_data::DeltaRecord;
use canopy_utils::{Error, Result};

use crate::wire::WireDeltaData;

const DEADLINE: Duration = Duration::from_secs(60);
const MAX_TRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// One clustered delta sample.
#[derive(Debug, Clone, PartialEq)]
pub struct PestSpreadSample {
    pub data: DeltaRecord,
    pub cluster: i32,
}

#[derive(Serialize)]
struct ClusterizeRequest {
    delta_data: Vec<WireDeltaData>,
}

#[derive(Deserialize)]
struct WireSample {
    data: WireDeltaData,
    cluster: i32,
}

#[derive(Deserialize)]
struct ClusterizeResponse {
    pest_spread_samples: Vec<WireSample>,
}

/// Cluster delta records into spread groups. The request size is uncapped.
pub async fn clusterize_spread(
    records: &[DeltaRecord],
    port: u16,
) -> Result<Vec<PestSpreadSample>> {
    let request = ClusterizeRequest {
        delta_data: records.iter().map(WireDeltaData::from).collect(),
    };

    let client = reqwest::Client::builder().timeout(DEADLINE).build()?;
    let url = format!("http://localhost:{port}/clusterize-spread");

    let mut last_error = Error::Network("clustering service unreachable".to_string());
    for attempt in 1..=MAX_TRIES {
        match client.post(&url).json(&request).send().await {
            Ok(response) if response.status().is_success() => {
                let parsed: ClusterizeResponse = response.json().await?;
                return parsed
                    .pest_spread_samples
                    .into_iter()
                    .map(|sample| {
                        Ok(PestSpreadSample {
                            data: sample.data.into_record()?,
                            cluster: sample.cluster,
                        })
                    })
                    .collect();
            }
            Ok(response) => {
                warn!(
                    "attempt {attempt}/{MAX_TRIES}: clustering returned {}",
                    response.status()
                );
                last_error = Error::Network(format!(
                    "clustering request failed with status {}",
                    response.status()
                ));
            }
            Err(e) => {
                warn!("attempt {attempt}/{MAX_TRIES}: clustering call failed: {e}");
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
    fn test_clustered_sample_parsing() {
        let raw = r#"{
            "pest_spread_samples": [
                {
                    "data": {
                        "forest": "f", "plot": "p",
                        "delta_min": 5, "delta_max": 10, "delta": 7,
                        "start_date": "2024-07-01T00:00:00Z",
                        "end_date": "2024-07-08T00:00:00Z",
                        "x": 1, "y": 2,
                        "latitude": -23.0, "longitude": -46.0,
                        "ndre": 0.1, "ndmi": 0.2, "psri": 0.3, "ndvi": 0.4,
                        "ndre_derivative": 0.01, "ndmi_derivative": 0.02,
                        "psri_derivative": 0.03, "ndvi_derivative": 0.04,
                        "label": "defoliator"
                    },
                    "cluster": 2
                }
            ]
        }"#;
        let parsed: ClusterizeResponse = serde_json::from_str(raw).unwrap();
        let sample = parsed.pest_spread_samples.into_iter().next().unwrap();
        assert_eq!(sample.cluster, 2);
        let record = sample.data.into_record().unwrap();
        assert_eq!(record.label.as_deref(), Some("defoliator"));
        assert_eq!(record.delta, 7);
    }
}
