//! Client for the out-of-process index smoothing service.

use std::collections::HashMap;
use std::time::Duration;

use chrono::NaiveDate;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};

use canopy_utils::{Error, Result};

use crate::{PixelFrame, PixelObservation, PixelStatus};

/// Bounded number of in-flight smoothing requests.
const MAX_IN_FLIGHT: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct SmoothRequest<'a> {
    ndre: &'a [f64],
    ndmi: &'a [f64],
    psri: &'a [f64],
    ndvi: &'a [f64],
}

#[derive(Debug, Deserialize)]
struct SmoothedSeries {
    ndre: Vec<f64>,
    ndmi: Vec<f64>,
    psri: Vec<f64>,
    ndvi: Vec<f64>,
}

/// One pixel's valid observations flattened for the wire.
struct PixelTask {
    observations: Vec<(NaiveDate, PixelObservation)>,
    ndre: Vec<f64>,
    ndmi: Vec<f64>,
    psri: Vec<f64>,
    ndvi: Vec<f64>,
}

fn pixel_task(series: &crate::PixelSeries) -> Option<PixelTask> {
    let mut task = PixelTask {
        observations: Vec::new(),
        ndre: Vec::new(),
        ndmi: Vec::new(),
        psri: Vec::new(),
        ndvi: Vec::new(),
    };
    for (date, obs) in series {
        match obs.status {
            PixelStatus::Valid => {
                task.observations.push((*date, *obs));
                task.ndre.push(obs.ndre);
                task.ndmi.push(obs.ndmi);
                task.psri.push(obs.psri);
                task.ndvi.push(obs.ndvi);
            }
            PixelStatus::Invalid => {}
            PixelStatus::Unknown | PixelStatus::Treatable => {
                panic!("unresolved {:?} observation reached the cleaner", obs.status)
            }
        }
    }
    if task.observations.is_empty() {
        None
    } else {
        Some(task)
    }
}

/// Apply smoothed series back onto a pixel's observations, dropping any
/// observation whose smoothed value is exactly 0 for one of the indices.
fn apply_smoothed(
    observations: &[(NaiveDate, PixelObservation)],
    smoothed: &SmoothedSeries,
) -> Result<Vec<(NaiveDate, PixelObservation)>> {
    let len = observations.len();
    if smoothed.ndre.len() != len
        || smoothed.ndmi.len() != len
        || smoothed.psri.len() != len
        || smoothed.ndvi.len() != len
    {
        return Err(Error::Schema(format!(
            "smoothing service returned {} values for {len} observations",
            smoothed.ndre.len()
        )));
    }

    let mut cleaned = Vec::with_capacity(len);
    for (i, (date, obs)) in observations.iter().enumerate() {
        if smoothed.ndmi[i] == 0.0
            || smoothed.psri[i] == 0.0
            || smoothed.ndre[i] == 0.0
            || smoothed.ndvi[i] == 0.0
        {
            continue;
        }
        let mut obs = *obs;
        obs.ndre = smoothed.ndre[i];
        obs.ndmi = smoothed.ndmi[i];
        obs.psri = smoothed.psri[i];
        obs.ndvi = smoothed.ndvi[i];
        cleaned.push((*date, obs));
    }
    Ok(cleaned)
}

/// Smoothing RPC client.
pub struct SmoothingClient {
    base_url: String,
    client: reqwest::Client,
}

impl SmoothingClient {
    pub fn new(port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(SmoothingClient {
            base_url: format!("http://localhost:{port}"),
            client,
        })
    }

    async fn smooth_series(&self, task: &PixelTask) -> Result<SmoothedSeries> {
        let request = SmoothRequest {
            ndre: &task.ndre,
            ndmi: &task.ndmi,
            psri: &task.psri,
            ndvi: &task.ndvi,
        };
        let response = self
            .client
            .post(format!("{}/clear-and-smooth", self.base_url))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "smoothing request failed with status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Smooth every pixel's valid series over a bounded worker pool. The
    /// first RPC error cancels further submissions and is returned; an
    /// empty cleaned dataset is a hard error.
    pub async fn clean_frame(&self, frame: &PixelFrame) -> Result<PixelFrame> {
        let tasks: Vec<(crate::Coordinate, PixelTask)> = frame
            .iter()
            .filter_map(|(coordinate, series)| {
                pixel_task(series).map(|task| (*coordinate, task))
            })
            .collect();

        let mut results = stream::iter(tasks.into_iter().map(|(coordinate, task)| async move {
            let smoothed = self.smooth_series(&task).await?;
            let cleaned = apply_smoothed(&task.observations, &smoothed)?;
            Ok::<_, Error>((coordinate, cleaned))
        }))
        .buffer_unordered(MAX_IN_FLIGHT);

        let mut clean: PixelFrame = HashMap::new();
        while let Some(result) = results.next().await {
            let (coordinate, cleaned) = result?;
            if !cleaned.is_empty() {
                clean.insert(coordinate, cleaned.into_iter().collect());
            }
        }

        if clean.is_empty() {
            return Err(Error::NotFound(
                "no valid data found after cleaning".to_string(),
            ));
        }
        Ok(clean)
    }
}
