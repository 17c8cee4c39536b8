//! Resolution of Unknown and Treatable observations.
//!
//! Dates are processed in ascending order; for each date a classification
//! fixed point runs first (Unknown pixels become Treatable or Invalid based
//! on a strictly-past anchor and shared neighborhoods), then an imputation
//! fixed point (Treatable pixels become Valid by forward interpolation on
//! their own timeline, or by averaged neighbor deltas). Whatever is still
//! Unknown or Treatable at the end is forced to Invalid, so only Valid and
//! Invalid observations leave this stage.

use std::collections::HashMap;
use std::ops::Bound;

use chrono::NaiveDate;
use log::debug;

use crate::{Coordinate, PixelFrame, PixelObservation, PixelSeries, PixelStatus};

type AnchorDates = HashMap<(Coordinate, NaiveDate), NaiveDate>;

/// Run the two-phase estimation over the whole frame, in place.
pub fn estimate_pixels(frame: &mut PixelFrame) {
    let dates = sorted_dates(frame);
    let mut anchors: AnchorDates = HashMap::new();

    for (index, &date) in dates.iter().enumerate() {
        classify_unknowns(frame, date, index == 0, &mut anchors);
        impute_treatables(frame, date, &anchors);
    }

    // Finalization: nothing transient survives.
    for series in frame.values_mut() {
        for obs in series.values_mut() {
            if matches!(obs.status, PixelStatus::Unknown | PixelStatus::Treatable) {
                obs.status = PixelStatus::Invalid;
            }
        }
    }
}

fn sorted_dates(frame: &PixelFrame) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = frame
        .values()
        .flat_map(|series| series.keys().copied())
        .collect();
    dates.sort();
    dates.dedup();
    dates
}

fn status_at(frame: &PixelFrame, coordinate: Coordinate, date: NaiveDate) -> Option<PixelStatus> {
    frame
        .get(&coordinate)
        .and_then(|series| series.get(&date))
        .map(|obs| obs.status)
}

fn coordinates_with_status(
    frame: &PixelFrame,
    date: NaiveDate,
    status: PixelStatus,
) -> Vec<Coordinate> {
    let mut coordinates: Vec<Coordinate> = frame
        .iter()
        .filter(|(_, series)| series.get(&date).map(|obs| obs.status) == Some(status))
        .map(|(coordinate, _)| *coordinate)
        .collect();
    // Deterministic sweep order regardless of hash iteration.
    coordinates.sort();
    coordinates
}

fn neighbors_with_status(
    frame: &PixelFrame,
    coordinate: Coordinate,
    date: NaiveDate,
    statuses: &[PixelStatus],
) -> Vec<Coordinate> {
    coordinate
        .neighbors()
        .into_iter()
        .filter(|neighbor| {
            status_at(frame, *neighbor, date)
                .map(|status| statuses.contains(&status))
                .unwrap_or(false)
        })
        .collect()
}

/// Most recent observation strictly before `date` whose status is Valid or
/// Treatable.
fn most_recent_anchor(
    series: &PixelSeries,
    date: NaiveDate,
) -> Option<(NaiveDate, PixelObservation)> {
    series
        .range(..date)
        .rev()
        .find(|(_, obs)| matches!(obs.status, PixelStatus::Valid | PixelStatus::Treatable))
        .map(|(anchor_date, obs)| (*anchor_date, *obs))
}

/// Earliest Valid observation strictly after `date` on the pixel's own
/// timeline.
fn next_valid(series: &PixelSeries, date: NaiveDate) -> Option<PixelObservation> {
    series
        .range((Bound::Excluded(date), Bound::Unbounded))
        .find(|(_, obs)| obs.status == PixelStatus::Valid)
        .map(|(_, obs)| *obs)
}

/// Phase 1: classify Unknown pixels at `date` until a round passes with no
/// change or none remain.
fn classify_unknowns(
    frame: &mut PixelFrame,
    date: NaiveDate,
    is_first_date: bool,
    anchors: &mut AnchorDates,
) {
    loop {
        let unknowns = coordinates_with_status(frame, date, PixelStatus::Unknown);
        if unknowns.is_empty() {
            break;
        }

        let mut changed = false;
        for coordinate in unknowns {
            if is_first_date {
                // Nothing earlier to anchor on.
                frame.get_mut(&coordinate).unwrap().get_mut(&date).unwrap().status =
                    PixelStatus::Invalid;
                changed = true;
                continue;
            }

            let Some((anchor_date, anchor_obs)) = most_recent_anchor(&frame[&coordinate], date)
            else {
                continue;
            };

            let past_neighbors = neighbors_with_status(
                frame,
                coordinate,
                anchor_date,
                &[PixelStatus::Valid, PixelStatus::Treatable],
            );
            if past_neighbors.is_empty() {
                // Remains Unknown and will retry next round.
                continue;
            }

            let now_neighbors = neighbors_with_status(
                frame,
                coordinate,
                date,
                &[PixelStatus::Valid, PixelStatus::Treatable, PixelStatus::Unknown],
            );
            let resolved_now: Vec<Coordinate> = now_neighbors
                .iter()
                .filter(|n| status_at(frame, **n, date) != Some(PixelStatus::Unknown))
                .copied()
                .collect();
            if !now_neighbors.is_empty() && resolved_now.is_empty() {
                // Every neighbor is still Unknown; defer to a later round.
                continue;
            }

            let shares_neighborhood = resolved_now
                .iter()
                .any(|neighbor| past_neighbors.contains(neighbor));

            let obs = frame.get_mut(&coordinate).unwrap().get_mut(&date).unwrap();
            if shares_neighborhood {
                // The anchor's value stands in until imputation refines it.
                obs.latitude = anchor_obs.latitude;
                obs.longitude = anchor_obs.longitude;
                obs.ndre = anchor_obs.ndre;
                obs.ndmi = anchor_obs.ndmi;
                obs.psri = anchor_obs.psri;
                obs.ndvi = anchor_obs.ndvi;
                obs.status = PixelStatus::Treatable;
                anchors.insert((coordinate, date), anchor_date);
            } else {
                obs.status = PixelStatus::Invalid;
            }
            changed = true;
        }

        if !changed {
            break;
        }
    }
}

/// Phase 2: impute Treatable pixels at `date` until a round passes with no
/// change.
fn impute_treatables(frame: &mut PixelFrame, date: NaiveDate, anchors: &AnchorDates) {
    let mut round = 0u32;
    loop {
        let treatables = coordinates_with_status(frame, date, PixelStatus::Treatable);
        if treatables.is_empty() {
            break;
        }
        debug!("imputation round {round} on {date}: {} treatable", treatables.len());
        round += 1;

        let mut changed = false;
        for coordinate in treatables {
            if let Some(next) = next_valid(&frame[&coordinate], date) {
                let obs = frame.get_mut(&coordinate).unwrap().get_mut(&date).unwrap();
                obs.ndre += (next.ndre - obs.ndre) / 2.0;
                obs.ndmi += (next.ndmi - obs.ndmi) / 2.0;
                obs.psri += (next.psri - obs.psri) / 2.0;
                obs.ndvi += (next.ndvi - obs.ndvi) / 2.0;
                obs.status = PixelStatus::Valid;
                changed = true;
                continue;
            }

            let current_valid =
                neighbors_with_status(frame, coordinate, date, &[PixelStatus::Valid]);
            if current_valid.is_empty() {
                continue;
            }

            let anchor_date = *anchors
                .get(&(coordinate, date))
                .expect("treatable pixel without a recorded anchor date");
            let past_valid =
                neighbors_with_status(frame, coordinate, anchor_date, &[PixelStatus::Valid]);
            if past_valid.is_empty() {
                panic!("no valid neighbors at the anchor date for a treatable pixel");
            }

            let mut deltas: Vec<[f64; 4]> = Vec::new();
            for neighbor in &current_valid {
                if past_valid.contains(neighbor) {
                    let current = frame[neighbor][&date];
                    let past = frame[neighbor][&anchor_date];
                    deltas.push([
                        current.ndre - past.ndre,
                        current.ndmi - past.ndmi,
                        current.psri - past.psri,
                        current.ndvi - past.ndvi,
                    ]);
                }
            }
            if deltas.is_empty() {
                continue;
            }

            let count = deltas.len() as f64;
            let mut avg = [0.0f64; 4];
            for delta in &deltas {
                for (sum, value) in avg.iter_mut().zip(delta) {
                    *sum += value;
                }
            }
            for sum in &mut avg {
                *sum /= count;
            }

            let obs = frame.get_mut(&coordinate).unwrap().get_mut(&date).unwrap();
            obs.ndre += avg[0];
            obs.ndmi += avg[1];
            obs.psri += avg[2];
            obs.ndvi += avg[3];
            obs.status = PixelStatus::Valid;
            changed = true;
        }

        if !changed {
            break;
        }
    }
}
