//! Analytics Engine: on-demand anomaly and trend detection over stored readings.
//!
//! Both runs read one snapshot of the trailing window from the store, compute
//! in memory, and append their results. Nothing here runs on a timer.
//!
//! Anomalies use a leave-one-out z-score: each value is measured against the
//! mean and population standard deviation of the *other* values of the same
//! sensor and metric in the window. A single large outlier otherwise inflates
//! the deviation it is measured with; in a window of `n` samples the classic
//! z-score can never exceed `sqrt(n - 1)`. A window whose values are all equal
//! has no outliers.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};

use crate::error::NodeResult;
use crate::hub::BroadcastHub;
use crate::models::{
    Anomaly, Metric, NewAnomaly, NewTrend, Reading, StreamEvent, Trend, TrendDirection,
};
use crate::power::PowerState;
use crate::store::ReadingStore;

// ---

/// Minimum |z| flagged as an anomaly.
pub const Z_THRESHOLD: f64 = 2.0;

/// |z| at which severity saturates to 1.0.
pub const SEVERITY_CAP: f64 = 4.0;

/// Samples a sensor/metric needs in the window before outliers are looked for.
pub const MIN_ANOMALY_SAMPLES: usize = 3;

/// Samples a sensor/metric needs in the window before a slope is fitted.
pub const MIN_TREND_SAMPLES: usize = 2;

/// Default trend dead band, metric units per hour.
pub const DEFAULT_DEAD_BAND: f64 = 0.01;

/// Values used for next-value prediction.
const PREDICTION_HISTORY: usize = 10;

/// Severity for a z-score: linear up to [`SEVERITY_CAP`], then 1.0.
pub fn severity(z: f64) -> f64 {
    (z.abs() / SEVERITY_CAP).clamp(0.0, 1.0)
}

/// Indices and |z| of the values at or beyond `threshold`.
///
/// The baseline of each value is computed directly from the other values, so
/// a flat series never picks up rounding residue from running sums.
/// Differences within a few ulps of the largest magnitude count as zero.
pub fn outliers(values: &[f64], threshold: f64) -> Vec<(usize, f64)> {
    // ---
    let n = values.len();
    if n < MIN_ANOMALY_SAMPLES || values.iter().all(|v| *v == values[0]) {
        return Vec::new();
    }

    let scale = values.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
    let noise = f64::EPSILON * scale * n as f64;
    let others_n = (n - 1) as f64;

    let mut found = Vec::new();
    for (i, &v) in values.iter().enumerate() {
        let others = || {
            values
                .iter()
                .enumerate()
                .filter(move |(j, _)| *j != i)
                .map(|(_, o)| *o)
        };
        let others_mean = others().sum::<f64>() / others_n;
        let others_var = others().map(|o| (o - others_mean).powi(2)).sum::<f64>() / others_n;
        let others_std = others_var.sqrt();

        let deviation = (v - others_mean).abs();
        if deviation <= noise {
            continue;
        }
        let z = if others_std > noise {
            deviation / others_std
        } else {
            f64::INFINITY
        };
        if z >= threshold {
            found.push((i, z));
        }
    }
    found
}

/// Ordinary least-squares slope of `y` against `x`; `None` when `x` has no spread.
pub fn least_squares_slope(points: &[(f64, f64)]) -> Option<f64> {
    // ---
    if points.len() < MIN_TREND_SAMPLES {
        return None;
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let (sxy, sxx) = points.iter().fold((0.0, 0.0), |(sxy, sxx), (x, y)| {
        let dx = x - mean_x;
        (sxy + dx * (y - mean_y), sxx + dx * dx)
    });

    (sxx > 0.0).then(|| sxy / sxx)
}

/// Extrapolate one step from the linear trend of the last values.
pub fn predict_next(values: &[f64]) -> Option<f64> {
    // ---
    if values.len() < MIN_ANOMALY_SAMPLES {
        return None;
    }
    let recent = &values[values.len().saturating_sub(PREDICTION_HISTORY)..];
    let points: Vec<(f64, f64)> = recent
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as f64, v))
        .collect();
    let slope = least_squares_slope(&points)?;
    recent.last().map(|last| last + slope)
}

fn by_sensor(window: &[Reading]) -> BTreeMap<&str, Vec<&Reading>> {
    let mut grouped: BTreeMap<&str, Vec<&Reading>> = BTreeMap::new();
    for reading in window {
        grouped.entry(reading.sensor_id.as_str()).or_default().push(reading);
    }
    grouped
}

/// Anomalies in a window snapshot, per sensor and metric.
pub fn find_anomalies(window: &[Reading]) -> Vec<NewAnomaly> {
    // ---
    let mut found = Vec::new();
    for (sensor_id, readings) in by_sensor(window) {
        for metric in Metric::ALL {
            let samples: Vec<(i64, f64)> = readings
                .iter()
                .filter_map(|r| metric.value_of(r).map(|v| (r.id, v)))
                .collect();
            let values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();

            for (i, z) in outliers(&values, Z_THRESHOLD) {
                found.push(NewAnomaly::new(sensor_id, samples[i].0, metric, severity(z)));
            }
        }
    }
    found
}

/// Trends in a window snapshot; x is hours elapsed since `window_start`.
pub fn find_trends(
    window: &[Reading],
    window_start: DateTime<Utc>,
    hours: u32,
    dead_band: f64,
) -> Vec<NewTrend> {
    // ---
    let mut found = Vec::new();
    for (sensor_id, readings) in by_sensor(window) {
        for metric in Metric::ALL {
            let points: Vec<(f64, f64)> = readings
                .iter()
                .filter_map(|r| {
                    let elapsed = (r.timestamp - window_start).num_milliseconds() as f64;
                    metric.value_of(r).map(|v| (elapsed / 3_600_000.0, v))
                })
                .collect();

            if let Some(slope) = least_squares_slope(&points) {
                found.push(NewTrend {
                    sensor_id: sensor_id.to_string(),
                    metric,
                    trend_direction: TrendDirection::classify(slope, dead_band),
                    slope,
                    time_window: hours,
                });
            }
        }
    }
    found
}

#[derive(Debug, Clone)]
pub struct AnalyticsEngine {
    store: ReadingStore,
    hub: BroadcastHub,
    power: Arc<PowerState>,
    dead_band: f64,
}

impl AnalyticsEngine {
    // ---
    /// `dead_band` must be positive; non-positive values fall back to
    /// [`DEFAULT_DEAD_BAND`].
    pub fn new(store: ReadingStore, hub: BroadcastHub, power: Arc<PowerState>, dead_band: f64) -> Self {
        let dead_band = if dead_band > 0.0 { dead_band } else { DEFAULT_DEAD_BAND };
        Self {
            store,
            hub,
            power,
            dead_band,
        }
    }

    /// Run anomaly detection over the trailing `hours`, persist and announce
    /// every finding. Re-running over an overlapping window appends the same
    /// findings again.
    ///
    /// The findings of a run are stored in one transaction and published only
    /// after it commits, so a failed run leaves nothing behind.
    pub async fn detect(&self, sensor_id: Option<&str>, hours: u32) -> NodeResult<Vec<Anomaly>> {
        // ---
        let now = Utc::now();
        let window = self
            .store
            .window(sensor_id, now - Duration::hours(i64::from(hours)))
            .await?;

        let created = self
            .store
            .append_anomalies(&find_anomalies(&window), now)
            .await?;
        for anomaly in &created {
            self.hub.publish(StreamEvent::Anomaly(anomaly.clone()));
        }

        let state = self.power.record_analysis_run();
        if let Err(e) = self.store.save_system_state(&state).await {
            tracing::warn!("Failed to persist system state: {}", e);
        }

        tracing::info!(
            "Detected {} anomalies over {} readings ({}h window)",
            created.len(),
            window.len(),
            hours
        );
        Ok(created)
    }

    /// Fit and persist one trend per sensor/metric with enough samples.
    pub async fn analyze(&self, sensor_id: Option<&str>, hours: u32) -> NodeResult<Vec<Trend>> {
        // ---
        let now = Utc::now();
        let window_start = now - Duration::hours(i64::from(hours));
        let window = self.store.window(sensor_id, window_start).await?;

        let mut created = Vec::new();
        for trend in find_trends(&window, window_start, hours, self.dead_band) {
            created.push(self.store.append_trend(&trend, now).await?);
        }

        tracing::info!(
            "Calculated {} trends over {} readings ({}h window)",
            created.len(),
            window.len(),
            hours
        );
        Ok(created)
    }

    /// Next-value prediction for one sensor and metric from its latest readings.
    pub async fn predict(&self, sensor_id: &str, metric: Metric) -> NodeResult<Option<f64>> {
        // ---
        let recent = self.store.query(Some(sensor_id), None, 100).await?;
        let mut values: Vec<f64> = recent
            .iter()
            .filter_map(|r| metric.value_of(r))
            .take(PREDICTION_HISTORY)
            .collect();
        values.reverse();
        Ok(predict_next(&values))
    }
}
