//! Data models for the smart node: readings, derived analytics results,
//! the power/activity record and the live stream envelope.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};

// ---

/// The three environmental metrics a sensor can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Humidity,
    AirQuality,
}

impl Metric {
    // ---
    pub const ALL: [Metric; 3] = [Metric::Temperature, Metric::Humidity, Metric::AirQuality];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::AirQuality => "air_quality",
        }
    }

    /// Value of this metric on a reading, if the producer supplied one.
    pub fn value_of(&self, reading: &Reading) -> Option<f64> {
        match self {
            Metric::Temperature => reading.temperature,
            Metric::Humidity => reading.humidity,
            Metric::AirQuality => reading.air_quality,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" | "temp" => Ok(Metric::Temperature),
            "humidity" | "hum" => Ok(Metric::Humidity),
            "air_quality" | "aqi" => Ok(Metric::AirQuality),
            other => Err(NodeError::validation(
                "metric",
                format!("unknown metric '{other}'"),
            )),
        }
    }
}

/// A reading as delivered by a producer, before validation.
///
/// Accepts both the long field names and the short radio aliases
/// (`temp`, `hum`, `aqi`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncomingReading {
    // ---
    pub sensor_id: Option<String>,
    #[serde(alias = "temp")]
    pub temperature: Option<f64>,
    #[serde(alias = "hum")]
    pub humidity: Option<f64>,
    #[serde(alias = "aqi")]
    pub air_quality: Option<f64>,
    pub rssi: Option<i32>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A validated reading ready to be appended to the store.
///
/// Only obtainable through [`IncomingReading::validate`], so every value of this
/// type has a non-empty sensor id and at least one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub(crate) sensor_id: String,
    pub(crate) temperature: Option<f64>,
    pub(crate) humidity: Option<f64>,
    pub(crate) air_quality: Option<f64>,
    pub(crate) rssi: Option<i32>,
    pub(crate) timestamp: DateTime<Utc>,
}

impl IncomingReading {
    // ---
    /// Validate the payload, stamping it with `received_at` when the producer
    /// supplied no timestamp of its own.
    pub fn validate(self, received_at: DateTime<Utc>) -> NodeResult<NewReading> {
        // ---
        let sensor_id = self.sensor_id.map(|s| s.trim().to_string()).unwrap_or_default();
        if sensor_id.is_empty() {
            return Err(NodeError::validation("sensor_id", "must be present and non-empty"));
        }

        for (field, value) in [
            ("temperature", self.temperature),
            ("humidity", self.humidity),
            ("air_quality", self.air_quality),
        ] {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(NodeError::validation(field, "must be a finite number"));
            }
        }

        if self.temperature.is_none() && self.humidity.is_none() && self.air_quality.is_none() {
            return Err(NodeError::validation(
                "metrics",
                "at least one of temperature, humidity or air_quality is required",
            ));
        }

        Ok(NewReading {
            sensor_id,
            temperature: self.temperature,
            humidity: self.humidity,
            air_quality: self.air_quality,
            rssi: self.rssi,
            timestamp: self.timestamp.unwrap_or(received_at),
        })
    }
}

impl NewReading {
    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// One persisted observation from one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    // ---
    pub id: i64,
    pub sensor_id: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub air_quality: Option<f64>,
    pub rssi: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

/// A flagged deviation of one metric of one reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    // ---
    pub id: i64,
    pub sensor_id: String,
    pub reading_id: i64,
    pub anomaly_type: Metric,
    pub severity: f64,
    pub detected_at: DateTime<Utc>,
}

/// A stored anomaly as listed to viewers: the anomaly itself plus the values
/// and instant of the reading that triggered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    #[serde(flatten)]
    pub anomaly: Anomaly,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub air_quality: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Anomaly produced by a detection run, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAnomaly {
    pub sensor_id: String,
    pub reading_id: i64,
    pub anomaly_type: Metric,
    pub severity: f64,
}

impl NewAnomaly {
    // ---
    pub fn new(sensor_id: &str, reading_id: i64, anomaly_type: Metric, severity: f64) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            reading_id,
            anomaly_type,
            severity: severity.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

impl TrendDirection {
    // ---
    /// Classify a slope with a symmetric dead band around zero.
    ///
    /// `dead_band` must be positive; slopes strictly inside `(-dead_band, dead_band)`
    /// are stable.
    pub fn classify(slope: f64, dead_band: f64) -> Self {
        if slope >= dead_band {
            TrendDirection::Increasing
        } else if slope <= -dead_band {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        }
    }
}

/// Directional movement of one metric of one sensor over an analysis window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    // ---
    pub id: i64,
    pub sensor_id: String,
    pub metric: Metric,
    pub trend_direction: TrendDirection,
    /// Metric units per hour.
    pub slope: f64,
    pub calculated_at: DateTime<Utc>,
    /// Hours of history used.
    pub time_window: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTrend {
    pub sensor_id: String,
    pub metric: Metric,
    pub trend_direction: TrendDirection,
    pub slope: f64,
    pub time_window: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PowerMode {
    Active,
    Idle,
    Sleep,
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerMode::Active => "active",
            PowerMode::Idle => "idle",
            PowerMode::Sleep => "sleep",
        })
    }
}

/// Snapshot of the process-wide activity/power record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub last_activity: DateTime<Utc>,
    pub power_mode: PowerMode,
    pub ml_last_run: Option<DateTime<Utc>>,
}

/// A push message on the live stream.
///
/// Serialized as `{"type": "reading" | "anomaly", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Reading(Reading),
    Anomaly(Anomaly),
}
