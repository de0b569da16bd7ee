//! Reading Store: the durable, append-only log of readings and derived results.
//!
//! Backed by SQLite through `sqlx`. Writers are serialized behind an async
//! mutex so id assignment is atomic and follows append order; every query is a
//! single statement and therefore reads one consistent snapshot.

use std::{str::FromStr, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    QueryBuilder, Sqlite, SqlitePool,
};
use tokio::sync::Mutex;

use crate::error::NodeResult;
use crate::models::{
    Anomaly, AnomalyReport, Metric, NewAnomaly, NewReading, NewTrend, PowerMode, Reading,
    SystemState, Trend, TrendDirection,
};

// ---

/// Default row bound for reading queries.
pub const DEFAULT_LIMIT: u32 = 100;

/// Open a SQLite pool, creating the database file (and its directory) if it
/// does not exist.
pub async fn connect(db_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    // ---
    let options = SqliteConnectOptions::from_str(db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    if let Some(dir) = options.get_filename().parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Single-connection in-memory pool. Used by tests and throwaway nodes; the
/// connection is never recycled because that would drop the database.
pub async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    // ---
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
}

#[derive(Debug, Clone)]
pub struct ReadingStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    id: i64,
    sensor_id: String,
    temperature: Option<f64>,
    humidity: Option<f64>,
    air_quality: Option<f64>,
    rssi: Option<i32>,
    timestamp_ms: i64,
}

impl From<ReadingRow> for Reading {
    fn from(row: ReadingRow) -> Self {
        Reading {
            id: row.id,
            sensor_id: row.sensor_id,
            temperature: row.temperature,
            humidity: row.humidity,
            air_quality: row.air_quality,
            rssi: row.rssi,
            timestamp: from_millis(row.timestamp_ms),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AnomalyReportRow {
    id: i64,
    sensor_id: String,
    reading_id: i64,
    anomaly_type: Metric,
    severity: f64,
    detected_at_ms: i64,
    temperature: Option<f64>,
    humidity: Option<f64>,
    air_quality: Option<f64>,
    timestamp_ms: i64,
}

impl From<AnomalyReportRow> for AnomalyReport {
    fn from(row: AnomalyReportRow) -> Self {
        AnomalyReport {
            anomaly: Anomaly {
                id: row.id,
                sensor_id: row.sensor_id,
                reading_id: row.reading_id,
                anomaly_type: row.anomaly_type,
                severity: row.severity,
                detected_at: from_millis(row.detected_at_ms),
            },
            temperature: row.temperature,
            humidity: row.humidity,
            air_quality: row.air_quality,
            timestamp: from_millis(row.timestamp_ms),
        }
    }
}

#[derive(sqlx::FromRow)]
struct TrendRow {
    id: i64,
    sensor_id: String,
    metric: Metric,
    trend_direction: TrendDirection,
    slope: f64,
    calculated_at_ms: i64,
    time_window: i64,
}

impl From<TrendRow> for Trend {
    fn from(row: TrendRow) -> Self {
        Trend {
            id: row.id,
            sensor_id: row.sensor_id,
            metric: row.metric,
            trend_direction: row.trend_direction,
            slope: row.slope,
            calculated_at: from_millis(row.calculated_at_ms),
            time_window: u32::try_from(row.time_window).unwrap_or(u32::MAX),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SystemStateRow {
    last_activity_ms: i64,
    power_mode: PowerMode,
    ml_last_run_ms: Option<i64>,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

const READING_COLUMNS: &str =
    "SELECT id, sensor_id, temperature, humidity, air_quality, rssi, timestamp_ms FROM sensor_readings";

impl ReadingStore {
    // ---
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append a validated reading and return the persisted row with its id.
    pub async fn append(&self, reading: &NewReading) -> NodeResult<Reading> {
        // ---
        let _guard = self.write_lock.lock().await;

        let id = sqlx::query(
            r#"
            INSERT INTO sensor_readings (
                sensor_id, temperature, humidity, air_quality, rssi, timestamp_ms
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reading.sensor_id)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.air_quality)
        .bind(reading.rssi)
        .bind(reading.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Reading {
            id,
            sensor_id: reading.sensor_id.clone(),
            temperature: reading.temperature,
            humidity: reading.humidity,
            air_quality: reading.air_quality,
            rssi: reading.rssi,
            timestamp: from_millis(reading.timestamp.timestamp_millis()),
        })
    }

    /// Most-recent-first readings, optionally restricted to one sensor and to
    /// the trailing `hours`.
    pub async fn query(
        &self,
        sensor_id: Option<&str>,
        hours: Option<u32>,
        limit: u32,
    ) -> NodeResult<Vec<Reading>> {
        // ---
        let since = hours.map(|h| Utc::now() - Duration::hours(i64::from(h)));

        let mut qb = QueryBuilder::<Sqlite>::new(READING_COLUMNS);
        qb.push(" WHERE 1 = 1");
        if let Some(sensor_id) = sensor_id {
            qb.push(" AND sensor_id = ").push_bind(sensor_id.to_string());
        }
        if let Some(since) = since {
            qb.push(" AND timestamp_ms >= ").push_bind(since.timestamp_millis());
        }
        qb.push(" ORDER BY id DESC LIMIT ").push_bind(i64::from(limit));

        let rows: Vec<ReadingRow> = qb.build_query_as::<ReadingRow>().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Reading::from).collect())
    }

    /// Every reading with `timestamp >= since`, oldest first. This is the
    /// snapshot analytics runs compute against.
    pub async fn window(
        &self,
        sensor_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> NodeResult<Vec<Reading>> {
        // ---
        let mut qb = QueryBuilder::<Sqlite>::new(READING_COLUMNS);
        qb.push(" WHERE timestamp_ms >= ")
            .push_bind(since.timestamp_millis());
        if let Some(sensor_id) = sensor_id {
            qb.push(" AND sensor_id = ").push_bind(sensor_id.to_string());
        }
        qb.push(" ORDER BY timestamp_ms ASC, id ASC");

        let rows: Vec<ReadingRow> = qb.build_query_as::<ReadingRow>().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Reading::from).collect())
    }

    /// Distinct sensor ids ever seen, sorted.
    pub async fn list_sensors(&self) -> NodeResult<Vec<String>> {
        // ---
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT sensor_id FROM sensor_readings ORDER BY sensor_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Append the findings of one detection run in a single transaction:
    /// either every anomaly is stored or none is.
    pub async fn append_anomalies(
        &self,
        anomalies: &[NewAnomaly],
        detected_at: DateTime<Utc>,
    ) -> NodeResult<Vec<Anomaly>> {
        // ---
        let _guard = self.write_lock.lock().await;
        let detected_at_ms = detected_at.timestamp_millis();

        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(anomalies.len());
        for anomaly in anomalies {
            let id = sqlx::query(
                r#"
                INSERT INTO anomalies (sensor_id, reading_id, anomaly_type, severity, detected_at_ms)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&anomaly.sensor_id)
            .bind(anomaly.reading_id)
            .bind(anomaly.anomaly_type)
            .bind(anomaly.severity)
            .bind(detected_at_ms)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            stored.push(Anomaly {
                id,
                sensor_id: anomaly.sensor_id.clone(),
                reading_id: anomaly.reading_id,
                anomaly_type: anomaly.anomaly_type,
                severity: anomaly.severity,
                detected_at: from_millis(detected_at_ms),
            });
        }
        tx.commit().await?;

        Ok(stored)
    }

    /// Most recent anomalies first, each with the values of the reading that
    /// triggered it.
    pub async fn query_anomalies(&self, limit: u32) -> NodeResult<Vec<AnomalyReport>> {
        // ---
        let rows: Vec<AnomalyReportRow> = sqlx::query_as(
            r#"
            SELECT a.id, a.sensor_id, a.reading_id, a.anomaly_type, a.severity, a.detected_at_ms,
                   s.temperature, s.humidity, s.air_quality, s.timestamp_ms
            FROM anomalies a
            JOIN sensor_readings s ON a.reading_id = s.id
            ORDER BY a.id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AnomalyReport::from).collect())
    }

    pub async fn append_trend(
        &self,
        trend: &NewTrend,
        calculated_at: DateTime<Utc>,
    ) -> NodeResult<Trend> {
        // ---
        let _guard = self.write_lock.lock().await;
        let calculated_at_ms = calculated_at.timestamp_millis();

        let id = sqlx::query(
            r#"
            INSERT INTO trends (
                sensor_id, metric, trend_direction, slope, calculated_at_ms, time_window
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trend.sensor_id)
        .bind(trend.metric)
        .bind(trend.trend_direction)
        .bind(trend.slope)
        .bind(calculated_at_ms)
        .bind(i64::from(trend.time_window))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Trend {
            id,
            sensor_id: trend.sensor_id.clone(),
            metric: trend.metric,
            trend_direction: trend.trend_direction,
            slope: trend.slope,
            calculated_at: from_millis(calculated_at_ms),
            time_window: trend.time_window,
        })
    }

    /// Most recent trends first, optionally for one sensor.
    pub async fn query_trends(&self, sensor_id: Option<&str>, limit: u32) -> NodeResult<Vec<Trend>> {
        // ---
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, sensor_id, metric, trend_direction, slope, calculated_at_ms, time_window FROM trends",
        );
        if let Some(sensor_id) = sensor_id {
            qb.push(" WHERE sensor_id = ").push_bind(sensor_id.to_string());
        }
        qb.push(" ORDER BY id DESC LIMIT ").push_bind(i64::from(limit));

        let rows: Vec<TrendRow> = qb.build_query_as::<TrendRow>().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Trend::from).collect())
    }

    /// Upsert the singleton system state row.
    pub async fn save_system_state(&self, state: &SystemState) -> NodeResult<()> {
        // ---
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            r#"
            INSERT INTO system_state (id, last_activity_ms, power_mode, ml_last_run_ms)
            VALUES (1, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                last_activity_ms = excluded.last_activity_ms,
                power_mode       = excluded.power_mode,
                ml_last_run_ms   = excluded.ml_last_run_ms
            "#,
        )
        .bind(state.last_activity.timestamp_millis())
        .bind(state.power_mode)
        .bind(state.ml_last_run.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_system_state(&self) -> NodeResult<Option<SystemState>> {
        // ---
        let row: Option<SystemStateRow> = sqlx::query_as(
            "SELECT last_activity_ms, power_mode, ml_last_run_ms FROM system_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| SystemState {
            last_activity: from_millis(row.last_activity_ms),
            power_mode: row.power_mode,
            ml_last_run: row.ml_last_run_ms.map(from_millis),
        }))
    }
}
