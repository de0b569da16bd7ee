//! Database schema management for the smart node.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::SqlitePool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the append-only `sensor_readings`, `anomalies` and `trends` tables
/// and the singleton `system_state` row holder. Instants are stored as UTC
/// epoch milliseconds. Safe to call on every startup; no-op if objects already
/// exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // AUTOINCREMENT keeps ids strictly increasing and never reused
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_readings (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            sensor_id     TEXT    NOT NULL,
            temperature   REAL,
            humidity      REAL,
            air_quality   REAL,
            rssi          INTEGER,
            timestamp_ms  INTEGER NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS anomalies (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            sensor_id       TEXT    NOT NULL,
            reading_id      INTEGER NOT NULL REFERENCES sensor_readings (id),
            anomaly_type    TEXT    NOT NULL,
            severity        REAL    NOT NULL,
            detected_at_ms  INTEGER NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trends (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            sensor_id         TEXT    NOT NULL,
            metric            TEXT    NOT NULL,
            trend_direction   TEXT    NOT NULL,
            slope             REAL    NOT NULL,
            calculated_at_ms  INTEGER NOT NULL,
            time_window       INTEGER NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS system_state (
            id                INTEGER PRIMARY KEY CHECK (id = 1),
            last_activity_ms  INTEGER NOT NULL,
            power_mode        TEXT    NOT NULL,
            ml_last_run_ms    INTEGER
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Range scans by sensor and time
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_readings_sensor_ts
            ON sensor_readings (sensor_id, timestamp_ms);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_readings_ts
            ON sensor_readings (timestamp_ms);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_trends_sensor_id
            ON trends (sensor_id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::memory_pool;

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        // ---
        let pool = memory_pool().await.unwrap();
        create_schema(&pool).await.unwrap();
        create_schema(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(names, ["anomalies", "sensor_readings", "system_state", "trends"]);
    }
}
