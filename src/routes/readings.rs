//! Reading endpoints: list, create (structured body or raw producer line) and
//! the distinct sensor list.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{bounded, MAX_HOURS};
use crate::{store::DEFAULT_LIMIT, AppState, IncomingReading, NodeError, NodeResult, Reading};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/readings", get(list_readings).post(create_reading))
        .route("/api/readings/raw", post(ingest_raw))
        .route("/api/sensors", get(list_sensors))
}

/// Query parameters for filtering sensor readings
#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    sensor_id: Option<String>,
    hours: Option<u32>,
    limit: Option<u32>,
}

async fn list_readings(
    Query(params): Query<ReadingsQuery>,
    State(state): State<AppState>,
) -> NodeResult<Json<Vec<Reading>>> {
    // ---
    let limit = bounded(params.limit, DEFAULT_LIMIT, 1000, "limit")?;
    let hours = params
        .hours
        .map(|h| bounded(Some(h), h, MAX_HOURS, "hours"))
        .transpose()?;

    let readings = state
        .store
        .query(params.sensor_id.as_deref(), hours, limit)
        .await?;
    Ok(Json(readings))
}

/// Manual/test producer: one structured reading in the body.
///
/// A body that does not decode (bad JSON, wrong field types, wrong content
/// type) is a validation error on `body` like any other malformed input.
async fn create_reading(
    State(state): State<AppState>,
    payload: Result<Json<IncomingReading>, JsonRejection>,
) -> NodeResult<(StatusCode, Json<Reading>)> {
    // ---
    let Json(incoming) = payload.map_err(|e| NodeError::validation("body", e.body_text()))?;
    let reading = state.gateway.ingest(incoming).await?;
    info!("POST /api/readings - stored reading {}", reading.id);
    Ok((StatusCode::CREATED, Json(reading)))
}

/// One producer line in either wire encoding, as plain text.
async fn ingest_raw(
    State(state): State<AppState>,
    body: String,
) -> NodeResult<(StatusCode, Json<Reading>)> {
    // ---
    let reading = state.gateway.ingest_line(&body).await?;
    info!("POST /api/readings/raw - stored reading {}", reading.id);
    Ok((StatusCode::CREATED, Json(reading)))
}

#[derive(Debug, Serialize)]
struct SensorsResponse {
    sensors: Vec<String>,
    count: usize,
}

async fn list_sensors(State(state): State<AppState>) -> NodeResult<Json<SensorsResponse>> {
    // ---
    let sensors = state.store.list_sensors().await?;
    Ok(Json(SensorsResponse {
        count: sensors.len(),
        sensors,
    }))
}
