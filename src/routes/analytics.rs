//! Analytics endpoints: stored anomalies and trends, on-demand runs, and
//! next-value prediction.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{bounded, MAX_HOURS};
use crate::{Anomaly, AnomalyReport, AppState, Metric, NodeResult, Trend};

// ---

/// Default analysis window, hours.
const DEFAULT_HOURS: u32 = 24;

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/anomalies", get(list_anomalies))
        .route("/api/analyze/anomalies", post(run_anomaly_detection))
        .route("/api/trends", get(list_trends))
        .route("/api/analyze/trends", post(run_trend_analysis))
        .route("/api/predict", get(predict))
}

#[derive(Debug, Deserialize)]
struct AnomaliesQuery {
    limit: Option<u32>,
}

async fn list_anomalies(
    Query(params): Query<AnomaliesQuery>,
    State(state): State<AppState>,
) -> NodeResult<Json<Vec<AnomalyReport>>> {
    // ---
    let limit = bounded(params.limit, 50, 500, "limit")?;
    Ok(Json(state.store.query_anomalies(limit).await?))
}

#[derive(Debug, Deserialize)]
struct TrendsQuery {
    sensor_id: Option<String>,
    limit: Option<u32>,
}

/// Latest trends; by default one row per metric for a sensor, ten overall.
async fn list_trends(
    Query(params): Query<TrendsQuery>,
    State(state): State<AppState>,
) -> NodeResult<Json<Vec<Trend>>> {
    // ---
    let default = if params.sensor_id.is_some() { 3 } else { 10 };
    let limit = bounded(params.limit, default, 500, "limit")?;
    let trends = state
        .store
        .query_trends(params.sensor_id.as_deref(), limit)
        .await?;
    Ok(Json(trends))
}

#[derive(Debug, Deserialize)]
struct AnalyzeQuery {
    sensor_id: Option<String>,
    hours: Option<u32>,
}

async fn run_anomaly_detection(
    Query(params): Query<AnalyzeQuery>,
    State(state): State<AppState>,
) -> NodeResult<Json<Vec<Anomaly>>> {
    // ---
    let hours = bounded(params.hours, DEFAULT_HOURS, MAX_HOURS, "hours")?;
    info!("POST /api/analyze/anomalies - sensor={:?} hours={}", params.sensor_id, hours);

    let anomalies = state
        .analytics
        .detect(params.sensor_id.as_deref(), hours)
        .await?;
    Ok(Json(anomalies))
}

async fn run_trend_analysis(
    Query(params): Query<AnalyzeQuery>,
    State(state): State<AppState>,
) -> NodeResult<Json<Vec<Trend>>> {
    // ---
    let hours = bounded(params.hours, DEFAULT_HOURS, MAX_HOURS, "hours")?;
    info!("POST /api/analyze/trends - sensor={:?} hours={}", params.sensor_id, hours);

    let trends = state
        .analytics
        .analyze(params.sensor_id.as_deref(), hours)
        .await?;
    Ok(Json(trends))
}

#[derive(Debug, Deserialize)]
struct PredictQuery {
    sensor_id: String,
    metric: Metric,
}

#[derive(Debug, Serialize)]
struct PredictResponse {
    sensor_id: String,
    metric: Metric,
    predicted: Option<f64>,
}

async fn predict(
    Query(params): Query<PredictQuery>,
    State(state): State<AppState>,
) -> NodeResult<Json<PredictResponse>> {
    // ---
    let predicted = state.analytics.predict(&params.sensor_id, params.metric).await?;
    Ok(Json(PredictResponse {
        sensor_id: params.sensor_id,
        metric: params.metric,
        predicted,
    }))
}
