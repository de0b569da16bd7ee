// src/routes/health.rs
//! API health check endpoints for the smart node.
//!
//! This module defines the `/health` route used by container orchestrators
//! and supervisors to verify that the service is running, plus the `/api/`
//! banner the dashboard probes on startup. It is a sibling module in the
//! `routes` directory and follows the Explicit Module Boundary Pattern (EMBP):
//! - Internal to this file: endpoint handler(s) and related types
//! - Exports to the gateway (`mod.rs`): a subrouter containing both routes

use axum::{routing::get, Json, Router};
use serde::Serialize;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// JSON response body for the `/api/` banner.
#[derive(Serialize)]
struct BannerResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

/// Handle `GET /health`.
///
/// Deliberately lightweight: does not touch the store or the hub.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn banner() -> Json<BannerResponse> {
    Json(BannerResponse {
        status: "online",
        service: "CCI Smart Node API",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Create a subrouter containing the `/health` and `/api/` routes.
///
/// Generic over the application state so it can merge cleanly with the
/// gateway router, regardless of the state type.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/api/", get(banner))
}
