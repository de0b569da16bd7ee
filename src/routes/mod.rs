//! HTTP/WebSocket boundary. Each sibling file owns one endpoint family and
//! exports a sub-router; this gateway merges them and maps [`NodeError`] to
//! responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::{AppState, NodeError, NodeResult};

mod analytics;
mod health;
mod readings;
mod stream;
mod system;

// ---

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(analytics::router())
        .merge(system::router())
        .merge(stream::router())
        .merge(health::router())
        .with_state(state)
        .layer(
            // dashboard is served from its own origin
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        // ---
        let status = match &self {
            NodeError::Validation { .. } => StatusCode::BAD_REQUEST,
            NodeError::StoreUnavailable(e) => {
                tracing::error!("Store unavailable: {}", e);
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        let body = json!({ "error": self.to_string(), "field": self.field() });
        (status, Json(body)).into_response()
    }
}

/// Apply a default and check an inclusive range for a query parameter.
fn bounded(value: Option<u32>, default: u32, max: u32, field: &'static str) -> NodeResult<u32> {
    // ---
    let value = value.unwrap_or(default);
    if !(1..=max).contains(&value) {
        return Err(NodeError::validation(
            field,
            format!("must be between 1 and {max}, got {value}"),
        ));
    }
    Ok(value)
}

/// Longest analysis or query window, in hours (one week).
const MAX_HOURS: u32 = 168;
