//! System state endpoints: read the lazily derived power state, or wake it.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};

use crate::{AppState, SystemState};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/system/state", get(system_state))
        .route("/api/system/wake", post(wake))
}

async fn system_state(State(state): State<AppState>) -> Json<SystemState> {
    Json(state.power.snapshot())
}

/// Handle `POST /api/system/wake`.
///
/// The in-memory state is authoritative; a failed write of the mirror row is
/// logged and does not fail the wake.
async fn wake(State(state): State<AppState>) -> Json<SystemState> {
    // ---
    let snapshot = state.power.wake();
    if let Err(e) = state.store.save_system_state(&snapshot).await {
        tracing::warn!("Failed to persist system state: {}", e);
    }
    Json(snapshot)
}
