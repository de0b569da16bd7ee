//! Library gateway for the `smartnode` climate monitoring service.
//!
//! Readings arrive from the LoRa receiver or the HTTP create path, pass
//! through the [`IngestionGateway`] into the [`ReadingStore`], and are pushed
//! to live viewers by the [`BroadcastHub`]. The [`AnalyticsEngine`] runs
//! anomaly and trend detection on request, and the [`PowerState`] tracks
//! activity to derive the node's power mode.
//!
//! This module follows the Explicit Module Boundary Pattern (EMBP): sibling
//! modules import each other through the paths re-exported here, and
//! `main.rs` only sees [`bootstrap`] and [`routes::router`].

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

pub mod analytics;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod models;
pub mod power;
pub mod receiver;
pub mod routes;
pub mod schema;
pub mod store;

pub use analytics::AnalyticsEngine;
pub use config::Config;
pub use error::{NodeError, NodeResult};
pub use gateway::IngestionGateway;
pub use hub::{BroadcastHub, Subscription};
pub use models::{
    Anomaly, AnomalyReport, IncomingReading, Metric, PowerMode, Reading, StreamEvent, SystemState,
    Trend, TrendDirection,
};
pub use power::PowerState;
pub use store::ReadingStore;

// ---

/// Shared handles of every component, cloned into each request handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub store: ReadingStore,
    pub hub: BroadcastHub,
    pub power: Arc<PowerState>,
    pub gateway: IngestionGateway,
    pub analytics: AnalyticsEngine,
}

/// Create the schema, initialize the singleton system state and wire the
/// components together.
///
/// The power state starts `active` as of now; only `ml_last_run` survives a
/// restart.
pub async fn bootstrap(pool: SqlitePool, config: &Config) -> Result<AppState> {
    // ---
    schema::create_schema(&pool).await?;

    let store = ReadingStore::new(pool);
    let ml_last_run = store
        .load_system_state()
        .await?
        .and_then(|state| state.ml_last_run);

    let idle_timeout = chrono::Duration::seconds(i64::try_from(config.idle_timeout_secs)?);
    let power = Arc::new(PowerState::new(idle_timeout, ml_last_run));
    store.save_system_state(&power.snapshot()).await?;

    let hub = BroadcastHub::new(config.subscriber_queue);
    let gateway = IngestionGateway::new(store.clone(), power.clone(), hub.clone());
    let analytics = AnalyticsEngine::new(
        store.clone(),
        hub.clone(),
        power.clone(),
        config.trend_dead_band,
    );

    tracing::info!("Smart node initialized");

    Ok(AppState {
        store,
        hub,
        power,
        gateway,
        analytics,
    })
}
