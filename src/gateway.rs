//! Ingestion Gateway: the single entry point for new readings.
//!
//! Both producers, the serial receiver and the HTTP create path, end up in
//! [`IngestionGateway::ingest`]. A reading is validated, persisted, marks
//! activity and is only then published, so a live viewer never sees a reading
//! that is not yet queryable.

use std::sync::Arc;

use chrono::Utc;

use crate::error::NodeResult;
use crate::hub::BroadcastHub;
use crate::models::{IncomingReading, Reading, StreamEvent};
use crate::power::PowerState;
use crate::receiver;
use crate::store::ReadingStore;

// ---

#[derive(Debug, Clone)]
pub struct IngestionGateway {
    store: ReadingStore,
    power: Arc<PowerState>,
    hub: BroadcastHub,
}

impl IngestionGateway {
    // ---
    pub fn new(store: ReadingStore, power: Arc<PowerState>, hub: BroadcastHub) -> Self {
        Self { store, power, hub }
    }

    /// Validate and persist one reading, then announce it to live viewers.
    ///
    /// Fails with `Validation` before anything is written, or with
    /// `StoreUnavailable` if the append did not happen; in both cases nothing
    /// is published.
    pub async fn ingest(&self, incoming: IncomingReading) -> NodeResult<Reading> {
        // ---
        let reading = match incoming.validate(Utc::now()) {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!("Rejected reading: {}", e);
                return Err(e);
            }
        };

        let stored = self.store.append(&reading).await?;
        tracing::debug!(
            "Stored reading {} from {} (temp={:?} hum={:?} aqi={:?} rssi={:?})",
            stored.id,
            stored.sensor_id,
            stored.temperature,
            stored.humidity,
            stored.air_quality,
            stored.rssi
        );

        let state = self.power.record_activity();
        if let Err(e) = self.store.save_system_state(&state).await {
            tracing::warn!("Failed to persist system state: {}", e);
        }

        let delivered = self.hub.publish(StreamEvent::Reading(stored.clone()));
        tracing::trace!("Reading {} pushed to {} subscribers", stored.id, delivered);

        Ok(stored)
    }

    /// Decode one raw producer line (structured or delimited) and ingest it.
    pub async fn ingest_line(&self, line: &str) -> NodeResult<Reading> {
        // ---
        let incoming = match receiver::parse_message(line) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::warn!("Could not parse message {:?}: {}", line, e);
                return Err(e);
            }
        };
        self.ingest(incoming).await
    }
}
