//! Telemetry receiver: turns producer lines into readings.
//!
//! The radio module delivers one message per line, either as a JSON object
//! (`{"sensor_id": "ENV001", "temp": 22.5, "humidity": 65, "aqi": 45}`) or as
//! positional fields (`ENV001,22.5,65,45,-80`). Lines travel over a channel
//! into [`run`], which feeds the ingestion gateway; with the `serial` feature a
//! blocking reader thread fills that channel from the serial device.

use tokio::sync::mpsc;

use crate::error::{NodeError, NodeResult};
use crate::gateway::IngestionGateway;
use crate::models::IncomingReading;

// ---

/// Decode one producer line. Structured JSON is tried first, then the
/// delimited form `sensor_id,temperature,humidity,air_quality,rssi` where any
/// field after `sensor_id` may be an empty segment.
pub fn parse_message(line: &str) -> NodeResult<IncomingReading> {
    // ---
    let line = line.trim();
    if line.is_empty() {
        return Err(NodeError::validation("message", "empty message"));
    }

    if line.starts_with('{') {
        return serde_json::from_str(line)
            .map_err(|e| NodeError::validation("message", format!("malformed JSON: {e}")));
    }

    parse_delimited(line)
}

fn parse_delimited(line: &str) -> NodeResult<IncomingReading> {
    // ---
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() > 5 {
        return Err(NodeError::validation(
            "message",
            format!("expected at most 5 fields, got {}", parts.len()),
        ));
    }

    let segment = |i: usize| parts.get(i).copied().filter(|s| !s.is_empty());

    Ok(IncomingReading {
        sensor_id: segment(0).map(str::to_string),
        temperature: parse_field(segment(1), "temperature")?,
        humidity: parse_field(segment(2), "humidity")?,
        air_quality: parse_field(segment(3), "air_quality")?,
        rssi: parse_field(segment(4), "rssi")?,
        timestamp: None,
    })
}

fn parse_field<T: std::str::FromStr>(raw: Option<&str>, field: &'static str) -> NodeResult<Option<T>> {
    raw.map(|s| {
        s.parse::<T>()
            .map_err(|_| NodeError::validation(field, format!("not a number: '{s}'")))
    })
    .transpose()
}

/// Outcome counters of one receiver run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverStats {
    pub accepted: u64,
    pub rejected: u64,
    pub failed: u64,
}

/// Drain producer lines into the gateway until the sending side closes.
///
/// Rejected lines are logged and dropped. Store failures are logged as errors;
/// the radio has no way to resend, so the line is counted as failed.
pub async fn run(mut lines: mpsc::Receiver<String>, gateway: IngestionGateway) -> ReceiverStats {
    // ---
    tracing::info!("LoRa receiver started");
    let mut stats = ReceiverStats::default();

    while let Some(line) = lines.recv().await {
        tracing::debug!("Received: {}", line);
        match gateway.ingest_line(&line).await {
            Ok(_) => stats.accepted += 1,
            Err(NodeError::Validation { .. }) => stats.rejected += 1,
            Err(e) => {
                tracing::error!("Error handling LoRa data: {}", e);
                stats.failed += 1;
            }
        }
    }

    tracing::info!(
        "LoRa receiver stopped ({} accepted, {} rejected, {} failed)",
        stats.accepted,
        stats.rejected,
        stats.failed
    );
    stats
}

/// Read newline-terminated messages from a serial device on a dedicated
/// thread, reconnecting after errors, until the receiving side is dropped.
#[cfg(feature = "serial")]
pub fn spawn_serial_reader(
    port: String,
    baud_rate: u32,
    tx: mpsc::Sender<String>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    // ---
    use std::io::{BufRead, BufReader, ErrorKind};
    use std::time::Duration;

    std::thread::Builder::new()
        .name("lora-serial".into())
        .spawn(move || loop {
            match serialport::new(&port, baud_rate)
                .timeout(Duration::from_secs(1))
                .open()
            {
                Ok(conn) => {
                    tracing::info!("Connected to LoRa module on {}", port);
                    let mut reader = BufReader::new(conn);
                    let mut line = String::new();
                    loop {
                        match reader.read_line(&mut line) {
                            Ok(0) => break,
                            Ok(_) => {
                                let message = line.trim().to_string();
                                line.clear();
                                if !message.is_empty() && tx.blocking_send(message).is_err() {
                                    return;
                                }
                            }
                            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                            Err(e) => {
                                tracing::error!("Serial error: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => tracing::error!("Failed to connect to LoRa module on {}: {}", port, e),
            }

            if tx.is_closed() {
                return;
            }
            std::thread::sleep(Duration::from_secs(1));
        })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::hub::BroadcastHub;
    use crate::power::PowerState;
    use crate::store::{tests::test_store, DEFAULT_LIMIT};
    use std::sync::Arc;

    #[test]
    fn test_parse_structured() {
        // ---
        let msg = parse_message(r#"{"sensor_id":"ENV001","temperature":22.5,"air_quality":45,"rssi":-80}"#)
            .unwrap();
        assert_eq!(msg.sensor_id.as_deref(), Some("ENV001"));
        assert_eq!(msg.temperature, Some(22.5));
        assert_eq!(msg.humidity, None);
        assert_eq!(msg.air_quality, Some(45.0));
        assert_eq!(msg.rssi, Some(-80));
    }

    #[test]
    fn test_parse_delimited_full_and_sparse() {
        // ---
        let full = parse_message("ENV001,22.5,65,45,-80").unwrap();
        assert_eq!(full.sensor_id.as_deref(), Some("ENV001"));
        assert_eq!(full.temperature, Some(22.5));
        assert_eq!(full.humidity, Some(65.0));
        assert_eq!(full.air_quality, Some(45.0));
        assert_eq!(full.rssi, Some(-80));

        let sparse = parse_message("ENV002,,48.0").unwrap();
        assert_eq!(sparse.temperature, None);
        assert_eq!(sparse.humidity, Some(48.0));
        assert_eq!(sparse.air_quality, None);
        assert_eq!(sparse.rssi, None);
    }

    #[test]
    fn test_parse_errors_name_the_field() {
        // ---
        assert_eq!(
            parse_message("ENV001,hot,65,45").unwrap_err().field(),
            Some("temperature")
        );
        assert_eq!(
            parse_message("ENV001,20,65,45,strong").unwrap_err().field(),
            Some("rssi")
        );
        assert_eq!(parse_message("   ").unwrap_err().field(), Some("message"));
        assert_eq!(parse_message("{not json").unwrap_err().field(), Some("message"));
        assert_eq!(parse_message("a,1,2,3,4,5").unwrap_err().field(), Some("message"));
    }

    #[tokio::test]
    async fn test_run_counts_outcomes_until_channel_closes() {
        // ---
        let store = test_store().await;
        let gateway = IngestionGateway::new(
            store.clone(),
            Arc::new(PowerState::new(chrono::Duration::seconds(300), None)),
            BroadcastHub::default(),
        );

        let (tx, rx) = mpsc::channel(8);
        for line in ["ENV001,20.5,40,30,-70", "ENV001,,,,-70", "nonsense,x", r#"{"sensor_id":"ENV002","hum":55}"#] {
            tx.send(line.to_string()).await.unwrap();
        }
        drop(tx);

        let stats = run(rx, gateway).await;
        assert_eq!(
            stats,
            ReceiverStats {
                accepted: 2,
                rejected: 2,
                failed: 0
            }
        );
        assert_eq!(store.query(None, None, DEFAULT_LIMIT).await.unwrap().len(), 2);
    }
}
