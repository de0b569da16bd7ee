//! Application entry point for the `smartnode` climate monitoring service.
//!
//! This binary orchestrates the full startup sequence for the smart node,
//! including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Opening the SQLite connection pool
//! - Creating the schema and wiring the components (`smartnode::bootstrap`)
//! - Starting the LoRa receiver and the power mode monitor
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Binding the Axum HTTP server and serving requests until Ctrl-C
//!
//! # Environment Variables
//! - `DATABASE_URL` (optional) – SQLite connection string
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//! - see `config.rs` for the rest
use std::{env, net::SocketAddr, time::Duration};

use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tokio::task::JoinHandle;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::{Context, Result};

use smartnode::{config, routes, store, AppState, IngestionGateway};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Starting CCI Smart Node...");

    let pool = store::connect(&cfg.db_url, cfg.db_pool_max)
        .await
        .with_context(|| format!("Failed to open database '{}'", cfg.db_url))?;

    tracing::info!("Database opened");

    let state = smartnode::bootstrap(pool.clone(), &cfg).await?;

    if let Some(port) = cfg.lora_port.clone() {
        start_receiver(port, cfg.lora_baudrate, state.gateway.clone());
    } else {
        tracing::warn!("LORA_PORT not set - running without LoRa");
    }

    let power_task = spawn_power_monitor(state.clone(), Duration::from_secs(cfg.power_tick_secs));

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", cfg.host, cfg.port))?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down CCI Smart Node...");
    power_task.abort();
    pool.close().await;

    Ok(())
}

// ---

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Periodically re-derive the power mode; log and persist each change.
fn spawn_power_monitor(state: AppState, period: Duration) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Some(snapshot) = state.power.tick() {
                let idle_secs = (chrono::Utc::now() - snapshot.last_activity).num_seconds();
                tracing::info!(
                    "Entering {} mode after {}s of inactivity",
                    snapshot.power_mode,
                    idle_secs
                );
                if let Err(e) = state.store.save_system_state(&snapshot).await {
                    tracing::error!("Error in power management: {}", e);
                }
            }
        }
    })
}

#[cfg(feature = "serial")]
fn start_receiver(port: String, baud_rate: u32, gateway: IngestionGateway) {
    // ---
    let (tx, rx) = tokio::sync::mpsc::channel(256);
    match smartnode::receiver::spawn_serial_reader(port, baud_rate, tx) {
        Ok(_) => {
            tokio::spawn(smartnode::receiver::run(rx, gateway));
        }
        Err(e) => tracing::warn!("Could not start LoRa reader thread: {} - running without LoRa", e),
    }
}

#[cfg(not(feature = "serial"))]
fn start_receiver(port: String, _baud_rate: u32, _gateway: IngestionGateway) {
    tracing::warn!(
        "LORA_PORT={} ignored: built without the `serial` feature - running without LoRa",
        port
    );
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AXUM_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `AXUM_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to AXUM_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
