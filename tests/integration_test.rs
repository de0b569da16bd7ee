use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use smartnode::{
    routes, store, Anomaly, AnomalyReport, AppState, Config, Metric, PowerMode, Reading,
    StreamEvent, SystemState, Trend, TrendDirection,
};
use tokio_test::assert_ok;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Start a node on an ephemeral port backed by an in-memory database.
async fn spawn_node() -> Result<(String, AppState)> {
    // ---
    let pool = store::memory_pool().await?;
    let state = smartnode::bootstrap(pool, &Config::default()).await?;
    let app = routes::router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Ok((format!("127.0.0.1:{}", addr.port()), state))
}

async fn post_reading(client: &Client, host: &str, body: Value) -> Result<Reading> {
    // ---
    let resp = client
        .post(format!("http://{host}/api/readings"))
        .json(&body)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED, "body: {body}");
    Ok(resp.json().await?)
}

/// Next text frame on the stream, skipping control frames.
async fn next_event<S>(ws: &mut S) -> Result<StreamEvent>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    // ---
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .context("timed out waiting for stream event")?
            .context("stream closed")??;
        if msg.is_text() {
            return Ok(serde_json::from_str(msg.to_text()?)?);
        }
    }
}

#[tokio::test]
async fn create_and_list_readings() -> Result<()> {
    // ---
    let (host, _state) = spawn_node().await?;
    let client = Client::new();

    let first = post_reading(
        &client,
        &host,
        json!({"sensor_id": "ENV001", "temp": 22.5, "humidity": 65, "aqi": 45, "rssi": -80}),
    )
    .await?;
    assert_eq!(first.temperature, Some(22.5));
    assert_eq!(first.air_quality, Some(45.0));

    let raw = client
        .post(format!("http://{host}/api/readings/raw"))
        .body("ENV002,,61.5,,-72")
        .send()
        .await?;
    assert_eq!(raw.status(), StatusCode::CREATED);
    let second: Reading = raw.json().await?;
    assert!(second.id > first.id);

    let all: Vec<Reading> = client
        .get(format!("http://{host}/api/readings"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(all, vec![second.clone(), first.clone()]);

    let filtered: Vec<Reading> = client
        .get(format!("http://{host}/api/readings?sensor_id=ENV001&hours=1&limit=10"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(filtered, vec![first]);

    let sensors: Value = client
        .get(format!("http://{host}/api/sensors"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(sensors, json!({"sensors": ["ENV001", "ENV002"], "count": 2}));

    Ok(())
}

#[tokio::test]
async fn invalid_input_is_rejected_with_field() -> Result<()> {
    // ---
    let (host, _state) = spawn_node().await?;
    let client = Client::new();

    let resp = client
        .post(format!("http://{host}/api/readings"))
        .json(&json!({"sensor_id": "ENV001", "rssi": -60}))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["field"], "metrics");

    let resp = client
        .post(format!("http://{host}/api/readings"))
        .json(&json!({"sensor_id": "", "temperature": 20.0}))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client
        .post(format!("http://{host}/api/readings"))
        .json(&json!({"sensor_id": "A", "temp": "hot"}))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["field"], "body");
    assert!(body["error"].is_string());

    let resp = client
        .post(format!("http://{host}/api/readings"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["field"], "body");

    let resp = client
        .get(format!("http://{host}/api/readings?limit=5000"))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["field"], "limit");

    let resp = client
        .post(format!("http://{host}/api/analyze/trends?hours=500"))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // unknown sensors are simply empty
    let none: Vec<Reading> = client
        .get(format!("http://{host}/api/readings?sensor_id=NOPE"))
        .send()
        .await?
        .json()
        .await?;
    assert!(none.is_empty());

    Ok(())
}

#[tokio::test]
async fn anomaly_detection_flags_the_spike() -> Result<()> {
    // ---
    let (host, _state) = spawn_node().await?;
    let client = Client::new();

    let mut spike = None;
    for t in [20.0, 21.0, 20.0, 21.0, 95.0] {
        let stored = post_reading(&client, &host, json!({"sensor_id": "ENV001", "temperature": t})).await?;
        if t == 95.0 {
            spike = Some(stored.id);
        }
    }

    let resp = client
        .post(format!("http://{host}/api/analyze/anomalies?sensor_id=ENV001&hours=24"))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let anomalies: Vec<Anomaly> = resp.json().await?;
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].anomaly_type, Metric::Temperature);
    assert_eq!(Some(anomalies[0].reading_id), spike);
    assert!((0.0..=1.0).contains(&anomalies[0].severity));

    let stored: Vec<AnomalyReport> = client
        .get(format!("http://{host}/api/anomalies"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].anomaly, anomalies[0]);
    assert_eq!(stored[0].temperature, Some(95.0));

    let state: SystemState = client
        .get(format!("http://{host}/api/system/state"))
        .send()
        .await?
        .json()
        .await?;
    assert!(state.ml_last_run.is_some());

    Ok(())
}

#[tokio::test]
async fn trend_analysis_finds_rising_temperature() -> Result<()> {
    // ---
    let (host, _state) = spawn_node().await?;
    let client = Client::new();
    let now = Utc::now();

    for (i, t) in [10.0, 12.0, 14.0, 16.0, 18.0].iter().enumerate() {
        let at = now - chrono::Duration::hours(4 - i as i64);
        post_reading(
            &client,
            &host,
            json!({"sensor_id": "ENV001", "temperature": t, "timestamp": at.to_rfc3339()}),
        )
        .await?;
    }

    let trends: Vec<Trend> = client
        .post(format!("http://{host}/api/analyze/trends"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(trends.len(), 1);
    assert_eq!(trends[0].trend_direction, TrendDirection::Increasing);
    assert!((trends[0].slope - 2.0).abs() < 1e-3, "slope {}", trends[0].slope);

    let listed: Vec<Trend> = client
        .get(format!("http://{host}/api/trends?sensor_id=ENV001"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(listed, trends);

    let prediction: Value = client
        .get(format!("http://{host}/api/predict?sensor_id=ENV001&metric=temperature"))
        .send()
        .await?
        .json()
        .await?;
    let predicted = prediction["predicted"].as_f64().context("no prediction")?;
    assert!((predicted - 20.0).abs() < 1e-6);

    Ok(())
}

#[tokio::test]
async fn wake_returns_active_state() -> Result<()> {
    // ---
    let (host, _state) = spawn_node().await?;
    let client = Client::new();

    for _ in 0..2 {
        let resp = client
            .post(format!("http://{host}/api/system/wake"))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);
        let state: SystemState = resp.json().await?;
        assert_eq!(state.power_mode, PowerMode::Active);
    }

    let health: Value = client
        .get(format!("http://{host}/health"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(health["status"], "ok");

    Ok(())
}

#[tokio::test]
async fn cross_origin_dashboard_is_allowed() -> Result<()> {
    // ---
    let (host, _state) = spawn_node().await?;
    let client = Client::new();

    let resp = client
        .get(format!("http://{host}/api/readings"))
        .header("Origin", "http://dashboard.local:3000")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");

    let preflight = client
        .request(reqwest::Method::OPTIONS, format!("http://{host}/api/readings"))
        .header("Origin", "http://dashboard.local:3000")
        .header("Access-Control-Request-Method", "POST")
        .header("Access-Control-Request-Headers", "content-type")
        .send()
        .await?;
    assert!(preflight.status().is_success());
    assert_eq!(preflight.headers()["access-control-allow-origin"], "*");
    assert!(preflight.headers().contains_key("access-control-allow-methods"));

    Ok(())
}

#[tokio::test]
async fn live_stream_pushes_readings_and_anomalies() -> Result<()> {
    // ---
    let (host, state) = spawn_node().await?;
    let client = Client::new();

    let (mut ws, _) = connect_async(format!("ws://{host}/ws")).await?;
    assert_eq!(state.hub.subscriber_count(), 1);

    let mut stored = Vec::new();
    for t in [20.0, 21.0, 20.0, 21.0, 95.0] {
        stored.push(post_reading(&client, &host, json!({"sensor_id": "ENV001", "temp": t})).await?);
    }
    for expected in &stored {
        match next_event(&mut ws).await? {
            StreamEvent::Reading(r) => assert_eq!(&r, expected),
            other => panic!("expected reading, got {other:?}"),
        }
    }

    let anomalies: Vec<Anomaly> = client
        .post(format!("http://{host}/api/analyze/anomalies"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(anomalies.len(), 1);
    assert_eq!(next_event(&mut ws).await?, StreamEvent::Anomaly(anomalies[0].clone()));

    // inbound frames count as activity; they are not echoed
    assert_ok!(ws.send(Message::Text("ping".into())).await);

    ws.close(None).await?;
    drop(ws);

    // the server notices the close and unsubscribes
    for _ in 0..50 {
        if state.hub.subscriber_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.hub.subscriber_count(), 0);

    Ok(())
}
