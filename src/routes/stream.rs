//! Live stream endpoint (`GET /ws`).
//!
//! The subscription is registered before the upgrade response is sent, so a
//! client that has completed the handshake is guaranteed to see every event
//! published afterwards. A failed or stalled send ends the connection and
//! drops the subscription.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::{AppState, PowerState, Subscription};

// ---

/// A viewer that cannot take one frame within this long is considered gone.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/ws", get(handler))
}

async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    // ---
    let subscription = state.hub.subscribe();
    let power = state.power.clone();
    ws.on_upgrade(move |socket| stream_events(socket, subscription, power))
}

async fn stream_events(socket: WebSocket, subscription: Subscription, power: Arc<PowerState>) {
    // ---
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode stream event: {}", e);
                        continue;
                    }
                };
                match tokio::time::timeout(SEND_TIMEOUT, sender.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Subscriber {} send failed: {}", subscription.id(), e);
                        break;
                    }
                    Err(_) => {
                        warn!("Subscriber {} stalled, disconnecting", subscription.id());
                        break;
                    }
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    debug!("Received from client {}: {}", subscription.id(), text.as_str());
                    power.record_activity();
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Subscriber {} receive failed: {}", subscription.id(), e);
                    break;
                }
            }
        }
    }

    subscription.unsubscribe();
}
