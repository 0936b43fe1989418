//! WebSocket stream of round events
//!
//! A client first receives the current round snapshot, then every
//! [`RoundEvent`] as JSON. Tick events can be switched off with
//! `?ticks=false` for observers that only care about outcomes.

use super::handlers::AppState;
use crate::{events::RoundEvent, orchestrator::GameHandle, round::RoundSnapshot};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::broadcast, time::interval};
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Frames sent by the server besides the engine's own events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsFrame {
    /// Sent once on connect
    Snapshot { round: Option<RoundSnapshot> },
    /// The client fell behind and `skipped` events were dropped
    Lagged { skipped: u64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsSubscription {
    #[serde(default = "default_ticks")]
    pub ticks: bool,
}

fn default_ticks() -> bool {
    true
}

impl Default for WsSubscription {
    fn default() -> Self {
        Self { ticks: true }
    }
}

fn should_send_event(event: &RoundEvent, subscription: &WsSubscription) -> bool {
    subscription.ticks || !matches!(event, RoundEvent::Tick { .. })
}

/// WebSocket connection manager
#[derive(Clone)]
pub struct WebSocketManager {
    game: GameHandle,
    client_count: Arc<AtomicU64>,
}

impl WebSocketManager {
    pub fn new(game: GameHandle) -> Self {
        Self {
            game,
            client_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn client_count(&self) -> u64 {
        self.client_count.load(Ordering::SeqCst)
    }

    pub fn handle_upgrade(&self, ws: WebSocketUpgrade, subscription: WsSubscription) -> Response {
        let manager = self.clone();
        ws.on_upgrade(move |socket| async move { manager.handle_connection(socket, subscription).await })
    }

    async fn handle_connection(&self, socket: WebSocket, subscription: WsSubscription) {
        let clients = self.client_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(clients, ticks = subscription.ticks, "WebSocket client connected");

        let (mut sender, mut receiver) = socket.split();
        // Subscribe before taking the snapshot so no event falls in between
        let mut events = self.game.subscribe();

        let snapshot = WsFrame::Snapshot {
            round: self.game.current_round().await,
        };
        let sent = match serde_json::to_string(&snapshot) {
            Ok(text) => sender.send(Message::Text(text)).await.is_ok(),
            Err(e) => {
                warn!(error = %e, "Failed to encode round snapshot");
                false
            }
        };

        if sent {
            let mut heartbeat = interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    event = events.recv() => {
                        let text = match event {
                            Ok(event) if should_send_event(&event, &subscription) => serde_json::to_string(&event),
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!(skipped, "WebSocket client lagging");
                                serde_json::to_string(&WsFrame::Lagged { skipped })
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        let Ok(text) = text else { continue };
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    incoming = receiver.next() => {
                        match incoming {
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                debug!(error = %e, "WebSocket receive error");
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                    _ = heartbeat.tick() => {
                        if sender.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        let remaining = self.client_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        info!(remaining, "WebSocket client disconnected");
    }
}

/// GET /ws
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(subscription): Query<WsSubscription>,
) -> Response {
    state.websocket_manager.handle_upgrade(ws, subscription)
}
