//! Route Definitions

use super::{handlers::*, websocket::websocket_handler};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Rounds
        .route("/round", get(current_round_handler))
        .route("/rounds/:round_id", get(round_handler))
        .route("/rounds/:round_id/bets", post(place_bet_handler))
        .route("/rounds/:round_id/cashout", post(cash_out_handler))
        // Players and history
        .route("/players/:player_id", get(player_handler))
        .route("/results", get(results_handler))
        // Live stream
        .route("/ws", get(websocket_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
