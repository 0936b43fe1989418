//! Request Handlers
//!
//! Thin adapters over [`GameHandle`]. Multipliers, admission and balances
//! are all decided by the engine; handlers only translate.

use super::{
    errors::ApiError,
    middleware::RequestId,
    models::*,
    websocket::WebSocketManager,
};
use crate::{
    accounts::PlayerAccount,
    ledger::CashOut,
    orchestrator::{BetReceipt, GameHandle},
    types::{PlayerId, RoundId},
};
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub game: GameHandle,
    pub version: String,
    pub websocket_manager: Arc<WebSocketManager>,
}

impl AppState {
    pub fn new(game: GameHandle) -> Self {
        Self {
            websocket_manager: Arc::new(WebSocketManager::new(game.clone())),
            version: env!("CARGO_PKG_VERSION").to_string(),
            game,
        }
    }
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        engine: state.game.status(),
        version: state.version.clone(),
        server_time: Utc::now(),
    })
}

/// GET /round
pub async fn current_round_handler(
    request_id: RequestId,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RoundResponse>, ApiError> {
    let round = state
        .game
        .current_round()
        .await
        .ok_or_else(|| ApiError::not_found(request_id.0, "No round is open".to_string()))?;

    Ok(Json(RoundResponse {
        round,
        server_time: Utc::now(),
    }))
}

/// GET /rounds/:round_id
pub async fn round_handler(
    request_id: RequestId,
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<String>,
) -> Result<Json<RoundResponse>, ApiError> {
    let round = state
        .game
        .round(&RoundId::from(round_id.as_str()))
        .await
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?
        .ok_or_else(|| ApiError::not_found(request_id.0, format!("Round {} not found", round_id)))?;

    Ok(Json(RoundResponse {
        round,
        server_time: Utc::now(),
    }))
}

/// POST /rounds/:round_id/bets
pub async fn place_bet_handler(
    request_id: RequestId,
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<String>,
    Json(request): Json<PlaceBetRequest>,
) -> Result<Json<BetReceipt>, ApiError> {
    if request.player_id.trim().is_empty() {
        return Err(ApiError::bad_request(request_id.0, "player_id is required".to_string()));
    }

    let player_id = PlayerId::from(request.player_id.as_str());
    let username = request.username.as_deref().unwrap_or(&request.player_id);

    let receipt = state
        .game
        .place_bet(
            &RoundId::from(round_id.as_str()),
            &player_id,
            username,
            request.amount,
            request.auto_cashout,
        )
        .await
        .map_err(|e| ApiError::from_crash(request_id.0, e))?;

    Ok(Json(receipt))
}

/// POST /rounds/:round_id/cashout
pub async fn cash_out_handler(
    request_id: RequestId,
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<String>,
    Json(request): Json<CashOutRequest>,
) -> Result<Json<CashOut>, ApiError> {
    let receipt = state
        .game
        .cash_out(
            &RoundId::from(round_id.as_str()),
            &PlayerId::from(request.player_id.as_str()),
        )
        .await
        .map_err(|e| ApiError::from_crash(request_id.0, e))?;

    Ok(Json(receipt))
}

/// GET /players/:player_id
pub async fn player_handler(
    request_id: RequestId,
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
) -> Result<Json<PlayerAccount>, ApiError> {
    state
        .game
        .player(&PlayerId::from(player_id.as_str()))
        .await
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(request_id.0, format!("Player {} not found", player_id)))
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    5
}

const MAX_RESULTS: usize = 100;

/// GET /results?limit={n}
pub async fn results_handler(
    request_id: RequestId,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let results = state
        .game
        .recent_results(query.limit.min(MAX_RESULTS))
        .await
        .map_err(|e| ApiError::from_crash(request_id.0, e))?;

    Ok(Json(ResultsResponse {
        count: results.len(),
        results,
    }))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut body = state.game.metrics().to_prometheus_format();
    body.push_str(&format!(
        "# HELP crashline_websocket_clients Connected WebSocket clients\n# TYPE crashline_websocket_clients gauge\ncrashline_websocket_clients {}\n",
        state.websocket_manager.client_count()
    ));

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::CrashlineConfig;
    use crate::fairness::ScriptedCrashPoints;
    use crate::orchestrator::RoundOrchestrator;
    use crate::store::MemoryStore;
    use axum::http::StatusCode;

    fn state() -> Arc<AppState> {
        let orchestrator = RoundOrchestrator::new(
            CrashlineConfig::testing(),
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            Arc::new(ScriptedCrashPoints::repeating([2.0])),
        );
        Arc::new(AppState::new(orchestrator.handle()))
    }

    fn rid() -> RequestId {
        RequestId("req-1".to_string())
    }

    #[tokio::test]
    async fn test_no_round_yet() {
        let err = current_round_handler(rid(), State(state())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.request_id, "req-1");
    }

    #[tokio::test]
    async fn test_bet_on_unknown_round() {
        let request = PlaceBetRequest {
            player_id: "alice".into(),
            username: None,
            amount: 10.0,
            auto_cashout: None,
        };
        let err = place_bet_handler(rid(), State(state()), Path("missing".into()), Json(request))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "ROUND_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_blank_player_rejected() {
        let request = PlaceBetRequest {
            player_id: " ".into(),
            username: None,
            amount: 10.0,
            auto_cashout: None,
        };
        let err = place_bet_handler(rid(), State(state()), Path("r".into()), Json(request))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_player() {
        let err = player_handler(rid(), State(state()), Path("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_empty_results() {
        let Json(response) = results_handler(rid(), State(state()), Query(ResultsQuery { limit: 5 }))
            .await
            .unwrap();
        assert_eq!(response.count, 0);
    }
}
