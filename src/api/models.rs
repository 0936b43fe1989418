//! API Request and Response Models

use crate::{orchestrator::EngineStatus, records::RoundResult, round::RoundSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub engine: EngineStatus,
    pub version: String,
    pub server_time: DateTime<Utc>,
}

/// Round view with the server time it was taken at, so clients can
/// interpolate the curve between ticks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundResponse {
    pub round: RoundSnapshot,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceBetRequest {
    pub player_id: String,
    /// Defaults to the player id
    #[serde(default)]
    pub username: Option<String>,
    pub amount: f64,
    #[serde(default)]
    pub auto_cashout: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashOutRequest {
    pub player_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsResponse {
    pub results: Vec<RoundResult>,
    pub count: usize,
}
