//! Typed records on top of the state store.
//!
//! Key layout:
//!
//! | key                              | value                              |
//! |----------------------------------|------------------------------------|
//! | `games/{round}`                  | public [`RoundSnapshot`]           |
//! | `round_secrets/{round}`          | sealed crash point (server only)   |
//! | `users/{player}`                 | player account                     |
//! | `game_results/{round}`           | archived [`RoundResult`]           |
//! | `results_by_time/{inv_end}-{id}` | round id, newest first             |
//! | `settlements/{round}`            | settlement progress                |
//! | `meta/current_round`             | id of the round in flight          |
//! | `meta/pending_settlements`       | rounds whose settlement is retried |
//! | `server/fairness_key`            | VRF signing key                    |

use crate::{
    errors::{CrashResult, StoreError},
    fairness::FairnessProof,
    ledger::BetOutcome,
    round::RoundSnapshot,
    store::StateStore,
    types::{PlayerId, RoundId},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

pub const FAIRNESS_KEY: &str = "server/fairness_key";
pub const CURRENT_ROUND_KEY: &str = "meta/current_round";
pub const PENDING_SETTLEMENTS_KEY: &str = "meta/pending_settlements";

const GAMES_PREFIX: &str = "games/";
const SECRETS_PREFIX: &str = "round_secrets/";
const USERS_PREFIX: &str = "users/";
const RESULTS_PREFIX: &str = "game_results/";
const RESULTS_INDEX_PREFIX: &str = "results_by_time/";
const SETTLEMENTS_PREFIX: &str = "settlements/";

pub fn game_key(round_id: &RoundId) -> String {
    format!("{}{}", GAMES_PREFIX, round_id)
}

pub fn secret_key(round_id: &RoundId) -> String {
    format!("{}{}", SECRETS_PREFIX, round_id)
}

pub fn user_key(player_id: &PlayerId) -> String {
    format!("{}{}", USERS_PREFIX, player_id)
}

pub fn result_key(round_id: &RoundId) -> String {
    format!("{}{}", RESULTS_PREFIX, round_id)
}

pub fn settlement_key(round_id: &RoundId) -> String {
    format!("{}{}", SETTLEMENTS_PREFIX, round_id)
}

fn result_index_key(end_time: u64, round_id: &RoundId) -> String {
    // Inverted, zero-padded end time sorts newest first
    format!("{}{:020}-{}", RESULTS_INDEX_PREFIX, u64::MAX - end_time, round_id)
}

pub fn to_value<T: Serialize>(value: &T) -> CrashResult<Value> {
    Ok(serde_json::to_value(value)?)
}

pub fn from_value<T: DeserializeOwned>(key: &str, value: Value) -> CrashResult<T> {
    serde_json::from_value(value).map_err(|e| {
        StoreError::Corrupted {
            key: key.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

pub async fn load<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> CrashResult<Option<T>> {
    match store.get(key).await? {
        Some(value) => Ok(Some(from_value(key, value)?)),
        None => Ok(None),
    }
}

pub async fn save<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) -> CrashResult<()> {
    store.set(key, to_value(value)?).await
}

pub async fn load_round(store: &dyn StateStore, round_id: &RoundId) -> CrashResult<Option<RoundSnapshot>> {
    load(store, &game_key(round_id)).await
}

pub async fn current_round_id(store: &dyn StateStore) -> CrashResult<Option<RoundId>> {
    load(store, CURRENT_ROUND_KEY).await
}

/// Archived outcome of one bet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetResult {
    pub player_id: PlayerId,
    pub username: String,
    pub amount: f64,
    pub cashout_multiplier: Option<f64>,
    pub payout: f64,
    pub profit: f64,
    pub outcome: BetOutcome,
}

/// Entry of the append-only results log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round_id: RoundId,
    pub crash_point: f64,
    pub commitment: String,
    #[serde(default)]
    pub proof: Option<FairnessProof>,
    pub start_time: u64,
    pub end_time: u64,
    pub bets: Vec<BetResult>,
    pub total_wagered: f64,
    pub total_paid_out: f64,
}

impl RoundResult {
    /// Build the archive entry for a crashed round
    pub fn from_snapshot(snapshot: &RoundSnapshot) -> Option<Self> {
        let crash_point = snapshot.crash_point?;
        let start_time = snapshot.phase.start_time()?;
        let end_time = snapshot.phase.end_time()?;

        let bets: Vec<BetResult> = snapshot
            .players
            .iter()
            .map(|bet| BetResult {
                player_id: bet.player_id.clone(),
                username: bet.username.clone(),
                amount: bet.amount,
                cashout_multiplier: bet.cashout_multiplier,
                payout: bet.payout(),
                profit: bet.profit(),
                outcome: bet.outcome(true),
            })
            .collect();

        Some(Self {
            round_id: snapshot.id.clone(),
            crash_point,
            commitment: snapshot.commitment.clone(),
            proof: snapshot.proof.clone(),
            start_time,
            end_time,
            total_wagered: bets.iter().map(|b| b.amount).sum(),
            total_paid_out: bets.iter().map(|b| b.payout).sum(),
            bets,
        })
    }
}

/// Append a result to the log. An existing entry is never replaced;
/// returns `false` when the round was already archived.
pub async fn append_result(store: &dyn StateStore, result: &RoundResult) -> CrashResult<bool> {
    let key = result_key(&result.round_id);
    if store.get(&key).await?.is_some() {
        return Ok(false);
    }

    store
        .set_batch(vec![
            (key, to_value(result)?),
            (
                result_index_key(result.end_time, &result.round_id),
                Value::String(result.round_id.to_string()),
            ),
        ])
        .await?;
    Ok(true)
}

pub async fn load_result(store: &dyn StateStore, round_id: &RoundId) -> CrashResult<Option<RoundResult>> {
    load(store, &result_key(round_id)).await
}

/// Newest results first
pub async fn recent_results(store: &dyn StateStore, limit: usize) -> CrashResult<Vec<RoundResult>> {
    let index = store.list(RESULTS_INDEX_PREFIX, Some(limit)).await?;
    let mut results = Vec::with_capacity(index.len());

    for (key, value) in index {
        let round_id: RoundId = from_value(&key, value)?;
        match load_result(store, &round_id).await? {
            Some(result) => results.push(result),
            None => tracing::warn!(round_id = %round_id, "Results index points at missing result"),
        }
    }
    Ok(results)
}
