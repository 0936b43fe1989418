//! Round events published to observers
//!
//! Events are plain data; observers never compute multipliers themselves.
//! Tick events carry the authoritative multiplier and the start time, so a
//! renderer can interpolate between ticks with the same curve.

use crate::{
    fairness::FairnessProof,
    ledger::CashOut,
    settlement::{SettlementKind, SettlementReport},
    types::{PlayerId, RoundId},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events retained for slow subscribers before they start lagging
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoundEvent {
    /// A new round accepts bets
    RoundOpened {
        round_id: RoundId,
        commitment: String,
        created_at: u64,
    },

    BetPlaced {
        round_id: RoundId,
        player_id: PlayerId,
        username: String,
        amount: f64,
        auto_cashout: Option<f64>,
    },

    /// Betting closes at `starts_at`
    CountdownStarted { round_id: RoundId, starts_at: u64 },

    RoundStarted {
        round_id: RoundId,
        start_time: u64,
        growth_rate: f64,
    },

    Tick {
        round_id: RoundId,
        multiplier: f64,
        elapsed_ms: u64,
    },

    CashedOut {
        round_id: RoundId,
        player_id: PlayerId,
        multiplier: f64,
        payout: f64,
        auto: bool,
    },

    /// Crash point and fairness proof are revealed here
    Crashed {
        round_id: RoundId,
        crash_point: f64,
        end_time: u64,
        commitment: String,
        proof: Option<FairnessProof>,
    },

    /// `credited` counts winners paid for a payout, stakes returned for a
    /// refund
    Settled {
        round_id: RoundId,
        kind: SettlementKind,
        credited: usize,
        total_paid: f64,
    },

    /// The engine stopped creating rounds
    Halted { reason: String },
}

impl RoundEvent {
    pub fn cashed_out(round_id: &RoundId, receipt: &CashOut) -> Self {
        RoundEvent::CashedOut {
            round_id: round_id.clone(),
            player_id: receipt.player_id.clone(),
            multiplier: receipt.multiplier,
            payout: receipt.payout,
            auto: receipt.auto,
        }
    }

    pub fn settled(report: &SettlementReport) -> Self {
        RoundEvent::Settled {
            round_id: report.round_id.clone(),
            kind: report.kind,
            credited: report.credited.len(),
            total_paid: report.total_credited,
        }
    }

    pub fn round_id(&self) -> Option<&RoundId> {
        match self {
            RoundEvent::RoundOpened { round_id, .. }
            | RoundEvent::BetPlaced { round_id, .. }
            | RoundEvent::CountdownStarted { round_id, .. }
            | RoundEvent::RoundStarted { round_id, .. }
            | RoundEvent::Tick { round_id, .. }
            | RoundEvent::CashedOut { round_id, .. }
            | RoundEvent::Crashed { round_id, .. }
            | RoundEvent::Settled { round_id, .. } => Some(round_id),
            RoundEvent::Halted { .. } => None,
        }
    }
}

/// Fan-out of round events; publishing with no subscribers is not an error
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RoundEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: RoundEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
