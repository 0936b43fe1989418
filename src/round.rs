//! Round state machine
//!
//! A round moves `Waiting -> Running -> Crashed`, each transition exactly
//! once. The multiplier is never accumulated: it is recomputed from
//! `(start_time, now)` on every observation, so any observer holding the
//! start time sees the same curve.

use crate::{
    errors::{CrashResult, GameError, StoreError},
    fairness::{CrashSeal, FairnessProof},
    ledger::{Bet, BetLedger, CashOut},
    types::{PlayerId, RoundId},
};
use serde::{Deserialize, Serialize};

/// `multiplier(t) = 1 + rate * t^1.5`, `t` in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthCurve {
    rate: f64,
}

impl GrowthCurve {
    pub fn new(rate: f64) -> Self {
        Self { rate }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn multiplier_at(&self, elapsed_ms: u64) -> f64 {
        let t = elapsed_ms as f64 / 1000.0;
        1.0 + self.rate * t.powf(1.5)
    }

    /// Smallest whole millisecond at which the curve reaches `multiplier`
    pub fn elapsed_to_reach(&self, multiplier: f64) -> u64 {
        if multiplier <= 1.0 || self.rate <= 0.0 {
            return 0;
        }
        let seconds = ((multiplier - 1.0) / self.rate).powf(2.0 / 3.0);
        if !seconds.is_finite() {
            return u64::MAX;
        }
        let mut ms = (seconds * 1000.0).floor() as u64;
        // powf rounding can land one millisecond short
        while self.multiplier_at(ms) < multiplier {
            ms += 1;
        }
        ms
    }
}

/// Lifecycle phase; timestamps exist only in the phases where they are set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RoundPhase {
    Waiting,
    Running { start_time: u64 },
    Crashed { start_time: u64, end_time: u64 },
}

impl RoundPhase {
    pub fn name(&self) -> &'static str {
        match self {
            RoundPhase::Waiting => "waiting",
            RoundPhase::Running { .. } => "running",
            RoundPhase::Crashed { .. } => "crashed",
        }
    }

    pub fn start_time(&self) -> Option<u64> {
        match *self {
            RoundPhase::Waiting => None,
            RoundPhase::Running { start_time } | RoundPhase::Crashed { start_time, .. } => {
                Some(start_time)
            }
        }
    }

    pub fn end_time(&self) -> Option<u64> {
        match *self {
            RoundPhase::Crashed { end_time, .. } => Some(end_time),
            _ => None,
        }
    }
}

/// What one authoritative step observed and changed
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub multiplier: f64,
    /// Auto-cashouts recorded during this step, in ledger order
    pub auto_cashouts: Vec<CashOut>,
    /// True only on the step that moved the round into `Crashed`
    pub crashed: bool,
}

/// Plain-data view of a round, safe to publish.
///
/// `crash_point` and `proof` stay `None` until the round has crashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub id: RoundId,
    pub phase: RoundPhase,
    pub commitment: String,
    pub current_multiplier: f64,
    pub growth_rate: f64,
    pub created_at: u64,
    #[serde(default)]
    pub countdown_ends_at: Option<u64>,
    #[serde(default)]
    pub crash_point: Option<f64>,
    #[serde(default)]
    pub proof: Option<FairnessProof>,
    pub players: BetLedger,
}

impl RoundSnapshot {
    pub fn status(&self) -> &'static str {
        self.phase.name()
    }
}

#[derive(Debug, Clone)]
pub struct Round {
    id: RoundId,
    seal: CrashSeal,
    curve: GrowthCurve,
    phase: RoundPhase,
    created_at: u64,
    countdown_ends_at: Option<u64>,
    ledger: BetLedger,
    /// Latest instant observed, keeps steps in non-decreasing time order
    last_observed: u64,
    /// Bumped on every ledger change; lets writers tell whether the stored
    /// ledger is behind
    revision: u64,
}

impl Round {
    pub fn new(id: RoundId, seal: CrashSeal, curve: GrowthCurve, now: u64) -> Self {
        Self {
            id,
            seal,
            curve,
            phase: RoundPhase::Waiting,
            created_at: now,
            countdown_ends_at: None,
            ledger: BetLedger::new(),
            last_observed: now,
            revision: 0,
        }
    }

    /// Rebuild a round from its persisted snapshot and sealed crash point
    pub fn restore(snapshot: RoundSnapshot, seal: CrashSeal) -> CrashResult<Self> {
        if snapshot.commitment != seal.commitment {
            return Err(StoreError::Corrupted {
                key: snapshot.id.to_string(),
                reason: "sealed crash point does not match published commitment".to_string(),
            }
            .into());
        }

        let last_observed = snapshot
            .phase
            .end_time()
            .or(snapshot.phase.start_time())
            .unwrap_or(snapshot.created_at);

        Ok(Self {
            id: snapshot.id,
            seal,
            curve: GrowthCurve::new(snapshot.growth_rate),
            phase: snapshot.phase,
            created_at: snapshot.created_at,
            countdown_ends_at: snapshot.countdown_ends_at,
            ledger: snapshot.players,
            last_observed,
            revision: 0,
        })
    }

    pub fn id(&self) -> &RoundId {
        &self.id
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn status(&self) -> &'static str {
        self.phase.name()
    }

    pub fn is_crashed(&self) -> bool {
        matches!(self.phase, RoundPhase::Crashed { .. })
    }

    pub fn seal(&self) -> &CrashSeal {
        &self.seal
    }

    pub fn crash_point(&self) -> f64 {
        self.seal.crash_point
    }

    pub fn curve(&self) -> GrowthCurve {
        self.curve
    }

    pub fn ledger(&self) -> &BetLedger {
        &self.ledger
    }

    pub fn ledger_revision(&self) -> u64 {
        self.revision
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn countdown_ends_at(&self) -> Option<u64> {
        self.countdown_ends_at
    }

    fn invalid(&self, operation: &'static str) -> GameError {
        GameError::InvalidState {
            operation,
            status: self.phase.name(),
        }
    }

    /// Multiplier an observer at `now` should see
    pub fn multiplier_at(&self, now: u64) -> f64 {
        match self.phase {
            RoundPhase::Waiting => 1.0,
            RoundPhase::Running { start_time } => self
                .curve
                .multiplier_at(now.saturating_sub(start_time))
                .min(self.seal.crash_point),
            RoundPhase::Crashed { .. } => self.seal.crash_point,
        }
    }

    /// Close betting at `now + duration_ms`. Only the first call has effect.
    pub fn begin_countdown(&mut self, now: u64, duration_ms: u64) -> Result<u64, GameError> {
        if self.phase != RoundPhase::Waiting {
            return Err(self.invalid("begin_countdown"));
        }
        Ok(*self
            .countdown_ends_at
            .get_or_insert(now.saturating_add(duration_ms)))
    }

    pub fn place_bet(&mut self, bet: Bet, now: u64) -> Result<&Bet, GameError> {
        if self.phase != RoundPhase::Waiting {
            return Err(self.invalid("place_bet"));
        }
        if self.countdown_ends_at.is_some_and(|end| now >= end) {
            return Err(self.invalid("place_bet"));
        }
        if !bet.amount.is_finite() || bet.amount <= 0.0 {
            return Err(GameError::InvalidAmount(format!(
                "stake must be positive, got {}",
                bet.amount
            )));
        }
        if let Some(target) = bet.auto_cashout {
            if !target.is_finite() || target <= 1.0 {
                return Err(GameError::InvalidAmount(format!(
                    "auto cash-out target must be above 1.00, got {}",
                    target
                )));
            }
        }
        let placed = self.ledger.insert(bet)?;
        self.revision += 1;
        Ok(placed)
    }

    /// Roll back a bet whose balance debit failed
    pub(crate) fn withdraw_bet(&mut self, player_id: &PlayerId) -> Option<Bet> {
        if self.phase != RoundPhase::Waiting {
            return None;
        }
        let bet = self.ledger.remove(player_id)?;
        self.revision += 1;
        Some(bet)
    }

    /// Roll back a manual exit whose ledger write failed. The round must
    /// still be running, so nothing has been settled against it.
    pub(crate) fn revoke_cash_out(&mut self, player_id: &PlayerId) -> Option<f64> {
        if !matches!(self.phase, RoundPhase::Running { .. }) {
            return None;
        }
        let multiplier = self.ledger.revoke_cash_out(player_id)?;
        self.revision += 1;
        Some(multiplier)
    }

    pub fn start(&mut self, now: u64) -> Result<(), GameError> {
        if self.phase != RoundPhase::Waiting {
            return Err(self.invalid("start"));
        }
        self.phase = RoundPhase::Running { start_time: now };
        self.last_observed = now;
        Ok(())
    }

    /// Single authoritative step: fire due auto-cashouts, then check for
    /// the crash. A multiplier equal to the crash point is a crash.
    pub fn advance(&mut self, now: u64) -> TickOutcome {
        let start_time = match self.phase {
            RoundPhase::Running { start_time } => start_time,
            _ => {
                return TickOutcome {
                    multiplier: self.multiplier_at(now),
                    auto_cashouts: Vec::new(),
                    crashed: false,
                }
            }
        };

        let now = now.max(self.last_observed).max(start_time);
        self.last_observed = now;

        let crash_point = self.seal.crash_point;
        let observed = self.curve.multiplier_at(now - start_time);

        let mut auto_cashouts = Vec::new();
        for (player_id, target) in self.ledger.due_auto_cashouts(observed, crash_point) {
            let at = start_time
                .saturating_add(self.curve.elapsed_to_reach(target))
                .min(now);
            if let Ok(receipt) = self.ledger.cash_out(&player_id, target, at, true) {
                auto_cashouts.push(receipt);
            }
        }
        if !auto_cashouts.is_empty() {
            self.revision += 1;
        }

        if observed >= crash_point {
            let crash_instant = start_time
                .saturating_add(self.curve.elapsed_to_reach(crash_point))
                .min(now);
            self.phase = RoundPhase::Crashed {
                start_time,
                end_time: crash_instant,
            };
            return TickOutcome {
                multiplier: crash_point,
                auto_cashouts,
                crashed: true,
            };
        }

        TickOutcome {
            multiplier: observed,
            auto_cashouts,
            crashed: false,
        }
    }

    /// Manual cash-out at the authoritative multiplier for `now`.
    ///
    /// The round is advanced first, so a request arriving at or after the
    /// crash instant is rejected. The step outcome is returned alongside so
    /// callers can announce whatever it triggered.
    pub fn cash_out(
        &mut self,
        player_id: &PlayerId,
        now: u64,
    ) -> (TickOutcome, Result<CashOut, GameError>) {
        let step = self.advance(now);
        let result = match self.phase {
            RoundPhase::Running { .. } => {
                self.ledger
                    .cash_out(player_id, step.multiplier, self.last_observed, false)
            }
            _ => Err(self.invalid("cash_out")),
        };
        if result.is_ok() {
            self.revision += 1;
        }
        (step, result)
    }

    pub fn snapshot(&self, now: u64) -> RoundSnapshot {
        let crashed = self.is_crashed();
        RoundSnapshot {
            id: self.id.clone(),
            phase: self.phase,
            commitment: self.seal.commitment.clone(),
            current_multiplier: self.multiplier_at(now),
            growth_rate: self.curve.rate(),
            created_at: self.created_at,
            countdown_ends_at: self.countdown_ends_at,
            crash_point: crashed.then_some(self.seal.crash_point),
            proof: if crashed { self.seal.proof.clone() } else { None },
            players: self.ledger.clone(),
        }
    }
}
