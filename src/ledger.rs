//! Per-round bet ledger
//!
//! One bet per player per round. A bet's stake never changes after
//! placement and its cash-out multiplier is written at most once.

use crate::{errors::GameError, types::PlayerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A player's stake in one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    pub player_id: PlayerId,
    pub username: String,
    pub amount: f64,
    /// Target multiplier registered in advance, if any
    #[serde(default)]
    pub auto_cashout: Option<f64>,
    /// Multiplier the player exited at; `None` while still riding
    #[serde(default)]
    pub cashout_multiplier: Option<f64>,
    pub placed_at: u64,
    #[serde(default)]
    pub cashed_out_at: Option<u64>,
}

/// Derived result of a bet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetOutcome {
    Pending,
    Won,
    Lost,
}

impl Bet {
    pub fn new(
        player_id: PlayerId,
        username: impl Into<String>,
        amount: f64,
        auto_cashout: Option<f64>,
        placed_at: u64,
    ) -> Self {
        Self {
            player_id,
            username: username.into(),
            amount,
            auto_cashout,
            cashout_multiplier: None,
            placed_at,
            cashed_out_at: None,
        }
    }

    pub fn is_cashed_out(&self) -> bool {
        self.cashout_multiplier.is_some()
    }

    /// Amount credited at settlement: stake × exit multiplier, or nothing
    pub fn payout(&self) -> f64 {
        self.cashout_multiplier
            .map(|m| self.amount * m)
            .unwrap_or(0.0)
    }

    /// Net result once the round is over
    pub fn profit(&self) -> f64 {
        match self.cashout_multiplier {
            Some(m) => self.amount * (m - 1.0),
            None => -self.amount,
        }
    }

    pub fn outcome(&self, round_crashed: bool) -> BetOutcome {
        match (self.cashout_multiplier, round_crashed) {
            (Some(_), _) => BetOutcome::Won,
            (None, true) => BetOutcome::Lost,
            (None, false) => BetOutcome::Pending,
        }
    }
}

/// Receipt for an accepted cash-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashOut {
    pub player_id: PlayerId,
    pub multiplier: f64,
    pub payout: f64,
    pub profit: f64,
    pub auto: bool,
    pub at: u64,
}

/// Bets of a single round keyed by player
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BetLedger {
    bets: BTreeMap<PlayerId, Bet>,
}

impl BetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bets.is_empty()
    }

    pub fn contains(&self, player_id: &PlayerId) -> bool {
        self.bets.contains_key(player_id)
    }

    pub fn get(&self, player_id: &PlayerId) -> Option<&Bet> {
        self.bets.get(player_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bet> {
        self.bets.values()
    }

    pub fn total_wagered(&self) -> f64 {
        self.bets.values().map(|b| b.amount).sum()
    }

    pub fn insert(&mut self, bet: Bet) -> Result<&Bet, GameError> {
        use std::collections::btree_map::Entry;

        match self.bets.entry(bet.player_id.clone()) {
            Entry::Occupied(_) => Err(GameError::DuplicateBet(bet.player_id.to_string())),
            Entry::Vacant(slot) => Ok(slot.insert(bet)),
        }
    }

    /// Undo a placement whose balance debit did not go through
    pub(crate) fn remove(&mut self, player_id: &PlayerId) -> Option<Bet> {
        self.bets.remove(player_id)
    }

    /// Record the exit multiplier for a player. Phase checks belong to the round.
    pub fn cash_out(
        &mut self,
        player_id: &PlayerId,
        multiplier: f64,
        at: u64,
        auto: bool,
    ) -> Result<CashOut, GameError> {
        let bet = self
            .bets
            .get_mut(player_id)
            .ok_or_else(|| GameError::NoSuchBet(player_id.to_string()))?;

        if bet.cashout_multiplier.is_some() {
            return Err(GameError::AlreadyCashedOut(player_id.to_string()));
        }

        bet.cashout_multiplier = Some(multiplier);
        bet.cashed_out_at = Some(at);

        Ok(CashOut {
            player_id: player_id.clone(),
            multiplier,
            payout: bet.payout(),
            profit: bet.profit(),
            auto,
            at,
        })
    }

    /// Take back an exit that could not be made durable
    pub(crate) fn revoke_cash_out(&mut self, player_id: &PlayerId) -> Option<f64> {
        let bet = self.bets.get_mut(player_id)?;
        bet.cashed_out_at = None;
        bet.cashout_multiplier.take()
    }

    /// Players whose auto-cashout target has been reached strictly before
    /// the crash point, with the target they exit at.
    pub fn due_auto_cashouts(&self, observed: f64, crash_point: f64) -> Vec<(PlayerId, f64)> {
        self.bets
            .values()
            .filter(|bet| !bet.is_cashed_out())
            .filter_map(|bet| {
                let target = bet.auto_cashout?;
                (target <= observed && target < crash_point).then(|| (bet.player_id.clone(), target))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bet(player: &str, amount: f64, auto: Option<f64>) -> Bet {
        Bet::new(PlayerId::from(player), player, amount, auto, 0)
    }

    #[test]
    fn test_duplicate_bet_leaves_first_untouched() {
        let mut ledger = BetLedger::new();
        ledger.insert(bet("a", 100.0, None)).unwrap();
        ledger.insert(bet("b", 50.0, None)).unwrap();

        let err = ledger.insert(bet("a", 999.0, Some(2.0))).unwrap_err();
        assert_eq!(err, GameError::DuplicateBet("a".to_string()));

        let first = ledger.get(&PlayerId::from("a")).unwrap();
        assert_eq!(first.amount, 100.0);
        assert_eq!(first.auto_cashout, None);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.total_wagered(), 150.0);
    }

    #[test]
    fn test_cash_out_once() {
        let mut ledger = BetLedger::new();
        ledger.insert(bet("a", 100.0, None)).unwrap();
        let player = PlayerId::from("a");

        let receipt = ledger.cash_out(&player, 2.5, 10, false).unwrap();
        assert_eq!(receipt.payout, 250.0);
        assert_eq!(receipt.profit, 150.0);

        let again = ledger.cash_out(&player, 3.0, 11, false).unwrap_err();
        assert_eq!(again, GameError::AlreadyCashedOut("a".to_string()));
        assert_eq!(ledger.get(&player).unwrap().cashout_multiplier, Some(2.5));
    }

    #[test]
    fn test_cash_out_without_bet() {
        let mut ledger = BetLedger::new();
        let err = ledger.cash_out(&PlayerId::from("ghost"), 1.5, 0, false).unwrap_err();
        assert_eq!(err, GameError::NoSuchBet("ghost".to_string()));
    }

    #[test]
    fn test_outcomes() {
        let mut b = bet("a", 10.0, None);
        assert_eq!(b.outcome(false), BetOutcome::Pending);
        assert_eq!(b.outcome(true), BetOutcome::Lost);
        assert_eq!(b.profit(), -10.0);
        assert_eq!(b.payout(), 0.0);

        b.cashout_multiplier = Some(1.5);
        assert_eq!(b.outcome(true), BetOutcome::Won);
    }

    #[test]
    fn test_due_auto_cashouts() {
        let mut ledger = BetLedger::new();
        ledger.insert(bet("low", 10.0, Some(1.5))).unwrap();
        ledger.insert(bet("at_crash", 10.0, Some(3.0))).unwrap();
        ledger.insert(bet("high", 10.0, Some(10.0))).unwrap();
        ledger.insert(bet("manual", 10.0, None)).unwrap();

        let due = ledger.due_auto_cashouts(3.2, 3.0);
        assert_eq!(due, vec![(PlayerId::from("low"), 1.5)]);

        ledger.cash_out(&PlayerId::from("low"), 1.5, 0, true).unwrap();
        assert!(ledger.due_auto_cashouts(3.2, 3.0).is_empty());
    }
}
