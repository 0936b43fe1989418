//! Round settlement
//!
//! Settlement is resumable. Progress lives in `settlements/{round}` and
//! every credit is written in the same batch as the record naming that
//! player as credited, so a retry after a partial failure picks up exactly
//! the bets that were not paid yet. A completed record turns any later call
//! into a no-op.

use crate::{
    accounts::AccountBook,
    clock::Clock,
    errors::{CrashResult, GameError},
    records::{self, settlement_key, RoundResult},
    round::{RoundPhase, RoundSnapshot},
    store::StateStore,
    types::{PlayerId, RoundId},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementKind {
    /// Winners of a crashed round receive stake × cash-out multiplier
    Payout,
    /// Every stake of an abandoned round is returned
    Refund,
}

/// Settlement progress for one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub round_id: RoundId,
    pub kind: SettlementKind,
    pub credited: BTreeSet<PlayerId>,
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<u64>,
}

impl SettlementRecord {
    fn new(round_id: RoundId, kind: SettlementKind) -> Self {
        Self {
            round_id,
            kind,
            credited: BTreeSet::new(),
            completed: false,
            completed_at: None,
        }
    }
}

/// Summary of one settlement call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReport {
    pub round_id: RoundId,
    pub kind: SettlementKind,
    /// The round had already been fully settled; nothing was done
    pub already_settled: bool,
    /// Credits applied by this call
    pub credited: Vec<(PlayerId, f64)>,
    pub total_credited: f64,
}

pub struct SettlementEngine {
    store: Arc<dyn StateStore>,
    accounts: Arc<AccountBook>,
    clock: Arc<dyn Clock>,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn StateStore>, accounts: Arc<AccountBook>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            accounts,
            clock,
        }
    }

    pub async fn record(&self, round_id: &RoundId) -> CrashResult<Option<SettlementRecord>> {
        records::load(self.store.as_ref(), &settlement_key(round_id)).await
    }

    /// Pay every bet that cashed out before the crash and archive the round
    pub async fn settle(&self, snapshot: &RoundSnapshot) -> CrashResult<SettlementReport> {
        if !matches!(snapshot.phase, RoundPhase::Crashed { .. }) {
            return Err(GameError::InvalidState {
                operation: "settle",
                status: snapshot.status(),
            }
            .into());
        }

        let credits = snapshot
            .players
            .iter()
            .filter(|bet| bet.payout() > 0.0)
            .map(|bet| (bet.player_id.clone(), bet.payout()));

        let report = self.apply(&snapshot.id, SettlementKind::Payout, credits).await?;
        if report.already_settled {
            return Ok(report);
        }

        if let Some(result) = RoundResult::from_snapshot(snapshot) {
            records::append_result(self.store.as_ref(), &result).await?;
        }
        self.complete(&snapshot.id, SettlementKind::Payout).await?;

        tracing::info!(
            round_id = %snapshot.id,
            crash_point = ?snapshot.crash_point,
            bets = snapshot.players.len(),
            winners = report.credited.len(),
            paid = report.total_credited,
            "Round settled"
        );
        Ok(report)
    }

    /// Return every stake of a round that cannot be played out
    pub async fn refund(&self, snapshot: &RoundSnapshot) -> CrashResult<SettlementReport> {
        let credits = snapshot
            .players
            .iter()
            .map(|bet| (bet.player_id.clone(), bet.amount));

        let report = self.apply(&snapshot.id, SettlementKind::Refund, credits).await?;
        if report.already_settled {
            return Ok(report);
        }
        self.complete(&snapshot.id, SettlementKind::Refund).await?;

        tracing::warn!(
            round_id = %snapshot.id,
            refunded = report.credited.len(),
            total = report.total_credited,
            "Round abandoned, stakes refunded"
        );
        Ok(report)
    }

    async fn apply(
        &self,
        round_id: &RoundId,
        kind: SettlementKind,
        credits: impl Iterator<Item = (PlayerId, f64)>,
    ) -> CrashResult<SettlementReport> {
        let key = settlement_key(round_id);
        let mut record = self
            .record(round_id)
            .await?
            .unwrap_or_else(|| SettlementRecord::new(round_id.clone(), kind));

        let mut report = SettlementReport {
            round_id: round_id.clone(),
            kind: record.kind,
            already_settled: record.completed,
            credited: Vec::new(),
            total_credited: 0.0,
        };
        if record.completed {
            tracing::debug!(round_id = %round_id, "Settlement already completed, skipping");
            return Ok(report);
        }
        if record.kind != kind {
            tracing::warn!(
                round_id = %round_id,
                recorded = ?record.kind,
                requested = ?kind,
                "Round already has settlement progress of another kind, skipping"
            );
            report.already_settled = true;
            return Ok(report);
        }

        for (player_id, amount) in credits {
            if record.credited.contains(&player_id) {
                continue;
            }
            record.credited.insert(player_id.clone());
            let progress = records::to_value(&record)?;
            self.accounts
                .credit(&player_id, amount, vec![(key.clone(), progress)])
                .await?;

            report.credited.push((player_id, amount));
            report.total_credited += amount;
        }
        Ok(report)
    }

    async fn complete(&self, round_id: &RoundId, kind: SettlementKind) -> CrashResult<()> {
        let key = settlement_key(round_id);
        let mut record = self
            .record(round_id)
            .await?
            .unwrap_or_else(|| SettlementRecord::new(round_id.clone(), kind));
        if record.completed {
            return Ok(());
        }
        record.completed = true;
        record.completed_at = Some(self.clock.now_ms());
        records::save(self.store.as_ref(), &key, &record).await
    }
}
