//! Round orchestration
//!
//! One task owns the round loop:
//!
//! ```text
//! open round -> wait for first bet / betting window -> countdown -> running
//!     -> tick until crash -> persist crash -> settle -> cooldown -> open round
//! ```
//!
//! Player requests go through a cloneable [`GameHandle`]. They share the
//! round behind a per-round mutex with the tick loop, so "is it still
//! running" and "record this cash-out" are always decided against the same
//! authoritative step.

use crate::{
    accounts::{AccountBook, PlayerAccount},
    clock::{Clock, SystemClock},
    config::{CrashlineConfig, StartPolicy},
    errors::{CrashError, CrashResult, GameError},
    events::{EventBus, RoundEvent},
    fairness::{CrashPointSource, CrashSeal, FairnessEngine, VrfCrashPoints},
    ledger::{Bet, CashOut},
    metrics::GameMetrics,
    records::{self, game_key, secret_key, RoundResult, CURRENT_ROUND_KEY, PENDING_SETTLEMENTS_KEY},
    retry::{Backoff, WriteGate},
    round::{GrowthCurve, Round, RoundPhase, RoundSnapshot},
    settlement::{SettlementEngine, SettlementKind, SettlementReport},
    store::{StateStore, Subscription},
    types::{PlayerId, RoundId},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Engine lifecycle as seen by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineStatus {
    /// Recovering state from the store
    Starting,
    Live,
    /// Stopped on request
    Stopped,
    /// A new round could not be created; no rounds run until restart
    Halted { reason: String },
}

/// Accepted bet and the balance left after the stake was taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetReceipt {
    pub round_id: RoundId,
    pub bet: Bet,
    pub balance: f64,
}

struct CurrentRound {
    id: RoundId,
    round: Arc<Mutex<Round>>,
}

/// Settlement that did not go through and is retried before the next round
#[derive(Debug, Clone)]
struct Deferred {
    snapshot: RoundSnapshot,
    kind: SettlementKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingSettlement {
    round_id: RoundId,
    kind: SettlementKind,
}

struct Shared {
    config: CrashlineConfig,
    curve: GrowthCurve,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    accounts: Arc<AccountBook>,
    settlement: SettlementEngine,
    crash_points: Arc<dyn CrashPointSource>,
    events: EventBus,
    metrics: Arc<GameMetrics>,
    backoff: Backoff,
    current: RwLock<Option<CurrentRound>>,
    status: watch::Sender<EngineStatus>,
    stop: watch::Sender<bool>,
    first_bet: Notify,
}

impl Shared {
    fn announce_cashouts(&self, round_id: &RoundId, cashouts: &[CashOut]) {
        for receipt in cashouts {
            self.metrics.record_cashout(receipt.auto);
            info!(
                round_id = %round_id,
                player_id = %receipt.player_id,
                multiplier = receipt.multiplier,
                payout = receipt.payout,
                auto = receipt.auto,
                "Player cashed out"
            );
            self.events.publish(RoundEvent::cashed_out(round_id, receipt));
        }
    }

    fn announce_settlement(&self, report: &SettlementReport) {
        self.metrics.record_payout(report.total_credited);
        self.events.publish(RoundEvent::settled(report));
    }

    async fn install(&self, round: &Arc<Mutex<Round>>) {
        let id = round.lock().await.id().clone();
        *self.current.write().await = Some(CurrentRound {
            id,
            round: round.clone(),
        });
    }

    /// Write a full round snapshot, retrying while the store is unavailable.
    /// Local state stays authoritative when this gives up.
    async fn persist_round(&self, snapshot: &RoundSnapshot, what: &str) -> bool {
        let key = game_key(&snapshot.id);
        let value = match records::to_value(snapshot) {
            Ok(value) => value,
            Err(e) => {
                error!(round_id = %snapshot.id, error = %e, "Failed to encode round snapshot");
                return false;
            }
        };

        let store = self.store.as_ref();
        let key = key.as_str();
        match self
            .backoff
            .retry(what, move || store.set(key, value.clone()))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                self.metrics.record_store_failure();
                warn!(round_id = %snapshot.id, error = %e, "Giving up on {}", what);
                false
            }
        }
    }
}

/// Owns the round loop. Create it, take a [`GameHandle`], then `run` or
/// `spawn` it.
pub struct RoundOrchestrator {
    shared: Arc<Shared>,
    deferred: VecDeque<Deferred>,
}

impl RoundOrchestrator {
    pub fn new(
        config: CrashlineConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        crash_points: Arc<dyn CrashPointSource>,
    ) -> Self {
        let accounts = Arc::new(AccountBook::new(
            store.clone(),
            clock.clone(),
            config.accounts.starting_balance,
        ));
        let settlement = SettlementEngine::new(store.clone(), accounts.clone(), clock.clone());
        let (status, _) = watch::channel(EngineStatus::Starting);
        let (stop, _) = watch::channel(false);

        let shared = Shared {
            curve: GrowthCurve::new(config.game.growth_rate),
            backoff: Backoff::new(&config.retry),
            config,
            store,
            clock,
            accounts,
            settlement,
            crash_points,
            events: EventBus::new(),
            metrics: Arc::new(GameMetrics::new()),
            current: RwLock::new(None),
            status,
            stop,
            first_bet: Notify::new(),
        };

        Self {
            shared: Arc::new(shared),
            deferred: VecDeque::new(),
        }
    }

    /// Production wiring: system clock and VRF crash points signed with the
    /// key persisted in the store
    pub async fn from_config(config: CrashlineConfig, store: Arc<dyn StateStore>) -> CrashResult<Self> {
        let engine = FairnessEngine::load_or_create(store.as_ref()).await?;
        info!(public_key = %engine.public_key_hex(), "Fairness key loaded");
        let crash_points = VrfCrashPoints::new(engine, config.game.house_edge, config.game.max_multiplier);
        Ok(Self::new(config, store, Arc::new(SystemClock), Arc::new(crash_points)))
    }

    pub fn handle(&self) -> GameHandle {
        GameHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn spawn(self) -> (GameHandle, JoinHandle<CrashResult<()>>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    /// Recover, then play rounds until stopped or halted
    pub async fn run(mut self) -> CrashResult<()> {
        let mut resumed = match self.recover().await {
            Ok(resumed) => resumed,
            Err(e) => return self.halt(format!("recovery failed: {}", e)),
        };

        self.shared.status.send_replace(EngineStatus::Live);
        info!(
            tick_ms = self.shared.config.timing.tick_interval_ms,
            policy = ?self.shared.config.timing.start_policy,
            "Round orchestrator live"
        );

        let mut stop = self.shared.stop.subscribe();
        loop {
            if *stop.borrow() {
                break;
            }
            self.retry_deferred().await;

            let round = match resumed.take() {
                Some(round) => round,
                None => match self.open_round().await {
                    Ok(round) => round,
                    Err(e) => return self.halt(format!("cannot open a new round: {}", e)),
                },
            };

            if !self.play(round, &mut stop).await {
                break;
            }
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.shared.config.cooldown()) => {}
                _ = stop.changed() => {}
            }
        }

        self.shared.status.send_replace(EngineStatus::Stopped);
        info!("Round orchestrator stopped");
        Ok(())
    }

    fn halt(&self, reason: String) -> CrashResult<()> {
        error!(reason = %reason, "Engine halted, no new rounds will be created");
        self.shared.status.send_replace(EngineStatus::Halted {
            reason: reason.clone(),
        });
        self.shared.events.publish(RoundEvent::Halted {
            reason: reason.clone(),
        });
        Err(CrashError::Halted(reason))
    }

    async fn open_round(&self) -> CrashResult<Arc<Mutex<Round>>> {
        let shared = &self.shared;
        let round_id = RoundId::generate();
        let seal = shared.crash_points.seal(&round_id)?;
        let now = shared.clock.now_ms();

        let round = Round::new(round_id.clone(), seal.clone(), shared.curve, now);
        let entries = vec![
            (secret_key(&round_id), records::to_value(&seal)?),
            (game_key(&round_id), records::to_value(&round.snapshot(now))?),
            (CURRENT_ROUND_KEY.to_string(), records::to_value(&round_id)?),
        ];

        let store = shared.store.as_ref();
        shared
            .backoff
            .retry("open round", move || store.set_batch(entries.clone()))
            .await?;

        let round = Arc::new(Mutex::new(round));
        shared.install(&round).await;

        info!(round_id = %round_id, commitment = %seal.commitment, "Round opened");
        shared.events.publish(RoundEvent::RoundOpened {
            round_id,
            commitment: seal.commitment,
            created_at: now,
        });
        Ok(round)
    }

    /// Play a round from whatever phase it is in. Returns `false` when a
    /// stop request ended the round before it started.
    async fn play(&mut self, round: Arc<Mutex<Round>>, stop: &mut watch::Receiver<bool>) -> bool {
        if round.lock().await.phase() == RoundPhase::Waiting {
            if !self.await_countdown(&round, stop).await {
                return false;
            }
            self.start_round(&round).await;
        }

        if matches!(round.lock().await.phase(), RoundPhase::Running { .. }) {
            self.run_ticks(&round).await;
        }

        self.finish(&round).await;
        true
    }

    async fn await_countdown(&self, round: &Arc<Mutex<Round>>, stop: &mut watch::Receiver<bool>) -> bool {
        let shared = &self.shared;
        let timing = &shared.config.timing;

        let ends_at = loop {
            {
                let mut r = round.lock().await;
                if let Some(end) = r.countdown_ends_at() {
                    break end;
                }
                // A resumed round may already hold bets
                if timing.start_policy == StartPolicy::FirstBet && !r.ledger().is_empty() {
                    let now = shared.clock.now_ms();
                    break r.begin_countdown(now, timing.countdown_ms).unwrap_or(now);
                }
            }

            match timing.start_policy {
                StartPolicy::FirstBet => {
                    tokio::select! {
                        _ = shared.first_bet.notified() => {}
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                info!("Stop requested while waiting for the first bet");
                                return false;
                            }
                        }
                    }
                }
                StartPolicy::FixedWindow => {
                    let opened = round.lock().await.created_at();
                    let window_end = opened.saturating_add(timing.betting_window_ms);
                    let remaining = window_end.saturating_sub(shared.clock.now_ms());
                    tokio::time::sleep(Duration::from_millis(remaining)).await;

                    let mut r = round.lock().await;
                    let now = shared.clock.now_ms();
                    break r.begin_countdown(now, timing.countdown_ms).unwrap_or(now);
                }
            }
        };

        let round_id = round.lock().await.id().clone();
        debug!(round_id = %round_id, starts_at = ends_at, "Countdown started");
        shared.events.publish(RoundEvent::CountdownStarted {
            round_id: round_id.clone(),
            starts_at: ends_at,
        });
        if let Err(e) = shared
            .store
            .update(&game_key(&round_id), json!({ "countdown_ends_at": ends_at }))
            .await
        {
            shared.metrics.record_store_failure();
            warn!(round_id = %round_id, error = %e, "Failed to persist countdown");
        }

        let remaining = ends_at.saturating_sub(shared.clock.now_ms());
        tokio::time::sleep(Duration::from_millis(remaining)).await;
        true
    }

    async fn start_round(&self, round: &Arc<Mutex<Round>>) {
        let shared = &self.shared;
        // Held through the write so no cash-out can land before the start
        // snapshot and then be overwritten by it
        let mut r = round.lock().await;
        let now = shared.clock.now_ms();
        if let Err(e) = r.start(now) {
            warn!(round_id = %r.id(), error = %e, "Round could not start");
            return;
        }
        let snapshot = r.snapshot(now);

        let start_time = snapshot.phase.start_time().unwrap_or_default();
        shared.metrics.record_round_started();
        info!(
            round_id = %snapshot.id,
            bets = snapshot.players.len(),
            wagered = snapshot.players.total_wagered(),
            "Round started"
        );
        shared.events.publish(RoundEvent::RoundStarted {
            round_id: snapshot.id.clone(),
            start_time,
            growth_rate: snapshot.growth_rate,
        });
        shared.persist_round(&snapshot, "persist round start").await;
    }

    async fn run_ticks(&self, round: &Arc<Mutex<Round>>) {
        let shared = &self.shared;
        let mut interval = tokio::time::interval(shared.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut gate = WriteGate::new(shared.backoff.clone());

        let round_id = round.lock().await.id().clone();
        let key = game_key(&round_id);
        // Ledger revision known to be in the store
        let mut stored_revision = None;

        loop {
            interval.tick().await;

            let mut r = round.lock().await;
            let now = shared.clock.now_ms();
            let step = r.advance(now);
            let elapsed_ms = now.saturating_sub(r.phase().start_time().unwrap_or(now));

            shared.announce_cashouts(&round_id, &step.auto_cashouts);
            if r.is_crashed() {
                break;
            }

            shared.metrics.set_multiplier(step.multiplier);
            shared.events.publish(RoundEvent::Tick {
                round_id: round_id.clone(),
                multiplier: step.multiplier,
                elapsed_ms,
            });

            if !gate.is_open() {
                continue;
            }

            // Exits stay pending until a write carrying them succeeds. That
            // write happens under the round lock so it cannot overwrite a
            // newer ledger written by a cash-out.
            let revision = r.ledger_revision();
            let mut fields = json!({ "current_multiplier": step.multiplier });
            let mut carries_ledger = false;
            if stored_revision != Some(revision) {
                match records::to_value(r.ledger()) {
                    Ok(players) => {
                        fields["players"] = players;
                        carries_ledger = true;
                    }
                    Err(e) => warn!(round_id = %round_id, error = %e, "Failed to encode ledger"),
                }
            }
            if !carries_ledger {
                drop(r);
            }

            match shared.store.update(&key, fields).await {
                Ok(_) => {
                    gate.record_success();
                    if carries_ledger {
                        stored_revision = Some(revision);
                    }
                }
                Err(e) => {
                    gate.record_failure();
                    shared.metrics.record_store_failure();
                    warn!(round_id = %round_id, failures = gate.failures(), error = %e, "Tick update failed");
                }
            }
        }
    }

    async fn finish(&mut self, round: &Arc<Mutex<Round>>) {
        let shared = self.shared.clone();
        let snapshot = round.lock().await.snapshot(shared.clock.now_ms());
        let crash_point = snapshot.crash_point.unwrap_or(1.0);

        shared.metrics.record_round_crashed(crash_point);
        info!(
            round_id = %snapshot.id,
            crash_point,
            bets = snapshot.players.len(),
            "Round crashed"
        );
        shared.events.publish(RoundEvent::Crashed {
            round_id: snapshot.id.clone(),
            crash_point,
            end_time: snapshot.phase.end_time().unwrap_or_default(),
            commitment: snapshot.commitment.clone(),
            proof: snapshot.proof.clone(),
        });

        shared.persist_round(&snapshot, "persist crashed round").await;
        self.settle_or_defer(Deferred {
            snapshot,
            kind: SettlementKind::Payout,
        })
        .await;
    }

    async fn settle_once(&self, pending: &Deferred) -> CrashResult<SettlementReport> {
        match pending.kind {
            SettlementKind::Payout => self.shared.settlement.settle(&pending.snapshot).await,
            SettlementKind::Refund => self.shared.settlement.refund(&pending.snapshot).await,
        }
    }

    async fn settle_or_defer(&mut self, pending: Deferred) {
        let what = match pending.kind {
            SettlementKind::Payout => "settle round",
            SettlementKind::Refund => "refund round",
        };
        let this = &*self;
        let pending_ref = &pending;
        let result = self
            .shared
            .backoff
            .retry(what, move || this.settle_once(pending_ref))
            .await;

        match result {
            Ok(report) => self.shared.announce_settlement(&report),
            Err(e) => {
                self.shared.metrics.record_store_failure();
                error!(
                    round_id = %pending.snapshot.id,
                    error = %e,
                    "Settlement failed, will retry before the next round"
                );
                self.deferred.push_back(pending);
                self.persist_deferred().await;
            }
        }
    }

    async fn retry_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }

        let mut remaining = VecDeque::new();
        while let Some(pending) = self.deferred.pop_front() {
            self.shared.metrics.record_settlement_retry();
            match self.settle_once(&pending).await {
                Ok(report) => {
                    info!(round_id = %pending.snapshot.id, kind = ?pending.kind, "Deferred settlement completed");
                    self.shared.announce_settlement(&report);
                }
                Err(e) => {
                    warn!(round_id = %pending.snapshot.id, error = %e, "Deferred settlement failed again");
                    remaining.push_back(pending);
                }
            }
        }
        self.deferred = remaining;
        self.persist_deferred().await;
    }

    async fn persist_deferred(&self) {
        let pending: Vec<PendingSettlement> = self
            .deferred
            .iter()
            .map(|d| PendingSettlement {
                round_id: d.snapshot.id.clone(),
                kind: d.kind,
            })
            .collect();

        if let Err(e) = records::save(self.shared.store.as_ref(), PENDING_SETTLEMENTS_KEY, &pending).await {
            self.shared.metrics.record_store_failure();
            warn!(pending = pending.len(), error = %e, "Failed to persist pending settlements");
        }
    }

    /// Rebuild state after a restart. Interrupted settlements are queued;
    /// a waiting or running round is handed back to be resumed.
    async fn recover(&mut self) -> CrashResult<Option<Arc<Mutex<Round>>>> {
        let shared = self.shared.clone();
        let store = shared.store.as_ref();

        let pending = shared
            .backoff
            .retry("load pending settlements", move || {
                records::load::<Vec<PendingSettlement>>(store, PENDING_SETTLEMENTS_KEY)
            })
            .await?
            .unwrap_or_default();
        for entry in pending {
            if let Some(deferred) = self.reconcile(&entry.round_id, entry.kind).await? {
                self.deferred.push_back(deferred);
            }
        }

        let current = shared
            .backoff
            .retry("load current round", move || records::current_round_id(store))
            .await?;
        let Some(round_id) = current else {
            return Ok(None);
        };
        if self.deferred.iter().any(|d| d.snapshot.id == round_id) {
            return Ok(None);
        }

        let Some(snapshot) = records::load_round(store, &round_id).await? else {
            warn!(round_id = %round_id, "Current round pointer has no round record");
            return Ok(None);
        };

        if matches!(snapshot.phase, RoundPhase::Crashed { .. }) {
            info!(round_id = %round_id, "Recovered crashed round, checking settlement");
            self.deferred.push_back(Deferred {
                snapshot,
                kind: SettlementKind::Payout,
            });
            return Ok(None);
        }

        let restored = match records::load::<CrashSeal>(store, &secret_key(&round_id)).await {
            Ok(Some(seal)) => Round::restore(snapshot.clone(), seal),
            Ok(None) => Err(GameError::RoundNotFound(format!("sealed crash point for {}", round_id)).into()),
            Err(e) if e.is_store_unavailable() => return Err(e),
            Err(e) => Err(e),
        };

        match restored {
            Ok(round) => {
                info!(round_id = %round_id, status = round.status(), bets = round.ledger().len(), "Resuming round");
                let round = Arc::new(Mutex::new(round));
                shared.install(&round).await;
                Ok(Some(round))
            }
            Err(e) => {
                warn!(round_id = %round_id, error = %e, "Abandoning round that cannot be resumed");
                shared.metrics.record_round_abandoned();
                self.deferred.push_back(Deferred {
                    snapshot,
                    kind: SettlementKind::Refund,
                });
                Ok(None)
            }
        }
    }

    /// Work out how an interrupted settlement should be finished
    async fn reconcile(&self, round_id: &RoundId, kind: SettlementKind) -> CrashResult<Option<Deferred>> {
        let store = self.shared.store.as_ref();
        let Some(snapshot) = records::load_round(store, round_id).await? else {
            warn!(round_id = %round_id, "Pending settlement refers to a missing round");
            return Ok(None);
        };

        if kind == SettlementKind::Refund || matches!(snapshot.phase, RoundPhase::Crashed { .. }) {
            return Ok(Some(Deferred { snapshot, kind }));
        }

        // The crash happened but was never persisted: replay it from the seal
        let seal: Option<CrashSeal> = records::load(store, &secret_key(round_id)).await?;
        if let Some(Ok(mut round)) = seal.map(|seal| Round::restore(snapshot.clone(), seal)) {
            let now = self.shared.clock.now_ms();
            round.advance(now);
            if round.is_crashed() {
                let snapshot = round.snapshot(now);
                self.shared.persist_round(&snapshot, "persist replayed crash").await;
                return Ok(Some(Deferred { snapshot, kind }));
            }
        }

        self.shared.metrics.record_round_abandoned();
        Ok(Some(Deferred {
            snapshot,
            kind: SettlementKind::Refund,
        }))
    }
}

/// Cloneable entry point for players and observers
#[derive(Clone)]
pub struct GameHandle {
    shared: Arc<Shared>,
}

impl GameHandle {
    pub fn config(&self) -> &CrashlineConfig {
        &self.shared.config
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.status.borrow().clone()
    }

    pub fn metrics(&self) -> Arc<GameMetrics> {
        self.shared.metrics.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.shared.events.subscribe()
    }

    /// Store-level subscription to a round record
    pub async fn watch_round(&self, round_id: &RoundId) -> CrashResult<Subscription> {
        self.shared.store.subscribe(&game_key(round_id)).await
    }

    /// Stop after the round in flight has been settled
    pub fn stop(&self) {
        info!("Stop requested");
        self.shared.stop.send_replace(true);
    }

    pub async fn current_round(&self) -> Option<RoundSnapshot> {
        let round = self.shared.current.read().await.as_ref()?.round.clone();
        let r = round.lock().await;
        Some(r.snapshot(self.shared.clock.now_ms()))
    }

    /// Live view of the current round, or the stored record of any other
    pub async fn round(&self, round_id: &RoundId) -> CrashResult<Option<RoundSnapshot>> {
        let current = self.shared.current.read().await.as_ref().and_then(|c| {
            (&c.id == round_id).then(|| c.round.clone())
        });
        match current {
            Some(round) => Ok(Some(round.lock().await.snapshot(self.shared.clock.now_ms()))),
            None => records::load_round(self.shared.store.as_ref(), round_id).await,
        }
    }

    pub async fn player(&self, player_id: &PlayerId) -> CrashResult<Option<PlayerAccount>> {
        self.shared.accounts.get(player_id).await
    }

    pub async fn get_or_create_player(&self, player_id: &PlayerId, username: &str) -> CrashResult<PlayerAccount> {
        self.shared.accounts.get_or_create(player_id, username).await
    }

    pub async fn recent_results(&self, limit: usize) -> CrashResult<Vec<RoundResult>> {
        records::recent_results(self.shared.store.as_ref(), limit).await
    }

    /// The live round if `round_id` names it; otherwise the error a client
    /// should see for that id
    async fn round_for(&self, round_id: &RoundId, operation: &'static str) -> CrashResult<Arc<Mutex<Round>>> {
        if let Some(current) = self.shared.current.read().await.as_ref() {
            if &current.id == round_id {
                return Ok(current.round.clone());
            }
        }

        match records::load_round(self.shared.store.as_ref(), round_id).await? {
            Some(snapshot) => Err(GameError::InvalidState {
                operation,
                status: snapshot.status(),
            }
            .into()),
            None => Err(GameError::RoundNotFound(round_id.to_string()).into()),
        }
    }

    /// Stake `amount` on a waiting round. The debit and the bet are written
    /// in one batch; if the debit fails the bet is withdrawn.
    pub async fn place_bet(
        &self,
        round_id: &RoundId,
        player_id: &PlayerId,
        username: &str,
        amount: f64,
        auto_cashout: Option<f64>,
    ) -> CrashResult<BetReceipt> {
        let shared = &self.shared;
        if let EngineStatus::Halted { reason } = self.status() {
            return Err(CrashError::Halted(reason));
        }

        let game = &shared.config.game;
        if !amount.is_finite() || amount < game.min_bet {
            shared.metrics.record_rejected_bet();
            return Err(GameError::InvalidAmount(format!(
                "stake {} is below the minimum of {}",
                amount, game.min_bet
            ))
            .into());
        }
        if let Some(max_bet) = game.max_bet {
            if amount > max_bet {
                shared.metrics.record_rejected_bet();
                return Err(GameError::InvalidAmount(format!(
                    "stake {} is above the maximum of {}",
                    amount, max_bet
                ))
                .into());
            }
        }

        let round = self.round_for(round_id, "place_bet").await?;
        shared.accounts.get_or_create(player_id, username).await?;

        let mut r = round.lock().await;
        let now = shared.clock.now_ms();
        let bet = Bet::new(player_id.clone(), username, amount, auto_cashout, now);
        let bet = match r.place_bet(bet, now) {
            Ok(bet) => bet.clone(),
            Err(e) => {
                shared.metrics.record_rejected_bet();
                debug!(round_id = %round_id, player_id = %player_id, error = %e, "Bet rejected");
                return Err(e.into());
            }
        };

        let debit = match records::to_value(&r.snapshot(now)) {
            Ok(record) => {
                shared
                    .accounts
                    .debit(player_id, amount, vec![(game_key(round_id), record)])
                    .await
            }
            Err(e) => Err(e),
        };
        let account = match debit {
            Ok(account) => account,
            Err(e) => {
                r.withdraw_bet(player_id);
                shared.metrics.record_rejected_bet();
                debug!(round_id = %round_id, player_id = %player_id, error = %e, "Bet rejected");
                return Err(e);
            }
        };

        if shared.config.timing.start_policy == StartPolicy::FirstBet && r.countdown_ends_at().is_none() {
            if r.begin_countdown(now, shared.config.timing.countdown_ms).is_ok() {
                shared.first_bet.notify_one();
            }
        }
        drop(r);

        shared.metrics.record_bet(amount);
        info!(round_id = %round_id, player_id = %player_id, amount, ?auto_cashout, "Bet placed");
        shared.events.publish(RoundEvent::BetPlaced {
            round_id: round_id.clone(),
            player_id: player_id.clone(),
            username: bet.username.clone(),
            amount,
            auto_cashout,
        });

        Ok(BetReceipt {
            round_id: round_id.clone(),
            bet,
            balance: account.balance,
        })
    }

    /// Cash out at the server's multiplier for the instant the request is
    /// processed. The exit is acknowledged only once the ledger carrying it
    /// is stored; if the store stays unavailable the exit is taken back and
    /// the player may try again. The payout is credited at settlement.
    pub async fn cash_out(&self, round_id: &RoundId, player_id: &PlayerId) -> CrashResult<CashOut> {
        let shared = &self.shared;
        let round = self.round_for(round_id, "cash_out").await?;

        let mut r = round.lock().await;
        let (step, result) = r.cash_out(player_id, shared.clock.now_ms());
        shared.announce_cashouts(round_id, &step.auto_cashouts);

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(e) => {
                debug!(round_id = %round_id, player_id = %player_id, error = %e, "Cash-out rejected");
                return Err(e.into());
            }
        };

        let persisted = match records::to_value(r.ledger()) {
            Ok(players) => {
                let store = shared.store.as_ref();
                let key = game_key(round_id);
                let key = key.as_str();
                shared
                    .backoff
                    .retry("persist cash-out", move || {
                        store.update(key, json!({ "players": players.clone() }))
                    })
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            r.revoke_cash_out(player_id);
            shared.metrics.record_store_failure();
            warn!(round_id = %round_id, player_id = %player_id, error = %e, "Cash-out could not be stored, rejected");
            return Err(e);
        }
        drop(r);

        shared.announce_cashouts(round_id, std::slice::from_ref(&receipt));
        Ok(receipt)
    }
}
