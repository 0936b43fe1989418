//! End-to-end rounds through the public handle: bets, cash-outs,
//! auto-cashouts, crash, settlement and the results archive.

use crashline::{
    clock::{Clock, SystemClock},
    config::{CrashlineConfig, StartPolicy},
    events::RoundEvent,
    fairness::{FairnessEngine, ScriptedCrashPoints},
    settlement::SettlementKind,
    store::MemoryStore,
    CrashResult, EngineStatus, ErrorKind, GameHandle, PlayerId, RoundId, RoundOrchestrator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(10);

/// Fast curve: 2x after ~80ms, 3x after ~215ms
fn config() -> CrashlineConfig {
    let mut config = CrashlineConfig::testing();
    config.game.growth_rate = 20.0;
    config.timing.countdown_ms = 200;
    config
}

struct Engine {
    store: Arc<MemoryStore>,
    game: GameHandle,
    events: broadcast::Receiver<RoundEvent>,
    task: JoinHandle<CrashResult<()>>,
}

fn start(config: CrashlineConfig, crash_points: ScriptedCrashPoints) -> Engine {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = RoundOrchestrator::new(
        config,
        store.clone(),
        Arc::new(SystemClock),
        Arc::new(crash_points),
    );
    let events = orchestrator.handle().subscribe();
    let (game, task) = orchestrator.spawn();
    Engine {
        store,
        game,
        events,
        task,
    }
}

async fn wait_for<F>(events: &mut broadcast::Receiver<RoundEvent>, mut matches: F) -> RoundEvent
where
    F: FnMut(&RoundEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn next_round(events: &mut broadcast::Receiver<RoundEvent>) -> RoundId {
    match wait_for(events, |e| matches!(e, RoundEvent::RoundOpened { .. })).await {
        RoundEvent::RoundOpened { round_id, .. } => round_id,
        _ => unreachable!(),
    }
}

async fn balance(game: &GameHandle, player: &str) -> f64 {
    game.player(&PlayerId::from(player)).await.unwrap().unwrap().balance
}

/// Betting stays open for a fixed window whether or not anyone bets
fn fixed_window_config() -> CrashlineConfig {
    let mut config = config();
    config.timing.start_policy = StartPolicy::FixedWindow;
    config.timing.betting_window_ms = 100;
    config.timing.countdown_ms = 100;
    config
}

async fn shutdown(engine: Engine) {
    engine.game.stop();
    engine.task.await.unwrap().unwrap();
    assert_eq!(engine.game.status(), EngineStatus::Stopped);
}

#[tokio::test]
async fn test_round_pays_winners_and_archives_result() {
    let mut engine = start(config(), ScriptedCrashPoints::repeating([3.0]));
    let game = engine.game.clone();
    let round_id = next_round(&mut engine.events).await;

    let alice = PlayerId::from("alice");
    let bob = PlayerId::from("bob");
    let carol = PlayerId::from("carol");

    let receipt = game.place_bet(&round_id, &alice, "Alice", 100.0, Some(1.5)).await.unwrap();
    assert_eq!(receipt.balance, 900.0);
    game.place_bet(&round_id, &bob, "Bob", 100.0, None).await.unwrap();
    game.place_bet(&round_id, &carol, "Carol", 50.0, None).await.unwrap();

    // Bob exits manually once the curve passes 1.2x
    wait_for(&mut engine.events, |e| {
        matches!(e, RoundEvent::Tick { multiplier, .. } if *multiplier >= 1.2)
    })
    .await;
    let bob_exit = game.cash_out(&round_id, &bob).await.unwrap();
    assert!(bob_exit.multiplier >= 1.2 && bob_exit.multiplier < 3.0);
    assert!(!bob_exit.auto);

    let crashed = wait_for(&mut engine.events, |e| matches!(e, RoundEvent::Crashed { .. })).await;
    let RoundEvent::Crashed { crash_point, .. } = crashed else { unreachable!() };
    assert_eq!(crash_point, 3.0);

    // Carol never cashed out, and no one can after the crash
    let late = game.cash_out(&round_id, &carol).await.unwrap_err();
    assert_eq!(late.kind(), ErrorKind::InvalidState);

    let settled = wait_for(&mut engine.events, |e| matches!(e, RoundEvent::Settled { .. })).await;
    let RoundEvent::Settled { kind, credited, .. } = settled else { unreachable!() };
    assert_eq!(kind, SettlementKind::Payout);
    assert_eq!(credited, 2);

    assert_eq!(balance(&game, "alice").await, 1_050.0);
    assert!((balance(&game, "bob").await - (900.0 + 100.0 * bob_exit.multiplier)).abs() < 1e-9);
    assert_eq!(balance(&game, "carol").await, 950.0);

    let results = game.recent_results(5).await.unwrap();
    assert_eq!(results[0].round_id, round_id);
    assert_eq!(results[0].crash_point, 3.0);
    assert_eq!(results[0].bets.len(), 3);
    assert_eq!(results[0].total_wagered, 250.0);

    shutdown(engine).await;
}

#[tokio::test]
async fn test_auto_cashout_at_target() {
    let mut engine = start(config(), ScriptedCrashPoints::repeating([2.0]));
    let game = engine.game.clone();
    let round_id = next_round(&mut engine.events).await;

    let p = PlayerId::from("p");
    game.place_bet(&round_id, &p, "p", 10.0, Some(1.75)).await.unwrap();

    let event = wait_for(&mut engine.events, |e| matches!(e, RoundEvent::CashedOut { .. })).await;
    let RoundEvent::CashedOut { multiplier, payout, auto, .. } = event else { unreachable!() };
    assert_eq!(multiplier, 1.75);
    assert_eq!(payout, 17.5);
    assert!(auto);

    wait_for(&mut engine.events, |e| matches!(e, RoundEvent::Settled { .. })).await;
    assert_eq!(balance(&game, "p").await, 1_007.5);

    shutdown(engine).await;
}

#[tokio::test]
async fn test_target_at_crash_point_loses() {
    let mut engine = start(config(), ScriptedCrashPoints::repeating([2.0]));
    let game = engine.game.clone();
    let round_id = next_round(&mut engine.events).await;

    let p = PlayerId::from("p");
    game.place_bet(&round_id, &p, "p", 10.0, Some(2.0)).await.unwrap();

    let settled = wait_for(&mut engine.events, |e| matches!(e, RoundEvent::Settled { .. })).await;
    let RoundEvent::Settled { credited, total_paid, .. } = settled else { unreachable!() };
    assert_eq!(credited, 0);
    assert_eq!(total_paid, 0.0);
    assert_eq!(balance(&game, "p").await, 990.0);

    shutdown(engine).await;
}

#[tokio::test]
async fn test_admission_errors() {
    let mut engine = start(config(), ScriptedCrashPoints::repeating([50.0]));
    let game = engine.game.clone();
    let round_id = next_round(&mut engine.events).await;
    let alice = PlayerId::from("alice");
    let bob = PlayerId::from("bob");

    game.place_bet(&round_id, &alice, "alice", 100.0, None).await.unwrap();

    let duplicate = game.place_bet(&round_id, &alice, "alice", 10.0, None).await.unwrap_err();
    assert_eq!(duplicate.kind(), ErrorKind::DuplicateBet);

    let broke = game.place_bet(&round_id, &bob, "bob", 5_000.0, None).await.unwrap_err();
    assert_eq!(broke.kind(), ErrorKind::InsufficientFunds);
    // nothing was taken and no bet was left behind
    assert_eq!(balance(&game, "bob").await, 1_000.0);
    let snapshot = game.current_round().await.unwrap();
    assert!(!snapshot.players.contains(&bob));

    let bad_target = game.place_bet(&round_id, &bob, "bob", 10.0, Some(0.5)).await.unwrap_err();
    assert_eq!(bad_target.kind(), ErrorKind::InvalidAmount);

    let early = game.cash_out(&round_id, &alice).await.unwrap_err();
    assert_eq!(early.kind(), ErrorKind::InvalidState);

    let unknown = game
        .place_bet(&RoundId::from("no-such-round"), &bob, "bob", 10.0, None)
        .await
        .unwrap_err();
    assert_eq!(unknown.kind(), ErrorKind::RoundNotFound);

    // betting closes once the round is running
    wait_for(&mut engine.events, |e| matches!(e, RoundEvent::RoundStarted { .. })).await;
    let closed = game.place_bet(&round_id, &bob, "bob", 10.0, None).await.unwrap_err();
    assert_eq!(closed.kind(), ErrorKind::InvalidState);

    let no_bet = game.cash_out(&round_id, &bob).await.unwrap_err();
    assert_eq!(no_bet.kind(), ErrorKind::NoSuchBet);

    game.cash_out(&round_id, &alice).await.unwrap();
    let twice = game.cash_out(&round_id, &alice).await.unwrap_err();
    assert_eq!(twice.kind(), ErrorKind::AlreadyCashedOut);

    shutdown(engine).await;
}

#[tokio::test]
async fn test_rounds_follow_each_other() {
    let mut engine = start(config(), ScriptedCrashPoints::repeating([1.5, 1.2]));
    let game = engine.game.clone();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let round_id = next_round(&mut engine.events).await;
        game.place_bet(&round_id, &PlayerId::from("p"), "p", 1.0, None).await.unwrap();
        wait_for(&mut engine.events, |e| matches!(e, RoundEvent::Settled { .. })).await;
        seen.push(round_id);
    }

    let results = game.recent_results(10).await.unwrap();
    let crash_points: Vec<f64> = results.iter().map(|r| r.crash_point).collect();
    assert_eq!(crash_points, vec![1.5, 1.2, 1.5]);
    assert_eq!(results[0].round_id, seen[2]);
    assert_eq!(game.metrics().rounds_crashed(), 3);

    // settled rounds stay queryable
    let first = game.round(&seen[0]).await.unwrap().unwrap();
    assert_eq!(first.status(), "crashed");
    assert_eq!(first.crash_point, Some(1.5));
    assert!(engine.store.len().await > 0);

    shutdown(engine).await;
}

#[tokio::test]
async fn test_vrf_reveal_matches_commitment() {
    let mut config = config();
    // keep random rounds short
    config.game.max_multiplier = 50.0;
    let store = Arc::new(MemoryStore::new());
    let orchestrator = RoundOrchestrator::from_config(config.clone(), store).await.unwrap();
    let mut events = orchestrator.handle().subscribe();
    let (game, task) = orchestrator.spawn();

    let opened = wait_for(&mut events, |e| matches!(e, RoundEvent::RoundOpened { .. })).await;
    let RoundEvent::RoundOpened { round_id, commitment, .. } = opened else { unreachable!() };
    game.place_bet(&round_id, &PlayerId::from("p"), "p", 1.0, None).await.unwrap();

    let crashed = wait_for(&mut events, |e| matches!(e, RoundEvent::Crashed { .. })).await;
    let RoundEvent::Crashed { crash_point, proof, commitment: revealed, .. } = crashed else {
        unreachable!()
    };
    assert_eq!(revealed, commitment);

    let proof = proof.expect("VRF rounds reveal a proof");
    assert_eq!(proof.input_message, format!("crash:{}", round_id));
    let verified = FairnessEngine::verify_reveal(
        &commitment,
        &proof,
        config.game.house_edge,
        config.game.max_multiplier,
    )
    .unwrap();
    assert_eq!(verified, crash_point);

    game.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_halts_when_no_round_can_be_created() {
    let mut engine = start(config(), ScriptedCrashPoints::once(Vec::<f64>::new()));

    let halted = wait_for(&mut engine.events, |e| matches!(e, RoundEvent::Halted { .. })).await;
    assert!(matches!(halted, RoundEvent::Halted { .. }));

    let err = engine.task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Halted);
    assert!(matches!(engine.game.status(), EngineStatus::Halted { .. }));

    let refused = engine
        .game
        .place_bet(&RoundId::from("r"), &PlayerId::from("p"), "p", 1.0, None)
        .await
        .unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::Halted);
}

#[tokio::test]
async fn test_fixed_window_round_runs_without_bets() {
    let mut engine = start(fixed_window_config(), ScriptedCrashPoints::repeating([1.5]));
    let round_id = next_round(&mut engine.events).await;

    let countdown = wait_for(&mut engine.events, |e| {
        matches!(e, RoundEvent::CountdownStarted { .. })
    })
    .await;
    let RoundEvent::CountdownStarted { round_id: counting, .. } = countdown else { unreachable!() };
    assert_eq!(counting, round_id);

    let started = wait_for(&mut engine.events, |e| matches!(e, RoundEvent::RoundStarted { .. })).await;
    let RoundEvent::RoundStarted { round_id: running, .. } = started else { unreachable!() };
    assert_eq!(running, round_id);

    let crashed = wait_for(&mut engine.events, |e| matches!(e, RoundEvent::Crashed { .. })).await;
    let RoundEvent::Crashed { crash_point, .. } = crashed else { unreachable!() };
    assert_eq!(crash_point, 1.5);

    let settled = wait_for(&mut engine.events, |e| matches!(e, RoundEvent::Settled { .. })).await;
    let RoundEvent::Settled { round_id: done, kind, credited, total_paid } = settled else {
        unreachable!()
    };
    assert_eq!(done, round_id);
    assert_eq!(kind, SettlementKind::Payout);
    assert_eq!(credited, 0);
    assert_eq!(total_paid, 0.0);

    shutdown(engine).await;
}

#[tokio::test]
async fn test_fixed_window_rejects_bets_after_countdown() {
    let mut engine = start(fixed_window_config(), ScriptedCrashPoints::repeating([3.0]));
    let game = engine.game.clone();
    let round_id = next_round(&mut engine.events).await;

    // Inside the window a bet does not shorten it
    game.place_bet(&round_id, &PlayerId::from("alice"), "Alice", 100.0, None)
        .await
        .unwrap();

    let countdown = wait_for(&mut engine.events, |e| {
        matches!(e, RoundEvent::CountdownStarted { .. })
    })
    .await;
    let RoundEvent::CountdownStarted { starts_at, .. } = countdown else { unreachable!() };

    let wait = starts_at.saturating_sub(SystemClock.now_ms());
    tokio::time::sleep(Duration::from_millis(wait)).await;

    let late = game
        .place_bet(&round_id, &PlayerId::from("bob"), "Bob", 100.0, None)
        .await
        .unwrap_err();
    assert_eq!(late.kind(), ErrorKind::InvalidState);
    assert_eq!(balance(&game, "bob").await, 1_000.0);

    let round = game.round(&round_id).await.unwrap().unwrap();
    assert_eq!(round.players.len(), 1);

    shutdown(engine).await;
}
