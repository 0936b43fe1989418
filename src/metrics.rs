//! Game counters exported in Prometheus text format

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// `f64` stored as bits in an `AtomicU64`
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn add(&self, value: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }
}

pub struct GameMetrics {
    started: Instant,
    rounds_started: AtomicU64,
    rounds_crashed: AtomicU64,
    rounds_abandoned: AtomicU64,
    bets_placed: AtomicU64,
    bets_rejected: AtomicU64,
    cashouts: AtomicU64,
    auto_cashouts: AtomicU64,
    store_failures: AtomicU64,
    settlement_retries: AtomicU64,
    wagered: AtomicF64,
    paid_out: AtomicF64,
    current_multiplier: AtomicF64,
}

impl GameMetrics {
    pub fn new() -> Self {
        let metrics = Self {
            started: Instant::now(),
            rounds_started: AtomicU64::new(0),
            rounds_crashed: AtomicU64::new(0),
            rounds_abandoned: AtomicU64::new(0),
            bets_placed: AtomicU64::new(0),
            bets_rejected: AtomicU64::new(0),
            cashouts: AtomicU64::new(0),
            auto_cashouts: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            settlement_retries: AtomicU64::new(0),
            wagered: AtomicF64::default(),
            paid_out: AtomicF64::default(),
            current_multiplier: AtomicF64::default(),
        };
        metrics.current_multiplier.set(1.0);
        metrics
    }

    pub fn record_round_started(&self) {
        self.rounds_started.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_round_crashed(&self, crash_point: f64) {
        self.rounds_crashed.fetch_add(1, Ordering::SeqCst);
        self.current_multiplier.set(crash_point);
    }

    pub fn record_round_abandoned(&self) {
        self.rounds_abandoned.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_bet(&self, amount: f64) {
        self.bets_placed.fetch_add(1, Ordering::SeqCst);
        self.wagered.add(amount);
    }

    pub fn record_rejected_bet(&self) {
        self.bets_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_cashout(&self, auto: bool) {
        if auto {
            self.auto_cashouts.fetch_add(1, Ordering::SeqCst);
        } else {
            self.cashouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_payout(&self, amount: f64) {
        self.paid_out.add(amount);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_settlement_retry(&self) {
        self.settlement_retries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_multiplier(&self, multiplier: f64) {
        self.current_multiplier.set(multiplier);
    }

    pub fn rounds_crashed(&self) -> u64 {
        self.rounds_crashed.load(Ordering::SeqCst)
    }

    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::SeqCst)
    }

    pub fn to_prometheus_format(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("crashline_rounds_started_total", "Rounds that entered running", self.rounds_started.load(Ordering::SeqCst)),
            ("crashline_rounds_crashed_total", "Rounds that crashed", self.rounds_crashed.load(Ordering::SeqCst)),
            ("crashline_rounds_abandoned_total", "Rounds abandoned and refunded", self.rounds_abandoned.load(Ordering::SeqCst)),
            ("crashline_bets_total", "Accepted bets", self.bets_placed.load(Ordering::SeqCst)),
            ("crashline_bets_rejected_total", "Rejected bet attempts", self.bets_rejected.load(Ordering::SeqCst)),
            ("crashline_cashouts_total", "Manual cash-outs", self.cashouts.load(Ordering::SeqCst)),
            ("crashline_auto_cashouts_total", "Automatic cash-outs", self.auto_cashouts.load(Ordering::SeqCst)),
            ("crashline_store_failures_total", "Failed state store operations", self.store_failures.load(Ordering::SeqCst)),
            ("crashline_settlement_retries_total", "Deferred settlement attempts", self.settlement_retries.load(Ordering::SeqCst)),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        }

        let gauges = [
            ("crashline_wagered_total", "Total amount staked", self.wagered.get()),
            ("crashline_paid_out_total", "Total amount credited at settlement", self.paid_out.get()),
            ("crashline_current_multiplier", "Multiplier of the round in flight", self.current_multiplier.get()),
            ("crashline_uptime_seconds", "Seconds since the engine started", self.started.elapsed().as_secs_f64()),
        ];
        for (name, help, value) in gauges {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n\n"
            ));
        }

        output
    }
}

impl Default for GameMetrics {
    fn default() -> Self {
        Self::new()
    }
}
