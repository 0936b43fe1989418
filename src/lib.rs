//! Crashline - multiplayer crash game engine
//!
//! Players stake on a round whose multiplier grows as `1 + k·t^1.5` from
//! 1.00x until a crash point fixed, and committed to, before any bet is
//! taken. Cashing out before the crash pays stake × multiplier; anything
//! still riding at the crash is lost.
//!
//! - [`round`]: the round state machine and its authoritative step
//! - [`fairness`]: crash point distribution and VRF commit/reveal
//! - [`orchestrator`]: the round loop and the [`GameHandle`] players use
//! - [`settlement`]: idempotent, resumable payouts and refunds
//! - [`store`]: keyed state store with in-memory and RocksDB backends
//! - [`api`]: HTTP and WebSocket adapter

pub mod accounts;
pub mod api;
pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod fairness;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod records;
pub mod retry;
pub mod round;
pub mod settlement;
pub mod store;
pub mod types;

pub use config::CrashlineConfig;
pub use errors::{CrashError, CrashResult, ErrorKind, GameError};
pub use events::RoundEvent;
pub use orchestrator::{EngineStatus, GameHandle, RoundOrchestrator};
pub use round::{Round, RoundPhase, RoundSnapshot};
pub use types::{PlayerId, RoundId};
