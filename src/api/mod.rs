//! Crash game API
//!
//! HTTP endpoints for bets, cash-outs and history, plus a WebSocket stream
//! of round events. Everything goes through a [`GameHandle`](crate::orchestrator::GameHandle).

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod websocket;

pub use server::{shutdown_signal, ApiServer};
