//! Exponential backoff for state store operations
//!
//! Only `StoreUnavailable` is retried. Admission errors, corrupted records
//! and everything else are returned to the caller on the first attempt.

use crate::{config::RetryConfig, errors::CrashResult};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> CrashResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CrashResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_store_unavailable() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Throttle for best-effort writes: after a failure, skip writes until the
/// backoff delay has passed instead of blocking the caller.
#[derive(Debug)]
pub struct WriteGate {
    backoff: Backoff,
    failures: u32,
    blocked_until: Option<tokio::time::Instant>,
}

impl WriteGate {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            failures: 0,
            blocked_until: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.blocked_until
            .map_or(true, |until| tokio::time::Instant::now() >= until)
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.blocked_until = None;
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.blocked_until = Some(tokio::time::Instant::now() + self.backoff.delay(self.failures));
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
