//! Configuration management with validation and defaults
//!
//! Defaults mirror the live game: 1% house edge, `1 + 0.1·t^1.5` growth,
//! a 10 second countdown, 20 Hz ticks and a short cooldown between rounds.

use crate::errors::{ConfigurationError, CrashResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashlineConfig {
    pub game: GameConfig,
    pub timing: TimingConfig,
    pub accounts: AccountConfig,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub api: ApiConfig,
    pub monitoring: MonitoringConfig,
}

/// Payout economics and the multiplier curve
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Fraction of expected value kept by the house, in (0, 1)
    pub house_edge: f64,
    /// Growth constant `k` in `1 + k·t^1.5`
    pub growth_rate: f64,
    /// Upper bound on generated crash points
    pub max_multiplier: f64,
    pub min_bet: f64,
    pub max_bet: Option<f64>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            house_edge: 0.01,
            growth_rate: 0.1,
            max_multiplier: 1_000_000.0,
            min_bet: 0.01,
            max_bet: None,
        }
    }
}

/// When the countdown for a waiting round begins
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartPolicy {
    /// Countdown starts as soon as the first bet is accepted
    FirstBet,
    /// Countdown starts after a fixed betting window, bets or not
    FixedWindow,
}

/// Round sequencing timings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub start_policy: StartPolicy,
    pub betting_window_ms: u64,
    pub countdown_ms: u64,
    pub tick_interval_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            start_policy: StartPolicy::FirstBet,
            betting_window_ms: 10_000,
            countdown_ms: 10_000,
            tick_interval_ms: 50,
            cooldown_ms: 3_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Balance granted to a player on first sight
    pub starting_balance: f64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            starting_balance: 1000.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    RocksDb,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_directory: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::RocksDb,
            data_directory: "./DB/crashline_data".to_string(),
        }
    }
}

/// Backoff for state store operations
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            max_attempts: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Fallback `EnvFilter` directive when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_filter: "crashline=info,tower_http=info".to_string(),
        }
    }
}

impl CrashlineConfig {
    /// Fast timings and an in-memory store, for tests and local simulation
    pub fn testing() -> Self {
        Self {
            timing: TimingConfig {
                start_policy: StartPolicy::FirstBet,
                betting_window_ms: 50,
                countdown_ms: 30,
                tick_interval_ms: 5,
                cooldown_ms: 20,
            },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                ..Default::default()
            },
            retry: RetryConfig {
                base_delay_ms: 1,
                max_delay_ms: 10,
                max_attempts: 5,
            },
            ..Default::default()
        }
    }

    /// Persistent storage and restricted defaults for deployment
    pub fn production() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::RocksDb,
                data_directory: "./DB/crashline_data".to_string(),
            },
            retry: RetryConfig {
                base_delay_ms: 200,
                max_delay_ms: 10_000,
                max_attempts: 8,
            },
            ..Default::default()
        }
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let game = &self.game;
        if !(game.house_edge > 0.0 && game.house_edge < 1.0) {
            return Err(invalid("game.house_edge", game.house_edge, "must be in (0, 1)"));
        }
        if !(game.growth_rate > 0.0 && game.growth_rate.is_finite()) {
            return Err(invalid("game.growth_rate", game.growth_rate, "must be > 0"));
        }
        if !(game.max_multiplier >= 1.0) {
            return Err(invalid("game.max_multiplier", game.max_multiplier, "must be >= 1"));
        }
        if !(game.min_bet > 0.0) {
            return Err(invalid("game.min_bet", game.min_bet, "must be > 0"));
        }
        if let Some(max_bet) = game.max_bet {
            if max_bet < game.min_bet {
                return Err(invalid("game.max_bet", max_bet, "must be >= min_bet"));
            }
        }

        // Crash detection must run at 20 Hz or faster
        let tick = self.timing.tick_interval_ms;
        if tick == 0 || tick > 50 {
            return Err(invalid("timing.tick_interval_ms", tick, "must be in 1..=50"));
        }

        if self.accounts.starting_balance < 0.0 {
            return Err(invalid(
                "accounts.starting_balance",
                self.accounts.starting_balance,
                "must be >= 0",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", 0, "must be > 0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigurationError::ValidationFailed(
                "retry.base_delay_ms exceeds retry.max_delay_ms".to_string(),
            ));
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.timing.tick_interval_ms)
    }

    pub fn countdown(&self) -> Duration {
        Duration::from_millis(self.timing.countdown_ms)
    }

    pub fn betting_window(&self) -> Duration {
        Duration::from_millis(self.timing.betting_window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.timing.cooldown_ms)
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> CrashResult<CrashlineConfig> {
        let mut config = match self.config_path {
            Some(ref path) => Self::load_from_file(path)?,
            None => CrashlineConfig::default(),
        };

        Self::apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    fn load_from_file(path: &str) -> CrashResult<CrashlineConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        Self::parse(&content)
    }

    /// Parse a TOML document; missing sections fall back to defaults
    pub fn parse(content: &str) -> CrashResult<CrashlineConfig> {
        toml::from_str(content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    fn apply_env_overrides(config: &mut CrashlineConfig) -> CrashResult<()> {
        if let Ok(data_dir) = env::var("CRASHLINE_DATA_DIR") {
            config.storage.data_directory = data_dir;
        }
        if let Ok(backend) = env::var("CRASHLINE_STORAGE_BACKEND") {
            config.storage.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "rocksdb" => StorageBackend::RocksDb,
                _ => {
                    return Err(ConfigurationError::InvalidValue {
                        field: "CRASHLINE_STORAGE_BACKEND".to_string(),
                        value: backend,
                        reason: "expected 'memory' or 'rocksdb'".to_string(),
                    }
                    .into())
                }
            };
        }
        if let Ok(port) = env::var("CRASHLINE_API_PORT") {
            config.api.port = port.parse().map_err(|_| ConfigurationError::InvalidValue {
                field: "CRASHLINE_API_PORT".to_string(),
                value: port,
                reason: "Invalid port number".to_string(),
            })?;
        }
        if let Ok(edge) = env::var("CRASHLINE_HOUSE_EDGE") {
            config.game.house_edge = edge.parse().map_err(|_| ConfigurationError::InvalidValue {
                field: "CRASHLINE_HOUSE_EDGE".to_string(),
                value: edge,
                reason: "Invalid number".to_string(),
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CrashlineConfig::default().validate().is_ok());
        assert!(CrashlineConfig::testing().validate().is_ok());
        assert!(CrashlineConfig::production().validate().is_ok());
    }

    #[test]
    fn test_invalid_house_edge() {
        let mut config = CrashlineConfig::default();
        config.game.house_edge = 1.0;
        assert!(config.validate().is_err());
        config.game.house_edge = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tick_rate_must_be_at_least_20hz() {
        let mut config = CrashlineConfig::default();
        config.timing.tick_interval_ms = 51;
        assert!(config.validate().is_err());
        config.timing.tick_interval_ms = 0;
        assert!(config.validate().is_err());
        config.timing.tick_interval_ms = 16;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_bet_below_min_bet() {
        let mut config = CrashlineConfig::default();
        config.game.max_bet = Some(0.001);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ConfigLoader::parse(
            r#"
            [game]
            house_edge = 0.02

            [timing]
            start_policy = "fixed_window"
            cooldown_ms = 5000
            "#,
        )
        .expect("parse");

        assert_eq!(config.game.house_edge, 0.02);
        assert_eq!(config.game.growth_rate, 0.1);
        assert_eq!(config.timing.start_policy, StartPolicy::FixedWindow);
        assert_eq!(config.cooldown(), Duration::from_millis(5000));
        assert_eq!(config.countdown(), Duration::from_millis(10_000));
    }

    #[test]
    fn test_duration_conversions() {
        let config = CrashlineConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
        assert_eq!(config.betting_window(), Duration::from_millis(10_000));
    }
}
