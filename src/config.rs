//! Configuration management
//!
//! Loads and validates the JSON session document containing the grid layout,
//! risk limits, retry policy, and exchange credentials. API credentials may
//! be overridden from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::types::{SessionError, Symbol};

/// Price spacing policy for the ladder.
///
/// Arithmetic spacing keeps a constant price step between rungs and suits
/// ranging markets where absolute oscillation is roughly uniform. Geometric
/// spacing keeps a constant price *ratio*, so rungs widen with price; it
/// holds the per-rung percentage profit constant and behaves better when the
/// band is wide relative to the price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Spacing {
    Arithmetic,
    Geometric,
}

/// Grid ladder configuration. Immutable once a session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub instrument: String,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub level_count: usize,
    /// Total capital committed to the ladder, split evenly across rungs.
    pub capital_allocation: f64,
    #[serde(default = "default_spacing")]
    pub spacing: Spacing,
}

fn default_spacing() -> Spacing {
    Spacing::Arithmetic
}

impl GridConfig {
    pub fn symbol(&self) -> Symbol {
        Symbol::new(&self.instrument)
    }

    /// Convenience constructor: bounds derived as reference * (1 +/- range_pct).
    pub fn around(instrument: &str, reference: f64, range_pct: f64, level_count: usize, capital: f64) -> Self {
        GridConfig {
            instrument: instrument.to_string(),
            lower_bound: reference * (1.0 - range_pct),
            upper_bound: reference * (1.0 + range_pct),
            level_count,
            capital_allocation: capital,
            spacing: Spacing::Arithmetic,
        }
    }

    /// Structural checks that do not depend on the reference price.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.level_count < 2 {
            return Err(SessionError::InvalidConfiguration(format!(
                "level_count must be >= 2, got {}",
                self.level_count
            )));
        }
        if self.lower_bound <= 0.0 || self.upper_bound <= self.lower_bound {
            return Err(SessionError::InvalidConfiguration(format!(
                "bounds must satisfy 0 < lower ({}) < upper ({})",
                self.lower_bound, self.upper_bound
            )));
        }
        if self.capital_allocation <= 0.0 {
            return Err(SessionError::InvalidConfiguration(format!(
                "capital_allocation must be positive, got {}",
                self.capital_allocation
            )));
        }
        Ok(())
    }
}

/// Read-only risk limits snapshot consulted before every submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Cap on the summed notional of open orders plus any proposed order.
    pub max_capital_at_risk: f64,
    /// Last-trade price at or below which the session halts.
    pub stop_loss_price: f64,
    /// Submissions allowed in any trailing 60-second window.
    pub max_orders_per_minute: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        RiskLimits {
            max_capital_at_risk: 10_000.0,
            stop_loss_price: 0.0,
            max_orders_per_minute: 30,
        }
    }
}

/// Backoff policy for rejected order submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1-based), doubling and capped.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64 << attempt.saturating_sub(1).min(32);
        self.initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

/// Exchange connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

/// Top-level session configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub grid: GridConfig,
    #[serde(default)]
    pub risk: RiskLimits,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Directory for the SQLite audit trail and its JSON backup.
    #[serde(default = "default_audit_dir")]
    pub audit_dir: String,
}

fn default_audit_dir() -> String {
    "state".to_string()
}

impl SessionConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: SessionConfig =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        // Credentials from the environment win over the file
        if let Ok(api_key) = std::env::var("EXCHANGE_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("EXCHANGE_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }

        config.grid.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_grid() -> GridConfig {
        GridConfig {
            instrument: "BTCUSDT".to_string(),
            lower_bound: 90.0,
            upper_bound: 110.0,
            level_count: 5,
            capital_allocation: 1000.0,
            spacing: Spacing::Arithmetic,
        }
    }

    #[test]
    fn test_valid_grid_passes() {
        assert!(valid_grid().validate().is_ok());
    }

    #[test]
    fn test_level_count_too_small() {
        let mut cfg = valid_grid();
        cfg.level_count = 1;
        assert!(matches!(
            cfg.validate(),
            Err(SessionError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_inverted_bounds() {
        let mut cfg = valid_grid();
        cfg.lower_bound = 110.0;
        cfg.upper_bound = 90.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 3_000,
        };
        assert_eq!(policy.delay_ms(1), 500);
        assert_eq!(policy.delay_ms(2), 1_000);
        assert_eq!(policy.delay_ms(3), 2_000);
        assert_eq!(policy.delay_ms(4), 3_000); // capped
        assert_eq!(policy.delay_ms(10), 3_000);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = SessionConfig {
            grid: valid_grid(),
            risk: RiskLimits::default(),
            retry: RetryPolicy::default(),
            exchange: ExchangeConfig::default(),
            audit_dir: "state".to_string(),
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.grid.level_count, 5);
        assert_eq!(parsed.grid.spacing, Spacing::Arithmetic);
    }

    #[test]
    fn test_grid_around_reference() {
        let cfg = GridConfig::around("BTCUSDT", 100.0, 0.08, 20, 1000.0);
        assert!((cfg.lower_bound - 92.0).abs() < 1e-9);
        assert!((cfg.upper_bound - 108.0).abs() < 1e-9);
        assert!(cfg.validate().is_ok());
    }
}
