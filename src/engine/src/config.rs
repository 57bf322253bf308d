//! Engine configuration loading from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

/// Pricing, ledger and locking parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Balance granted to an account on first activity
    pub starting_balance: Decimal,
    /// House fee applied to fair odds (e.g., 0.025 = 2.5%)
    pub house_fee: Decimal,
    /// Probability shift per point of narrator reputation
    pub reputation_weight: Decimal,
    /// Reputation beyond this has no further effect on odds
    pub reputation_cap: Decimal,
    /// Lower clamp for the oracle-correct probability
    pub min_probability: Decimal,
    /// Upper clamp for the oracle-correct probability
    pub max_probability: Decimal,
    /// Unpredictability at or above this counts as a surprise and pays side B
    pub surprise_threshold: f64,
    /// How long to wait for a pool or account lock before reporting a conflict
    pub lock_timeout_ms: u64,
    /// Bounded retries for concurrency conflicts
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            starting_balance: dec!(1000),
            house_fee: dec!(0.025),
            reputation_weight: dec!(0.01),
            reputation_cap: dec!(50),
            min_probability: dec!(0.05),
            max_probability: dec!(0.95),
            surprise_threshold: 0.70,
            lock_timeout_ms: 2000,
            max_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - STARTING_BALANCE (default: 1000)
    /// - HOUSE_FEE (default: 0.025)
    /// - REPUTATION_WEIGHT (default: 0.01)
    /// - REPUTATION_CAP (default: 50)
    /// - MIN_PROBABILITY / MAX_PROBABILITY (default: 0.05 / 0.95)
    /// - SURPRISE_THRESHOLD (default: 0.70)
    /// - LOCK_TIMEOUT_MS (default: 2000)
    /// - MAX_RETRIES (default: 3)
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load configuration from environment variables only (no .env file).
    /// Useful for testing.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            starting_balance: parse_var("STARTING_BALANCE", defaults.starting_balance)?,
            house_fee: parse_var("HOUSE_FEE", defaults.house_fee)?,
            reputation_weight: parse_var("REPUTATION_WEIGHT", defaults.reputation_weight)?,
            reputation_cap: parse_var("REPUTATION_CAP", defaults.reputation_cap)?,
            min_probability: parse_var("MIN_PROBABILITY", defaults.min_probability)?,
            max_probability: parse_var("MAX_PROBABILITY", defaults.max_probability)?,
            surprise_threshold: parse_var("SURPRISE_THRESHOLD", defaults.surprise_threshold)?,
            lock_timeout_ms: parse_var("LOCK_TIMEOUT_MS", defaults.lock_timeout_ms)?,
            max_retries: parse_var("MAX_RETRIES", defaults.max_retries)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.starting_balance < Decimal::ZERO {
            return Err(invalid("STARTING_BALANCE", self.starting_balance));
        }
        if self.house_fee < Decimal::ZERO || self.house_fee >= Decimal::ONE {
            return Err(invalid("HOUSE_FEE", self.house_fee));
        }
        if self.min_probability <= Decimal::ZERO
            || self.max_probability >= Decimal::ONE
            || self.min_probability > self.max_probability
        {
            return Err(invalid(
                "MIN_PROBABILITY",
                format!("{}..{}", self.min_probability, self.max_probability),
            ));
        }
        if !(0.0..=1.0).contains(&self.surprise_threshold) {
            return Err(invalid("SURPRISE_THRESHOLD", self.surprise_threshold));
        }
        Ok(())
    }
}

fn invalid(var: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    }
}

fn parse_var<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(var, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 9] = [
        "STARTING_BALANCE",
        "HOUSE_FEE",
        "REPUTATION_WEIGHT",
        "REPUTATION_CAP",
        "MIN_PROBABILITY",
        "MAX_PROBABILITY",
        "SURPRISE_THRESHOLD",
        "LOCK_TIMEOUT_MS",
        "MAX_RETRIES",
    ];

    fn clear_vars() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_config_with_defaults() {
        clear_vars();

        let config = EngineConfig::from_env_only().unwrap();

        assert_eq!(config.starting_balance, dec!(1000));
        assert_eq!(config.house_fee, dec!(0.025));
        assert_eq!(config.reputation_weight, dec!(0.01));
        assert_eq!(config.reputation_cap, dec!(50));
        assert_eq!(config.min_probability, dec!(0.05));
        assert_eq!(config.max_probability, dec!(0.95));
        assert_eq!(config.surprise_threshold, 0.70);
        assert_eq!(config.lock_timeout(), Duration::from_millis(2000));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    #[serial]
    fn test_config_overrides_from_env() {
        clear_vars();
        env::set_var("STARTING_BALANCE", "250.5");
        env::set_var("HOUSE_FEE", "0.05");
        env::set_var("MAX_RETRIES", "5");

        let config = EngineConfig::from_env_only().unwrap();

        assert_eq!(config.starting_balance, dec!(250.5));
        assert_eq!(config.house_fee, dec!(0.05));
        assert_eq!(config.max_retries, 5);

        clear_vars();
    }

    #[test]
    #[serial]
    fn test_config_rejects_unparsable_value() {
        clear_vars();
        env::set_var("HOUSE_FEE", "not_a_number");

        let result = EngineConfig::from_env_only();

        match result {
            Err(ConfigError::InvalidValue { var, value }) => {
                assert_eq!(var, "HOUSE_FEE");
                assert_eq!(value, "not_a_number");
            }
            other => panic!("Expected InvalidValue error, got {:?}", other),
        }

        clear_vars();
    }

    #[test]
    #[serial]
    fn test_config_rejects_fee_of_one_hundred_percent() {
        clear_vars();
        env::set_var("HOUSE_FEE", "1");

        assert!(EngineConfig::from_env_only().is_err());

        clear_vars();
    }
}
