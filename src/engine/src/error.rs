//! Engine error taxonomy.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::models::PoolStatus;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Pool {pool_id} is {status}, cannot {operation}")]
    PoolState {
        pool_id: Uuid,
        status: PoolStatus,
        operation: &'static str,
    },

    #[error("Insufficient funds for {player_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        player_id: String,
        balance: Decimal,
        requested: Decimal,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Snapshot persistence failed: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Whether a bounded internal retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        EngineError::Persistence(value.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        EngineError::Persistence(value.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
