//! Scoring, reputation and wagering engine for collaborative storytelling.
//!
//! Provides:
//! - Configuration loading from .env
//! - Segment scoring against oracle predictions
//! - Narrator XP, levels, streaks and achievements
//! - Fixed-odds betting pools settled against a player ledger
//! - JSON snapshots of the whole engine state

pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
mod locking;
pub mod market;
pub mod models;
pub mod reputation;
pub mod scorer;
pub mod snapshot;

pub use config::{ConfigError, EngineConfig};
pub use engine::{SegmentSettlement, StoryEngine};
pub use error::{EngineError, EngineResult};
pub use ledger::{LedgerStore, SettlementEntry};
pub use market::{BettingMarket, OddsPricer, Quote};
pub use models::{
    Achievement, LedgerAccount, LedgerTransaction, NarratorStats, Pool, PoolStatus,
    ResolutionResult, SegmentOutcome, SegmentScore, SessionSummary, Side, StorySession,
    TransactionKind, VoidResult, Wager, WagerOutcome,
};
pub use reputation::ReputationTracker;
pub use scorer::Prediction;
pub use snapshot::{EngineSnapshot, JsonFileSnapshotStore, SnapshotStore};
