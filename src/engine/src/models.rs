//! Shared data models for pools, wagers, ledger accounts and narrator reputation.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Decimal places kept for balances and payouts (micro-units).
pub const CURRENCY_DP: u32 = 6;

/// Decimal places kept for quoted odds.
pub const ODDS_DP: u32 = 4;

/// Pool lifecycle status.
///
/// Transitions are monotonic: `Open -> Closed -> Resolved` or `Open|Closed -> Voided`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Open,
    Closed,
    Resolved,
    Voided,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolStatus::Open => "open",
            PoolStatus::Closed => "closed",
            PoolStatus::Resolved => "resolved",
            PoolStatus::Voided => "voided",
        };
        f.write_str(s)
    }
}

/// Wager side. Side A backs the oracle, side B bets against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Side A: the oracle's guess proves accurate.
    OracleCorrect,
    /// Side B: the narrator outwits the oracle.
    OracleWrong,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::OracleCorrect => f.write_str("oracle_correct"),
            Side::OracleWrong => f.write_str("oracle_wrong"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WagerOutcome {
    Pending,
    Won,
    Lost,
    Refunded,
}

/// A single placed bet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wager {
    pub id: Uuid,
    pub pool_id: Uuid,
    pub player_id: String,
    pub side: Side,
    pub amount: Decimal,
    /// Odds quoted at placement; immune to later repricing.
    pub locked_odds: Decimal,
    pub potential_payout: Decimal,
    pub outcome: WagerOutcome,
    pub placed_at: DateTime<Utc>,
}

/// Per-segment wagering market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: Uuid,
    pub session_id: Uuid,
    pub segment_number: u32,
    pub ai_confidence: Decimal,
    pub narrator_reputation_snapshot: Decimal,
    pub status: PoolStatus,
    pub odds_side_a: Decimal,
    pub odds_side_b: Decimal,
    pub winning_side: Option<Side>,
    pub wagers: Vec<Wager>,
    pub total_staked_a: Decimal,
    pub total_staked_b: Decimal,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Pool {
    /// Odds currently offered to new bets on `side`.
    pub fn odds_for(&self, side: Side) -> Decimal {
        match side {
            Side::OracleCorrect => self.odds_side_a,
            Side::OracleWrong => self.odds_side_b,
        }
    }

    pub fn total_staked(&self) -> Decimal {
        self.total_staked_a + self.total_staked_b
    }

    /// Share of stake backing the oracle, or `None` before the first wager.
    pub fn implied_probability(&self) -> Option<Decimal> {
        let total = self.total_staked();
        if total > Decimal::ZERO {
            Some(self.total_staked_a / total)
        } else {
            None
        }
    }
}

/// Result of resolving a closed pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub pool_id: Uuid,
    pub winning_side: Side,
    pub wagers_won: usize,
    pub wagers_lost: usize,
    pub total_staked: Decimal,
    pub total_paid_out: Decimal,
}

impl ResolutionResult {
    /// Stakes kept minus payouts issued. Negative when the house lost the segment.
    pub fn house_net(&self) -> Decimal {
        self.total_staked - self.total_paid_out
    }
}

/// Result of voiding a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoidResult {
    pub pool_id: Uuid,
    pub wagers_refunded: usize,
    pub total_refunded: Decimal,
}

/// Player currency account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub player_id: String,
    pub balance: Decimal,
    pub total_wagered: Decimal,
    pub total_won: Decimal,
    pub total_lost: Decimal,
    pub transactions: Vec<LedgerTransaction>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Wager,
    Payout,
    Refund,
}

/// One ledger movement. `amount` is always positive; `kind` gives the direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub player_id: String,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub pool_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

/// Immutable score of one story segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentScore {
    pub accuracy: f64,
    pub unpredictability: f64,
    pub surprise_bonus: f64,
    pub twist_markers: usize,
    /// Candidate chosen as the oracle's consensus, if any were supplied.
    pub consensus: Option<String>,
}

/// Closed set of narrator achievements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Achievement {
    TripleSurprise,
    HotStreak,
    SpeedDemon,
    LiteraryGenius,
    PlotTwistMaster,
}

impl Achievement {
    pub const ALL: [Achievement; 5] = [
        Achievement::TripleSurprise,
        Achievement::HotStreak,
        Achievement::SpeedDemon,
        Achievement::LiteraryGenius,
        Achievement::PlotTwistMaster,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            Achievement::TripleSurprise => "Triple Surprise",
            Achievement::HotStreak => "Hot Streak",
            Achievement::SpeedDemon => "Speed Demon",
            Achievement::LiteraryGenius => "Literary Genius",
            Achievement::PlotTwistMaster => "Plot Twist Master",
        }
    }
}

impl fmt::Display for Achievement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Per-narrator reputation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarratorStats {
    pub narrator_id: String,
    pub total_segments: u64,
    /// Segments at or above the surprise threshold.
    pub total_surprises: u64,
    pub current_streak: u32,
    pub best_streak: u32,
    pub xp: u64,
    pub level: u32,
    pub achievements: BTreeSet<Achievement>,
    /// `None` until the first session closes.
    pub rolling_reverse_wpm: Option<f64>,
    pub total_unpredictability: f64,
    pub sessions_closed: u64,
}

impl NarratorStats {
    pub fn new(narrator_id: &str) -> Self {
        Self {
            narrator_id: narrator_id.to_string(),
            total_segments: 0,
            total_surprises: 0,
            current_streak: 0,
            best_streak: 0,
            xp: 0,
            level: 1,
            achievements: BTreeSet::new(),
            rolling_reverse_wpm: None,
            total_unpredictability: 0.0,
            sessions_closed: 0,
        }
    }

    pub fn average_unpredictability(&self) -> f64 {
        if self.total_segments == 0 {
            0.0
        } else {
            self.total_unpredictability / self.total_segments as f64
        }
    }

    pub fn reverse_wpm(&self) -> f64 {
        self.rolling_reverse_wpm.unwrap_or(0.0)
    }
}

/// One narration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySession {
    pub id: Uuid,
    pub narrator_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub segments: Vec<SegmentScore>,
    /// Largest elapsed time reported alongside a segment.
    pub reported_elapsed_minutes: f64,
}

impl StorySession {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn total_unpredictability(&self) -> f64 {
        self.segments.iter().map(|s| s.unpredictability).sum()
    }
}

/// What a single `record_segment` call changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentOutcome {
    pub xp_awarded: u64,
    pub achievements_unlocked: Vec<Achievement>,
    pub level: u32,
    pub leveled_up: bool,
}

/// What closing a session changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub narrator_id: String,
    pub segments: usize,
    pub elapsed_minutes: f64,
    pub session_reverse_wpm: f64,
    pub rolling_reverse_wpm: f64,
    pub achievements_unlocked: Vec<Achievement>,
}
