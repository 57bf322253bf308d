//! Boundary API tying the ledger, market, scorer and reputation tracker together.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::LedgerStore;
use crate::locking::with_retry;
use crate::market::{copy_pools, BettingMarket};
use crate::models::{
    LedgerAccount, LedgerTransaction, NarratorStats, Pool, PoolStatus, ResolutionResult,
    SegmentOutcome, SegmentScore, SessionSummary, Side, StorySession, VoidResult, Wager,
};
use crate::reputation::ReputationTracker;
use crate::scorer::{self, Prediction};
use crate::snapshot::{EngineSnapshot, SnapshotStore};

/// Everything one revealed segment changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSettlement {
    pub score: SegmentScore,
    pub resolution: ResolutionResult,
    pub narrator: SegmentOutcome,
}

/// Scoring, reputation and wagering engine.
pub struct StoryEngine {
    config: EngineConfig,
    ledger: Arc<LedgerStore>,
    market: BettingMarket,
    reputation: ReputationTracker,
}

impl StoryEngine {
    /// Create an engine with empty stores.
    pub fn new(config: EngineConfig) -> Self {
        let ledger = Arc::new(LedgerStore::new(config.starting_balance, config.lock_timeout()));
        let market = BettingMarket::new(&config, ledger.clone());
        let reputation = ReputationTracker::new(config.surprise_threshold, config.lock_timeout());
        Self {
            config,
            ledger,
            market,
            reputation,
        }
    }

    /// Create an engine from the latest snapshot in `store`, or empty if it has none.
    pub async fn load_from(config: EngineConfig, store: &dyn SnapshotStore) -> EngineResult<Self> {
        match store.load().await? {
            Some(snapshot) => Ok(Self::restore(config, snapshot)),
            None => {
                info!("[ENGINE] No snapshot found, starting empty");
                Ok(Self::new(config))
            }
        }
    }

    /// Create an engine whose stores start from `snapshot`.
    pub fn restore(config: EngineConfig, snapshot: EngineSnapshot) -> Self {
        info!(
            "[ENGINE] Restoring snapshot from {} ({} accounts, {} narrators, {} pools)",
            snapshot.taken_at,
            snapshot.accounts.len(),
            snapshot.narrators.len(),
            snapshot.pools.len()
        );
        let ledger = Arc::new(LedgerStore::with_accounts(
            snapshot.accounts,
            config.starting_balance,
            config.lock_timeout(),
        ));
        let market = BettingMarket::with_pools(&config, ledger.clone(), snapshot.pools);
        let reputation = ReputationTracker::with_state(
            snapshot.narrators,
            snapshot.sessions,
            config.surprise_threshold,
            config.lock_timeout(),
        );
        Self {
            config,
            ledger,
            market,
            reputation,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ============ Market ============

    pub async fn create_pool(
        &self,
        session_id: Uuid,
        segment_number: u32,
        ai_confidence: Decimal,
        narrator_reputation: Decimal,
    ) -> EngineResult<Pool> {
        self.market
            .create_pool(session_id, segment_number, ai_confidence, narrator_reputation)
            .await
    }

    /// Open a pool for the session's next segment, priced from the narrator's current reputation.
    pub async fn create_pool_for_session(
        &self,
        session_id: Uuid,
        segment_number: u32,
        ai_confidence: Decimal,
    ) -> EngineResult<Pool> {
        let session = self.reputation.get_session(session_id).await?;
        if !session.is_active() {
            return Err(EngineError::Validation(format!(
                "session {} is closed",
                session_id
            )));
        }
        let reputation = self.reputation.narrator_reputation(&session.narrator_id).await;
        self.market
            .create_pool(session_id, segment_number, ai_confidence, reputation)
            .await
    }

    pub async fn reprice_pool(
        &self,
        pool_id: Uuid,
        ai_confidence: Decimal,
        narrator_reputation: Decimal,
    ) -> EngineResult<Pool> {
        self.market
            .reprice_pool(pool_id, ai_confidence, narrator_reputation)
            .await
    }

    pub async fn place_bet(
        &self,
        pool_id: Uuid,
        player_id: &str,
        side: Side,
        amount: Decimal,
    ) -> EngineResult<Wager> {
        self.market.place_bet(pool_id, player_id, side, amount).await
    }

    pub async fn close_betting(&self, pool_id: Uuid) -> EngineResult<Pool> {
        self.market.close_betting(pool_id).await
    }

    pub async fn resolve_bets(
        &self,
        pool_id: Uuid,
        actual_unpredictability: f64,
    ) -> EngineResult<ResolutionResult> {
        self.market.resolve_bets(pool_id, actual_unpredictability).await
    }

    pub async fn void_pool(&self, pool_id: Uuid) -> EngineResult<VoidResult> {
        self.market.void_pool(pool_id).await
    }

    pub async fn get_pool(&self, pool_id: Uuid) -> EngineResult<Pool> {
        self.market.get_pool(pool_id).await
    }

    // ============ Ledger ============

    pub async fn open_account(&self, player_id: &str) -> EngineResult<LedgerAccount> {
        self.ledger.open_account(player_id).await
    }

    pub async fn get_balance(&self, player_id: &str) -> EngineResult<Decimal> {
        self.ledger.get_balance(player_id).await
    }

    pub async fn get_account(&self, player_id: &str) -> EngineResult<LedgerAccount> {
        self.ledger.get_account(player_id).await
    }

    pub async fn get_transactions(&self, player_id: &str) -> EngineResult<Vec<LedgerTransaction>> {
        self.ledger.get_transactions(player_id).await
    }

    // ============ Reputation ============

    pub async fn start_session(
        &self,
        narrator_id: &str,
        started_at: DateTime<Utc>,
    ) -> EngineResult<StorySession> {
        self.reputation.start_session(narrator_id, started_at).await
    }

    pub async fn close_session(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
    ) -> EngineResult<SessionSummary> {
        with_retry(self.config.max_retries, "close session", move || {
            self.reputation.close_session(session_id, ended_at)
        })
        .await
    }

    pub async fn get_session(&self, session_id: Uuid) -> EngineResult<StorySession> {
        self.reputation.get_session(session_id).await
    }

    pub async fn record_segment(
        &self,
        narrator_id: &str,
        score: &SegmentScore,
        session_elapsed_minutes: f64,
    ) -> EngineResult<SegmentOutcome> {
        with_retry(self.config.max_retries, "record segment", move || {
            self.reputation
                .record_segment(narrator_id, score, session_elapsed_minutes)
        })
        .await
    }

    pub async fn get_narrator_stats(&self, narrator_id: &str) -> EngineResult<NarratorStats> {
        self.reputation.get_narrator_stats(narrator_id).await
    }

    pub async fn narrator_reputation(&self, narrator_id: &str) -> Decimal {
        self.reputation.narrator_reputation(narrator_id).await
    }

    pub async fn leaderboard(&self, limit: usize) -> Vec<NarratorStats> {
        self.reputation.leaderboard(limit).await
    }

    // ============ Segment flow ============

    /// Score a revealed segment. Pure; touches no store.
    pub fn score_segment(
        &self,
        predictions: &[Prediction],
        actual_text: &str,
    ) -> EngineResult<SegmentScore> {
        scorer::score(predictions, actual_text)
    }

    /// Score the revealed text, close and resolve the segment's pool, and credit the narrator.
    ///
    /// Scoring happens before any lock is taken. A pool that is already closed
    /// is resolved as is. The narrator's session and stats are locked before the
    /// pool resolves, so a resolved pool always has its segment recorded.
    pub async fn settle_segment(
        &self,
        pool_id: Uuid,
        narrator_id: &str,
        predictions: &[Prediction],
        actual_text: &str,
        session_elapsed_minutes: f64,
    ) -> EngineResult<SegmentSettlement> {
        if narrator_id.trim().is_empty() {
            return Err(EngineError::Validation("narrator id must not be empty".to_string()));
        }
        if !session_elapsed_minutes.is_finite() || session_elapsed_minutes < 0.0 {
            return Err(EngineError::Validation(format!(
                "elapsed minutes {} must be non-negative",
                session_elapsed_minutes
            )));
        }
        let score = scorer::score(predictions, actual_text)?;

        match self.market.close_betting(pool_id).await {
            Ok(_) => {}
            Err(EngineError::PoolState {
                status: PoolStatus::Closed,
                ..
            }) => {}
            Err(e) => return Err(e),
        }
        let score_ref = &score;
        let pending = with_retry(self.config.max_retries, "lock narrator", move || {
            self.reputation
                .prepare_segment(narrator_id, score_ref, session_elapsed_minutes)
        })
        .await?;
        let resolution = self
            .market
            .resolve_bets(pool_id, score.unpredictability)
            .await?;
        let narrator = pending.commit();

        info!(
            "[ENGINE] Segment settled for {}: unpredictability {:.3}, {} wins, +{} xp",
            narrator_id, score.unpredictability, resolution.winning_side, narrator.xp_awarded
        );
        Ok(SegmentSettlement {
            score,
            resolution,
            narrator,
        })
    }

    // ============ Persistence ============

    /// Copy of all engine state.
    ///
    /// Every pool stays locked while accounts are copied, so each stake and
    /// payout in the captured pools is reflected in the captured balances.
    /// Narrators and sessions are copied first, outside the pool locks.
    pub async fn snapshot(&self) -> EngineSnapshot {
        let narrators = self.reputation.narrators().await;
        let sessions = self.reputation.sessions().await;
        let pools = self.market.lock_all().await;
        let accounts = self.ledger.accounts().await;
        EngineSnapshot {
            taken_at: Utc::now(),
            accounts,
            narrators,
            sessions,
            pools: copy_pools(&pools),
        }
    }

    pub async fn save_to(&self, store: &dyn SnapshotStore) -> EngineResult<()> {
        store.save(&self.snapshot().await).await
    }
}
