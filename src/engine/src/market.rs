//! Betting market: pool lifecycle, fixed-odds pricing, wager placement and settlement.
//!
//! Every pool sits behind its own lock, held from the status check through the
//! state change. Ledger accounts are only ever locked while a pool lock is held,
//! never the other way round.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{validate_amount, LedgerStore, SettlementEntry};
use crate::locking::{lock_timed, with_retry};
use crate::models::{
    Pool, PoolStatus, ResolutionResult, Side, VoidResult, Wager, WagerOutcome, CURRENCY_DP,
    ODDS_DP,
};

/// Odds offered on both sides of a pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    /// Probability that the oracle proves correct, after clamping.
    pub probability: Decimal,
    pub odds_side_a: Decimal,
    pub odds_side_b: Decimal,
}

/// Prices pools from oracle confidence and narrator reputation.
#[derive(Debug, Clone)]
pub struct OddsPricer {
    house_fee: Decimal,
    reputation_weight: Decimal,
    reputation_cap: Decimal,
    min_probability: Decimal,
    max_probability: Decimal,
}

impl OddsPricer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            house_fee: config.house_fee,
            reputation_weight: config.reputation_weight,
            reputation_cap: config.reputation_cap,
            min_probability: config.min_probability,
            max_probability: config.max_probability,
        }
    }

    /// Probability the oracle is right.
    ///
    /// A well-reputed narrator lowers it; reputation past the cap has no further effect.
    pub fn probability(&self, ai_confidence: Decimal, narrator_reputation: Decimal) -> Decimal {
        let confidence = self.clamp(ai_confidence);
        let reputation = narrator_reputation.min(self.reputation_cap);
        self.clamp(confidence - self.reputation_weight * reputation)
    }

    /// Fee-adjusted odds: `(1 / p) * (1 - fee)` and `(1 / (1 - p)) * (1 - fee)`.
    pub fn quote(&self, ai_confidence: Decimal, narrator_reputation: Decimal) -> Quote {
        let p = self.probability(ai_confidence, narrator_reputation);
        let keep = Decimal::ONE - self.house_fee;
        Quote {
            probability: p,
            odds_side_a: (Decimal::ONE / p * keep).round_dp(ODDS_DP),
            odds_side_b: (Decimal::ONE / (Decimal::ONE - p) * keep).round_dp(ODDS_DP),
        }
    }

    /// Clamp a probability into the configured bounds.
    pub fn clamp(&self, p: Decimal) -> Decimal {
        p.max(self.min_probability).min(self.max_probability)
    }
}

/// Payout for a stake at locked odds, truncated to micro-units.
pub fn payout_for(amount: Decimal, locked_odds: Decimal) -> Decimal {
    (amount * locked_odds).round_dp_with_strategy(CURRENCY_DP, RoundingStrategy::ToZero)
}

/// Side that wins for a revealed segment's unpredictability.
pub fn winning_side(actual_unpredictability: f64, surprise_threshold: f64) -> Side {
    if actual_unpredictability >= surprise_threshold {
        Side::OracleWrong
    } else {
        Side::OracleCorrect
    }
}

/// Pool store and lifecycle operations.
pub struct BettingMarket {
    pools: RwLock<HashMap<Uuid, Arc<Mutex<Pool>>>>,
    ledger: Arc<LedgerStore>,
    pricer: OddsPricer,
    surprise_threshold: f64,
    lock_timeout: Duration,
    max_retries: u32,
}

impl BettingMarket {
    pub fn new(config: &EngineConfig, ledger: Arc<LedgerStore>) -> Self {
        Self::with_pools(config, ledger, Vec::new())
    }

    /// Rebuild a market from previously captured pools.
    pub fn with_pools(config: &EngineConfig, ledger: Arc<LedgerStore>, pools: Vec<Pool>) -> Self {
        let pools = pools
            .into_iter()
            .map(|p| (p.id, Arc::new(Mutex::new(p))))
            .collect();
        Self {
            pools: RwLock::new(pools),
            ledger,
            pricer: OddsPricer::new(config),
            surprise_threshold: config.surprise_threshold,
            lock_timeout: config.lock_timeout(),
            max_retries: config.max_retries,
        }
    }

    /// Open a pool for one story segment with odds seeded from the oracle and narrator.
    pub async fn create_pool(
        &self,
        session_id: Uuid,
        segment_number: u32,
        ai_confidence: Decimal,
        narrator_reputation: Decimal,
    ) -> EngineResult<Pool> {
        validate_reputation(narrator_reputation)?;
        let quote = self.pricer.quote(ai_confidence, narrator_reputation);

        let pool = Pool {
            id: Uuid::new_v4(),
            session_id,
            segment_number,
            ai_confidence: self.pricer.clamp(ai_confidence),
            narrator_reputation_snapshot: narrator_reputation,
            status: PoolStatus::Open,
            odds_side_a: quote.odds_side_a,
            odds_side_b: quote.odds_side_b,
            winning_side: None,
            wagers: Vec::new(),
            total_staked_a: Decimal::ZERO,
            total_staked_b: Decimal::ZERO,
            created_at: Utc::now(),
            closed_at: None,
            settled_at: None,
        };
        self.pools
            .write()
            .await
            .insert(pool.id, Arc::new(Mutex::new(pool.clone())));

        info!(
            "[MARKET] Pool {} opened for segment {} | p={} | A {} | B {}",
            pool.id, segment_number, quote.probability, pool.odds_side_a, pool.odds_side_b
        );
        Ok(pool)
    }

    /// Re-quote an open pool. Only bets placed afterwards see the new odds.
    pub async fn reprice_pool(
        &self,
        pool_id: Uuid,
        ai_confidence: Decimal,
        narrator_reputation: Decimal,
    ) -> EngineResult<Pool> {
        validate_reputation(narrator_reputation)?;
        with_retry(self.max_retries, "reprice pool", move || {
            self.reprice_once(pool_id, ai_confidence, narrator_reputation)
        })
        .await
    }

    async fn reprice_once(
        &self,
        pool_id: Uuid,
        ai_confidence: Decimal,
        narrator_reputation: Decimal,
    ) -> EngineResult<Pool> {
        let handle = self.handle(pool_id).await?;
        let mut pool = lock_timed(&handle, self.lock_timeout, "pool").await?;
        require_status(&pool, &[PoolStatus::Open], "reprice")?;

        let quote = self.pricer.quote(ai_confidence, narrator_reputation);
        pool.ai_confidence = self.pricer.clamp(ai_confidence);
        pool.narrator_reputation_snapshot = narrator_reputation;
        pool.odds_side_a = quote.odds_side_a;
        pool.odds_side_b = quote.odds_side_b;

        info!(
            "[MARKET] Pool {} repriced | A {} | B {}",
            pool_id, pool.odds_side_a, pool.odds_side_b
        );
        Ok(pool.clone())
    }

    /// Stake `amount` on `side`, debiting the player and locking in the current odds.
    pub async fn place_bet(
        &self,
        pool_id: Uuid,
        player_id: &str,
        side: Side,
        amount: Decimal,
    ) -> EngineResult<Wager> {
        with_retry(self.max_retries, "place bet", move || {
            self.place_bet_once(pool_id, player_id, side, amount)
        })
        .await
    }

    async fn place_bet_once(
        &self,
        pool_id: Uuid,
        player_id: &str,
        side: Side,
        amount: Decimal,
    ) -> EngineResult<Wager> {
        let handle = self.handle(pool_id).await?;
        let mut pool = lock_timed(&handle, self.lock_timeout, "pool").await?;
        require_status(&pool, &[PoolStatus::Open], "place bet")?;
        validate_amount(amount)?;

        let locked_odds = pool.odds_for(side);
        self.ledger.debit_wager(player_id, amount, pool_id).await?;

        let wager = Wager {
            id: Uuid::new_v4(),
            pool_id,
            player_id: player_id.to_string(),
            side,
            amount,
            locked_odds,
            potential_payout: payout_for(amount, locked_odds),
            outcome: WagerOutcome::Pending,
            placed_at: Utc::now(),
        };
        match side {
            Side::OracleCorrect => pool.total_staked_a += amount,
            Side::OracleWrong => pool.total_staked_b += amount,
        }
        pool.wagers.push(wager.clone());

        debug!(
            "[MARKET] {} staked {} on {} @ {} in pool {}",
            player_id, amount, side, locked_odds, pool_id
        );
        Ok(wager)
    }

    /// Stop accepting bets: `open -> closed`.
    pub async fn close_betting(&self, pool_id: Uuid) -> EngineResult<Pool> {
        with_retry(self.max_retries, "close betting", move || {
            self.close_once(pool_id)
        })
        .await
    }

    async fn close_once(&self, pool_id: Uuid) -> EngineResult<Pool> {
        let handle = self.handle(pool_id).await?;
        let mut pool = lock_timed(&handle, self.lock_timeout, "pool").await?;
        require_status(&pool, &[PoolStatus::Open], "close betting")?;

        pool.status = PoolStatus::Closed;
        pool.closed_at = Some(Utc::now());

        info!(
            "[MARKET] Pool {} closed with {} wagers ({} staked)",
            pool_id,
            pool.wagers.len(),
            pool.total_staked()
        );
        Ok(pool.clone())
    }

    /// Settle a closed pool against the revealed segment's unpredictability.
    ///
    /// Winners are credited their locked payout; the whole settlement commits
    /// or none of it does.
    pub async fn resolve_bets(
        &self,
        pool_id: Uuid,
        actual_unpredictability: f64,
    ) -> EngineResult<ResolutionResult> {
        if !actual_unpredictability.is_finite() || !(0.0..=1.0).contains(&actual_unpredictability)
        {
            return Err(EngineError::Validation(format!(
                "unpredictability {} outside [0, 1]",
                actual_unpredictability
            )));
        }
        with_retry(self.max_retries, "resolve bets", move || {
            self.resolve_once(pool_id, actual_unpredictability)
        })
        .await
    }

    async fn resolve_once(
        &self,
        pool_id: Uuid,
        actual_unpredictability: f64,
    ) -> EngineResult<ResolutionResult> {
        let handle = self.handle(pool_id).await?;
        let mut pool = lock_timed(&handle, self.lock_timeout, "pool").await?;
        require_status(&pool, &[PoolStatus::Closed], "resolve bets")?;

        let winner = winning_side(actual_unpredictability, self.surprise_threshold);
        let entries: Vec<SettlementEntry> = pool
            .wagers
            .iter()
            .map(|w| {
                if w.side == winner {
                    SettlementEntry::Payout {
                        player_id: w.player_id.clone(),
                        amount: w.potential_payout,
                    }
                } else {
                    SettlementEntry::Loss {
                        player_id: w.player_id.clone(),
                        stake: w.amount,
                    }
                }
            })
            .collect();

        self.ledger.apply_settlement(pool_id, &entries).await?;

        let mut result = ResolutionResult {
            pool_id,
            winning_side: winner,
            wagers_won: 0,
            wagers_lost: 0,
            total_staked: pool.total_staked(),
            total_paid_out: Decimal::ZERO,
        };
        for wager in pool.wagers.iter_mut() {
            if wager.side == winner {
                wager.outcome = WagerOutcome::Won;
                result.wagers_won += 1;
                result.total_paid_out += wager.potential_payout;
            } else {
                wager.outcome = WagerOutcome::Lost;
                result.wagers_lost += 1;
            }
        }
        pool.status = PoolStatus::Resolved;
        pool.winning_side = Some(winner);
        pool.settled_at = Some(Utc::now());

        info!(
            "[MARKET] Pool {} resolved: {} wins | {} won, {} lost | paid {} of {} staked",
            pool_id,
            winner,
            result.wagers_won,
            result.wagers_lost,
            result.total_paid_out,
            result.total_staked
        );
        Ok(result)
    }

    /// Cancel a pool before resolution and refund every stake.
    pub async fn void_pool(&self, pool_id: Uuid) -> EngineResult<VoidResult> {
        with_retry(self.max_retries, "void pool", move || self.void_once(pool_id)).await
    }

    async fn void_once(&self, pool_id: Uuid) -> EngineResult<VoidResult> {
        let handle = self.handle(pool_id).await?;
        let mut pool = lock_timed(&handle, self.lock_timeout, "pool").await?;
        require_status(&pool, &[PoolStatus::Open, PoolStatus::Closed], "void pool")?;

        let entries: Vec<SettlementEntry> = pool
            .wagers
            .iter()
            .map(|w| SettlementEntry::Refund {
                player_id: w.player_id.clone(),
                amount: w.amount,
            })
            .collect();

        self.ledger.apply_settlement(pool_id, &entries).await?;

        for wager in pool.wagers.iter_mut() {
            wager.outcome = WagerOutcome::Refunded;
        }
        pool.status = PoolStatus::Voided;
        pool.settled_at = Some(Utc::now());

        let result = VoidResult {
            pool_id,
            wagers_refunded: pool.wagers.len(),
            total_refunded: pool.total_staked(),
        };
        warn!(
            "[MARKET] Pool {} voided: refunded {} across {} wagers",
            pool_id, result.total_refunded, result.wagers_refunded
        );
        Ok(result)
    }

    pub async fn get_pool(&self, pool_id: Uuid) -> EngineResult<Pool> {
        let handle = self.handle(pool_id).await?;
        let pool = lock_timed(&handle, self.lock_timeout, "pool").await?;
        Ok(pool.clone())
    }

    /// Lock every pool in id order and hold the guards.
    ///
    /// No bet, resolution or void can touch the ledger while the guards live.
    pub(crate) async fn lock_all(&self) -> Vec<OwnedMutexGuard<Pool>> {
        let mut handles: Vec<(Uuid, Arc<Mutex<Pool>>)> = self
            .pools
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(handles.len());
        for (_, handle) in handles {
            guards.push(handle.lock_owned().await);
        }
        guards
    }

    async fn handle(&self, pool_id: Uuid) -> EngineResult<Arc<Mutex<Pool>>> {
        self.pools
            .read()
            .await
            .get(&pool_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("pool {}", pool_id)))
    }
}

/// Clone locked pools, oldest first.
pub(crate) fn copy_pools(guards: &[OwnedMutexGuard<Pool>]) -> Vec<Pool> {
    let mut out: Vec<Pool> = guards.iter().map(|g| (**g).clone()).collect();
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    out
}

fn require_status(
    pool: &Pool,
    allowed: &[PoolStatus],
    operation: &'static str,
) -> EngineResult<()> {
    if allowed.contains(&pool.status) {
        return Ok(());
    }
    warn!(
        "[MARKET] Rejected {} on pool {}: status {}",
        operation, pool.id, pool.status
    );
    Err(EngineError::PoolState {
        pool_id: pool.id,
        status: pool.status,
        operation,
    })
}

fn validate_reputation(narrator_reputation: Decimal) -> EngineResult<()> {
    if narrator_reputation < Decimal::ZERO {
        return Err(EngineError::Validation(format!(
            "narrator reputation {} must be non-negative",
            narrator_reputation
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_market() -> (BettingMarket, Arc<LedgerStore>) {
        let config = EngineConfig {
            starting_balance: dec!(100),
            lock_timeout_ms: 200,
            ..EngineConfig::default()
        };
        let ledger = Arc::new(LedgerStore::new(config.starting_balance, config.lock_timeout()));
        (BettingMarket::new(&config, ledger.clone()), ledger)
    }

    fn pricer() -> OddsPricer {
        OddsPricer::new(&EngineConfig::default())
    }

    // ============ OddsPricer TESTS ============

    #[test]
    fn test_quote_matches_formula() {
        let quote = pricer().quote(dec!(0.79), dec!(25.5));

        // p = 0.79 - 0.01 * 25.5
        assert_eq!(quote.probability, dec!(0.535));
        let keep = dec!(0.975);
        assert_eq!(quote.odds_side_a, (Decimal::ONE / dec!(0.535) * keep).round_dp(4));
        assert_eq!(quote.odds_side_b, (Decimal::ONE / dec!(0.465) * keep).round_dp(4));
        assert_eq!(quote.odds_side_a, dec!(1.8224));
        assert_eq!(quote.odds_side_b, dec!(2.0968));
    }

    #[test]
    fn test_reputation_beyond_cap_has_no_effect() {
        let p = pricer();
        assert_eq!(p.probability(dec!(0.9), dec!(50)), dec!(0.4));
        assert_eq!(p.probability(dec!(0.9), dec!(500)), dec!(0.4));
    }

    #[test]
    fn test_probability_clamped_both_ends() {
        let p = pricer();
        assert_eq!(p.probability(dec!(1.5), dec!(0)), dec!(0.95));
        assert_eq!(p.probability(dec!(0.01), dec!(0)), dec!(0.05));
        // 0.1 - 0.5 would go negative
        assert_eq!(p.probability(dec!(0.1), dec!(50)), dec!(0.05));
    }

    #[test]
    fn test_even_odds_at_half() {
        let quote = pricer().quote(dec!(0.5), dec!(0));
        assert_eq!(quote.odds_side_a, dec!(1.95));
        assert_eq!(quote.odds_side_b, dec!(1.95));
    }

    #[test]
    fn test_payout_truncates_to_micro_units() {
        assert_eq!(payout_for(dec!(10), dec!(1.8224)), dec!(18.224));
        assert_eq!(payout_for(dec!(0.333333), dec!(1.9999)), dec!(0.666632));
    }

    #[test]
    fn test_winning_side_threshold_inclusive() {
        assert_eq!(winning_side(0.70, 0.70), Side::OracleWrong);
        assert_eq!(winning_side(0.699, 0.70), Side::OracleCorrect);
    }

    // ============ Lifecycle TESTS ============

    #[tokio::test]
    async fn test_create_pool_is_open_with_snapshot() {
        let (market, _) = make_market();
        let session_id = Uuid::new_v4();

        let pool = market.create_pool(session_id, 3, dec!(0.79), dec!(25.5)).await.unwrap();

        assert_eq!(pool.status, PoolStatus::Open);
        assert_eq!(pool.session_id, session_id);
        assert_eq!(pool.segment_number, 3);
        assert_eq!(pool.narrator_reputation_snapshot, dec!(25.5));
        assert_eq!(pool.winning_side, None);
        assert_eq!(market.get_pool(pool.id).await.unwrap(), pool);
    }

    #[tokio::test]
    async fn test_pool_records_clamped_confidence() {
        let (market, _) = make_market();

        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(1.2), dec!(0)).await.unwrap();
        assert_eq!(pool.ai_confidence, dec!(0.95));
        assert_eq!(pool.odds_side_a, pricer().quote(dec!(0.95), dec!(0)).odds_side_a);

        let repriced = market.reprice_pool(pool.id, dec!(0.01), dec!(0)).await.unwrap();
        assert_eq!(repriced.ai_confidence, dec!(0.05));
    }

    #[tokio::test]
    async fn test_negative_reputation_rejected() {
        let (market, _) = make_market();
        let result = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(-1)).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_pool_not_found() {
        let (market, _) = make_market();
        let id = Uuid::new_v4();
        assert!(matches!(market.get_pool(id).await, Err(EngineError::NotFound(_))));
        assert!(matches!(
            market.place_bet(id, "alice", Side::OracleWrong, dec!(1)).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(market.close_betting(id).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_place_bet_locks_odds_and_debits() {
        let (market, ledger) = make_market();
        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(0.79), dec!(25.5)).await.unwrap();

        let wager = market
            .place_bet(pool.id, "alice", Side::OracleCorrect, dec!(10))
            .await
            .unwrap();

        assert_eq!(wager.locked_odds, dec!(1.8224));
        assert_eq!(wager.potential_payout, dec!(18.224));
        assert_eq!(wager.outcome, WagerOutcome::Pending);
        assert_eq!(ledger.get_balance("alice").await.unwrap(), dec!(90));
        let stored = market.get_pool(pool.id).await.unwrap();
        assert_eq!(stored.total_staked_a, dec!(10));
        assert_eq!(stored.wagers.len(), 1);
    }

    #[tokio::test]
    async fn test_place_bet_rejects_non_positive_amounts() {
        let (market, ledger) = make_market();
        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0)).await.unwrap();

        for amount in [dec!(0), dec!(-3)] {
            let result = market.place_bet(pool.id, "alice", Side::OracleWrong, amount).await;
            assert!(matches!(result, Err(EngineError::Validation(_))));
        }
        assert!(market.get_pool(pool.id).await.unwrap().wagers.is_empty());
        assert!(matches!(ledger.get_balance("alice").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_pool_untouched() {
        let (market, ledger) = make_market();
        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0)).await.unwrap();

        let result = market.place_bet(pool.id, "alice", Side::OracleWrong, dec!(100.5)).await;

        assert!(matches!(result, Err(EngineError::InsufficientFunds { .. })));
        assert!(market.get_pool(pool.id).await.unwrap().wagers.is_empty());
        assert_eq!(ledger.get_balance("alice").await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn test_repricing_only_affects_later_bets() {
        let (market, _) = make_market();
        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0)).await.unwrap();
        let early = market.place_bet(pool.id, "alice", Side::OracleWrong, dec!(10)).await.unwrap();

        let repriced = market.reprice_pool(pool.id, dec!(0.8), dec!(0)).await.unwrap();
        let late = market.place_bet(pool.id, "bob", Side::OracleWrong, dec!(10)).await.unwrap();

        assert_eq!(early.locked_odds, dec!(1.95));
        assert_eq!(late.locked_odds, repriced.odds_side_b);
        assert_ne!(early.locked_odds, late.locked_odds);
        let stored = market.get_pool(pool.id).await.unwrap();
        assert_eq!(stored.wagers[0].locked_odds, dec!(1.95));
    }

    #[tokio::test]
    async fn test_bets_rejected_after_close() {
        let (market, _) = make_market();
        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0)).await.unwrap();
        market.close_betting(pool.id).await.unwrap();

        let result = market.place_bet(pool.id, "alice", Side::OracleWrong, dec!(5)).await;

        assert!(matches!(
            result,
            Err(EngineError::PoolState { status: PoolStatus::Closed, .. })
        ));
        assert!(matches!(
            market.reprice_pool(pool.id, dec!(0.5), dec!(0)).await,
            Err(EngineError::PoolState { .. })
        ));
    }

    #[tokio::test]
    async fn test_double_close_rejected() {
        let (market, _) = make_market();
        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0)).await.unwrap();
        market.close_betting(pool.id).await.unwrap();

        assert!(matches!(
            market.close_betting(pool.id).await,
            Err(EngineError::PoolState { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_requires_closed_pool() {
        let (market, _) = make_market();
        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0)).await.unwrap();

        let result = market.resolve_bets(pool.id, 0.9).await;

        assert!(matches!(
            result,
            Err(EngineError::PoolState { status: PoolStatus::Open, .. })
        ));
    }

    #[tokio::test]
    async fn test_resolution_pays_winners_once() {
        let (market, ledger) = make_market();
        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0)).await.unwrap();
        market.place_bet(pool.id, "alice", Side::OracleWrong, dec!(10)).await.unwrap();
        market.place_bet(pool.id, "bob", Side::OracleCorrect, dec!(20)).await.unwrap();
        market.place_bet(pool.id, "alice", Side::OracleWrong, dec!(4)).await.unwrap();
        market.close_betting(pool.id).await.unwrap();

        let result = market.resolve_bets(pool.id, 0.85).await.unwrap();

        assert_eq!(result.winning_side, Side::OracleWrong);
        assert_eq!(result.wagers_won, 2);
        assert_eq!(result.wagers_lost, 1);
        // (10 + 4) * 1.95
        assert_eq!(result.total_paid_out, dec!(27.3));
        assert_eq!(result.total_staked, dec!(34));
        assert_eq!(ledger.get_balance("alice").await.unwrap(), dec!(113.3));
        assert_eq!(ledger.get_balance("bob").await.unwrap(), dec!(80));
        assert_eq!(ledger.get_account("bob").await.unwrap().total_lost, dec!(20));

        let stored = market.get_pool(pool.id).await.unwrap();
        assert_eq!(stored.status, PoolStatus::Resolved);
        assert_eq!(stored.winning_side, Some(Side::OracleWrong));
        assert!(stored.wagers.iter().all(|w| w.outcome != WagerOutcome::Pending));

        let again = market.resolve_bets(pool.id, 0.1).await;
        assert!(matches!(again, Err(EngineError::PoolState { .. })));
        assert_eq!(ledger.get_balance("alice").await.unwrap(), dec!(113.3));
        assert_eq!(ledger.get_balance("bob").await.unwrap(), dec!(80));
    }

    #[tokio::test]
    async fn test_oracle_correct_wins_below_threshold() {
        let (market, ledger) = make_market();
        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0)).await.unwrap();
        market.place_bet(pool.id, "bob", Side::OracleCorrect, dec!(20)).await.unwrap();
        market.close_betting(pool.id).await.unwrap();

        let result = market.resolve_bets(pool.id, 0.476).await.unwrap();

        assert_eq!(result.winning_side, Side::OracleCorrect);
        assert_eq!(ledger.get_balance("bob").await.unwrap(), dec!(119));
    }

    #[tokio::test]
    async fn test_resolve_rejects_out_of_range_score() {
        let (market, _) = make_market();
        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0)).await.unwrap();
        market.close_betting(pool.id).await.unwrap();

        assert!(matches!(
            market.resolve_bets(pool.id, 1.2).await,
            Err(EngineError::Validation(_))
        ));
        assert_eq!(market.get_pool(pool.id).await.unwrap().status, PoolStatus::Closed);
    }

    #[tokio::test]
    async fn test_void_refunds_every_stake() {
        let (market, ledger) = make_market();
        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0)).await.unwrap();
        market.place_bet(pool.id, "alice", Side::OracleWrong, dec!(10)).await.unwrap();
        market.place_bet(pool.id, "bob", Side::OracleCorrect, dec!(35.5)).await.unwrap();
        market.close_betting(pool.id).await.unwrap();

        let result = market.void_pool(pool.id).await.unwrap();

        assert_eq!(result.wagers_refunded, 2);
        assert_eq!(result.total_refunded, dec!(45.5));
        assert_eq!(ledger.get_balance("alice").await.unwrap(), dec!(100));
        assert_eq!(ledger.get_balance("bob").await.unwrap(), dec!(100));
        let stored = market.get_pool(pool.id).await.unwrap();
        assert_eq!(stored.status, PoolStatus::Voided);
        assert!(stored.wagers.iter().all(|w| w.outcome == WagerOutcome::Refunded));

        assert!(matches!(market.void_pool(pool.id).await, Err(EngineError::PoolState { .. })));
        assert_eq!(ledger.get_balance("alice").await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn test_void_from_open_and_not_after_resolve() {
        let (market, _) = make_market();
        let open = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0)).await.unwrap();
        assert!(market.void_pool(open.id).await.is_ok());

        let resolved = market.create_pool(Uuid::new_v4(), 2, dec!(0.5), dec!(0)).await.unwrap();
        market.close_betting(resolved.id).await.unwrap();
        market.resolve_bets(resolved.id, 0.2).await.unwrap();
        assert!(matches!(
            market.void_pool(resolved.id).await,
            Err(EngineError::PoolState { status: PoolStatus::Resolved, .. })
        ));
    }

    #[tokio::test]
    async fn test_held_pool_lock_surfaces_conflict_after_retries() {
        let config = EngineConfig {
            lock_timeout_ms: 10,
            max_retries: 2,
            ..EngineConfig::default()
        };
        let ledger = Arc::new(LedgerStore::new(config.starting_balance, config.lock_timeout()));
        let market = BettingMarket::new(&config, ledger);
        let pool = market.create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0)).await.unwrap();

        let handle = market.handle(pool.id).await.unwrap();
        let held = handle.lock().await;
        let result = market.close_betting(pool.id).await;
        drop(held);

        assert!(matches!(result, Err(EngineError::ConcurrencyConflict(_))));
        assert_eq!(market.get_pool(pool.id).await.unwrap().status, PoolStatus::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_bet_accepted_after_close_under_contention() {
        let (market, ledger) = make_market();
        let market = Arc::new(market);
        let pool_id = market
            .create_pool(Uuid::new_v4(), 1, dec!(0.5), dec!(0))
            .await
            .unwrap()
            .id;

        let mut tasks = Vec::new();
        for i in 0..40 {
            let market = market.clone();
            tasks.push(tokio::spawn(async move {
                let player = format!("p{}", i);
                market.place_bet(pool_id, &player, Side::OracleWrong, dec!(5)).await
            }));
        }
        let closed = market.close_betting(pool_id).await.unwrap();

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                accepted += 1;
            }
        }

        // Everything accepted must be inside the snapshot taken at close
        assert_eq!(closed.wagers.len(), accepted);
        let stored = market.get_pool(pool_id).await.unwrap();
        assert_eq!(stored.wagers.len(), accepted);
        let debited: Decimal = ledger
            .accounts()
            .await
            .iter()
            .map(|a| dec!(100) - a.balance)
            .sum();
        assert_eq!(debited, stored.total_staked());
    }
}
