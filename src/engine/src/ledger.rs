//! Player balances and transaction history.
//!
//! Each account sits behind its own lock. Multi-account settlement locks the
//! affected accounts in player-id order, prepares every new balance, and only
//! then writes them back, so a failure leaves all accounts untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::locking::lock_timed;
use crate::models::{LedgerAccount, LedgerTransaction, TransactionKind, CURRENCY_DP};

/// One ledger effect of settling or voiding a pool.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementEntry {
    /// Winning wager: credit the payout.
    Payout { player_id: String, amount: Decimal },
    /// Losing wager: stake already debited, only statistics move.
    Loss { player_id: String, stake: Decimal },
    /// Voided wager: return the stake.
    Refund { player_id: String, amount: Decimal },
}

impl SettlementEntry {
    pub fn player_id(&self) -> &str {
        match self {
            SettlementEntry::Payout { player_id, .. }
            | SettlementEntry::Loss { player_id, .. }
            | SettlementEntry::Refund { player_id, .. } => player_id,
        }
    }
}

/// Store of player accounts.
pub struct LedgerStore {
    accounts: RwLock<HashMap<String, Arc<Mutex<LedgerAccount>>>>,
    starting_balance: Decimal,
    lock_timeout: Duration,
}

impl LedgerStore {
    pub fn new(starting_balance: Decimal, lock_timeout: Duration) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            starting_balance,
            lock_timeout,
        }
    }

    /// Rebuild a store from previously captured accounts.
    pub fn with_accounts(
        accounts: Vec<LedgerAccount>,
        starting_balance: Decimal,
        lock_timeout: Duration,
    ) -> Self {
        let map = accounts
            .into_iter()
            .map(|a| (a.player_id.clone(), Arc::new(Mutex::new(a))))
            .collect();
        Self {
            accounts: RwLock::new(map),
            starting_balance,
            lock_timeout,
        }
    }

    async fn handle(&self, player_id: &str) -> EngineResult<Arc<Mutex<LedgerAccount>>> {
        self.accounts
            .read()
            .await
            .get(player_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("player {}", player_id)))
    }

    /// Return the account handle, creating the account with the starting balance if new.
    async fn handle_or_open(&self, player_id: &str) -> EngineResult<Arc<Mutex<LedgerAccount>>> {
        if player_id.trim().is_empty() {
            return Err(EngineError::Validation("player id must not be empty".to_string()));
        }
        if let Ok(handle) = self.handle(player_id).await {
            return Ok(handle);
        }

        let mut accounts = self.accounts.write().await;
        let handle = accounts
            .entry(player_id.to_string())
            .or_insert_with(|| {
                info!(
                    "[LEDGER] Opened account {} with starting balance {}",
                    player_id, self.starting_balance
                );
                Arc::new(Mutex::new(LedgerAccount {
                    player_id: player_id.to_string(),
                    balance: self.starting_balance,
                    total_wagered: Decimal::ZERO,
                    total_won: Decimal::ZERO,
                    total_lost: Decimal::ZERO,
                    transactions: Vec::new(),
                    created_at: Utc::now(),
                }))
            })
            .clone();
        Ok(handle)
    }

    /// Open (or fetch) the account for `player_id`.
    pub async fn open_account(&self, player_id: &str) -> EngineResult<LedgerAccount> {
        let handle = self.handle_or_open(player_id).await?;
        let account = lock_timed(&handle, self.lock_timeout, "ledger account").await?;
        Ok(account.clone())
    }

    pub async fn get_account(&self, player_id: &str) -> EngineResult<LedgerAccount> {
        let handle = self.handle(player_id).await?;
        let account = lock_timed(&handle, self.lock_timeout, "ledger account").await?;
        Ok(account.clone())
    }

    pub async fn get_balance(&self, player_id: &str) -> EngineResult<Decimal> {
        Ok(self.get_account(player_id).await?.balance)
    }

    pub async fn get_transactions(&self, player_id: &str) -> EngineResult<Vec<LedgerTransaction>> {
        Ok(self.get_account(player_id).await?.transactions)
    }

    /// Atomically check and debit a wager stake. Opens the account on first use.
    pub async fn debit_wager(
        &self,
        player_id: &str,
        amount: Decimal,
        pool_id: Uuid,
    ) -> EngineResult<LedgerTransaction> {
        validate_amount(amount)?;

        let handle = self.handle_or_open(player_id).await?;
        let mut account = lock_timed(&handle, self.lock_timeout, "ledger account").await?;

        if account.balance < amount {
            warn!(
                "[LEDGER] Rejected debit of {} for {}: balance {}",
                amount, player_id, account.balance
            );
            return Err(EngineError::InsufficientFunds {
                player_id: player_id.to_string(),
                balance: account.balance,
                requested: amount,
            });
        }

        account.balance -= amount;
        account.total_wagered += amount;
        let tx = LedgerTransaction {
            id: Uuid::new_v4(),
            player_id: player_id.to_string(),
            kind: TransactionKind::Wager,
            amount,
            balance_after: account.balance,
            pool_id: Some(pool_id),
            at: Utc::now(),
        };
        account.transactions.push(tx.clone());

        debug!(
            "[LEDGER] Debited {} from {} (balance {})",
            amount, player_id, account.balance
        );
        Ok(tx)
    }

    /// Apply a batch of settlement entries for one pool, all or nothing.
    ///
    /// Accounts are locked one by one in player-id order and held until the
    /// batch commits. Returns the credit transactions written.
    pub async fn apply_settlement(
        &self,
        pool_id: Uuid,
        entries: &[SettlementEntry],
    ) -> EngineResult<Vec<LedgerTransaction>> {
        let mut by_player: BTreeMap<&str, Vec<&SettlementEntry>> = BTreeMap::new();
        for entry in entries {
            by_player.entry(entry.player_id()).or_default().push(entry);
        }

        let mut handles = Vec::with_capacity(by_player.len());
        for player_id in by_player.keys() {
            handles.push(self.handle(player_id).await?);
        }

        let mut guards = Vec::with_capacity(handles.len());
        for handle in &handles {
            guards.push(lock_timed(handle, self.lock_timeout, "ledger account").await?);
        }

        // Prepare
        let now = Utc::now();
        let mut prepared = Vec::with_capacity(guards.len());
        let mut written = Vec::new();
        for (guard, player_entries) in guards.iter().zip(by_player.values()) {
            let mut account = (**guard).clone();
            for entry in player_entries {
                if let Some(tx) = apply_entry(&mut account, entry, pool_id, now)? {
                    written.push(tx);
                }
            }
            prepared.push(account);
        }

        // Commit
        for (guard, account) in guards.iter_mut().zip(prepared) {
            **guard = account;
        }

        info!(
            "[LEDGER] Settled pool {}: {} entries across {} accounts",
            pool_id,
            entries.len(),
            handles.len()
        );
        Ok(written)
    }

    /// Copy of every account, ordered by player id.
    pub async fn accounts(&self) -> Vec<LedgerAccount> {
        let handles: Vec<_> = self.accounts.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.clone());
        }
        out.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        out
    }
}

fn apply_entry(
    account: &mut LedgerAccount,
    entry: &SettlementEntry,
    pool_id: Uuid,
    at: chrono::DateTime<Utc>,
) -> EngineResult<Option<LedgerTransaction>> {
    let (kind, amount) = match entry {
        SettlementEntry::Loss { stake, .. } => {
            account.total_lost = checked_add(account.total_lost, *stake)?;
            return Ok(None);
        }
        SettlementEntry::Payout { amount, .. } => {
            account.total_won = checked_add(account.total_won, *amount)?;
            (TransactionKind::Payout, *amount)
        }
        SettlementEntry::Refund { amount, .. } => {
            account.total_wagered -= *amount;
            (TransactionKind::Refund, *amount)
        }
    };

    account.balance = checked_add(account.balance, amount)?;
    let tx = LedgerTransaction {
        id: Uuid::new_v4(),
        player_id: account.player_id.clone(),
        kind,
        amount,
        balance_after: account.balance,
        pool_id: Some(pool_id),
        at,
    };
    account.transactions.push(tx.clone());
    Ok(Some(tx))
}

fn checked_add(a: Decimal, b: Decimal) -> EngineResult<Decimal> {
    a.checked_add(b)
        .ok_or_else(|| EngineError::Validation("ledger amount overflow".to_string()))
}

/// Amounts must be positive and representable in micro-units.
pub(crate) fn validate_amount(amount: Decimal) -> EngineResult<()> {
    if amount <= Decimal::ZERO {
        return Err(EngineError::Validation(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    if amount.normalize().scale() > CURRENCY_DP {
        return Err(EngineError::Validation(format!(
            "amount {} has more than {} decimal places",
            amount, CURRENCY_DP
        )));
    }
    Ok(())
}
