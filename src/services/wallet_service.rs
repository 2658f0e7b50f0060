//! Wallet balances and the double-entry transfer primitive.
//!
//! Every balance change is expressed as a [`TransferBatch`]. Preparing a
//! batch takes the account locks in global order, re-reads the accounts,
//! applies the steps to working copies and turns them into ledger rows. The
//! resulting unit of work is committed in one store call while the locks are
//! still held.

use crate::error::{AppError, AppResult};
use crate::models::{
    fiscal_period_of, AccountRef, Direction, EntryStatus, LedgerEntry, LedgerTotals, OwnerType,
    SystemAccount, SystemAccountCode, TransactionLog, TransactionType, Wallet, WalletStatus,
};
use crate::repositories::{LedgerStore, SystemAccountWrite, UnitOfWork, WalletWrite};
use crate::services::audit::ledger_batch_draft;
use crate::services::locks::{LockKey, LockManager, LockSet};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

// ===== BATCH TYPES =====

/// Which bucket of a wallet a debit draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Funds {
    #[default]
    Available,
    Locked,
}

/// One double-entry movement
#[derive(Debug, Clone)]
pub struct Leg {
    pub from: AccountRef,
    pub to: AccountRef,
    pub amount: Decimal,
    pub transaction_type: TransactionType,
    pub description: Option<String>,
    pub source: Funds,
    pub status: EntryStatus,
    pub reverses_entry_id: Option<Uuid>,
}

impl Leg {
    pub fn new(
        from: AccountRef,
        to: AccountRef,
        amount: Decimal,
        transaction_type: TransactionType,
    ) -> Self {
        Self {
            from,
            to,
            amount,
            transaction_type,
            description: None,
            source: Funds::Available,
            status: EntryStatus::Completed,
            reverses_entry_id: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Debit the source wallet's locked bucket instead of its available one
    pub fn from_locked(mut self) -> Self {
        self.source = Funds::Locked;
        self
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Transfer(Leg),
    /// Move available funds into the locked bucket
    Lock { wallet_id: Uuid, amount: Decimal },
    /// Move locked funds back to available
    Unlock { wallet_id: Uuid, amount: Decimal },
}

/// Ordered steps applied as one all-or-nothing unit
#[derive(Debug, Clone)]
pub struct TransferBatch {
    /// Audit action name
    pub label: String,
    pub tenant_id: Uuid,
    pub currency: String,
    pub created_by: String,
    pub reference: String,
    pub steps: Vec<Step>,
}

impl TransferBatch {
    pub fn new(
        label: impl Into<String>,
        tenant_id: Uuid,
        currency: &str,
        created_by: &str,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            tenant_id,
            currency: currency.to_uppercase(),
            created_by: created_by.to_string(),
            reference: reference.into(),
            steps: Vec::new(),
        }
    }

    pub fn transfer(mut self, leg: Leg) -> Self {
        self.steps.push(Step::Transfer(leg));
        self
    }

    pub fn push(&mut self, leg: Leg) {
        self.steps.push(Step::Transfer(leg));
    }

    pub fn lock(mut self, wallet_id: Uuid, amount: Decimal) -> Self {
        self.steps.push(Step::Lock { wallet_id, amount });
        self
    }

    pub fn unlock(mut self, wallet_id: Uuid, amount: Decimal) -> Self {
        self.steps.push(Step::Unlock { wallet_id, amount });
        self
    }

    fn accounts(&self) -> Vec<AccountRef> {
        let mut accounts = Vec::new();
        for step in &self.steps {
            match step {
                Step::Transfer(leg) => {
                    accounts.push(leg.from);
                    accounts.push(leg.to);
                }
                Step::Lock { wallet_id, .. } | Step::Unlock { wallet_id, .. } => {
                    accounts.push(AccountRef::Wallet(*wallet_id))
                }
            }
        }
        accounts.sort();
        accounts.dedup();
        accounts
    }
}

/// A batch turned into a unit of work, with its account locks still held.
/// Callers may add their own records to `uow` before committing.
pub struct PreparedBatch {
    pub uow: UnitOfWork,
    pub entries: Vec<LedgerEntry>,
    wallets: HashMap<Uuid, Wallet>,
    _locks: LockSet,
}

impl PreparedBatch {
    pub fn entry_ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub fn wallet(&self, wallet_id: Uuid) -> Option<&Wallet> {
        self.wallets.get(&wallet_id)
    }
}

/// What a committed batch produced
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Entries with their store-assigned sequence numbers
    pub entries: Vec<LedgerEntry>,
    /// Post-commit state of every wallet the batch touched
    pub wallets: HashMap<Uuid, Wallet>,
}

impl BatchOutcome {
    pub fn wallet(&self, wallet_id: Uuid) -> Option<&Wallet> {
        self.wallets.get(&wallet_id)
    }
}

/// Counterparty and labelling for a single-wallet debit or credit
#[derive(Debug, Clone)]
pub struct Movement {
    pub counterparty: AccountRef,
    pub transaction_type: TransactionType,
    pub reference: String,
    pub created_by: String,
    pub description: Option<String>,
}

/// How `unlock_balance` disposes of the released amount
#[derive(Debug, Clone)]
pub enum LockRelease {
    /// Back into the available bucket
    ReturnToAvailable,
    /// Out of the wallet entirely, as a ledger debit from the locked bucket
    Capture {
        to: AccountRef,
        transaction_type: TransactionType,
        reference: String,
    },
}

#[derive(Debug, Clone)]
pub struct UnlockOutcome {
    pub wallet: Wallet,
    pub entry: Option<LedgerEntry>,
}

/// Stored wallet total compared with the replayed ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletReconciliation {
    pub wallet_id: Uuid,
    pub stored_total: Decimal,
    pub ledger_total: Decimal,
    pub entries: usize,
    pub matches: bool,
}

// ===== WORKING COPIES =====

enum Working {
    Wallet { wallet: Wallet, expected_version: i64 },
    System { account: SystemAccount, expected_version: i64 },
}

impl Working {
    fn total(&self) -> Decimal {
        match self {
            Working::Wallet { wallet, .. } => wallet.total_balance(),
            Working::System { account, .. } => account.balance,
        }
    }

    fn currency(&self) -> &str {
        match self {
            Working::Wallet { wallet, .. } => &wallet.currency,
            Working::System { account, .. } => &account.currency,
        }
    }
}

fn lock_key(account: AccountRef) -> LockKey {
    match account {
        AccountRef::Wallet(id) => LockKey::Wallet(id),
        AccountRef::System(id) => LockKey::System(id),
    }
}

/// Relabels a shortfall on the operator float so it never reads as the
/// payee's own insufficient balance
pub fn float_shortfall(float_id: Uuid) -> impl Fn(AppError) -> AppError {
    let float = AccountRef::Wallet(float_id).to_string();
    move |err| match err {
        AppError::InsufficientBalance {
            account,
            available,
            requested,
        } if account == float => {
            error!(%account, %available, %requested, "Operator float cannot fund payout");
            AppError::OperatorUnderfunded {
                account,
                available,
                requested,
            }
        }
        other => other,
    }
}

fn status_error(wallet: &Wallet, action: &str) -> AppError {
    AppError::Validation(format!(
        "Wallet {} is {} and cannot {}",
        wallet.id,
        wallet.status.as_str(),
        action
    ))
}

fn log_row(
    entry_id: Option<Uuid>,
    account: AccountRef,
    direction: Direction,
    transaction_type: TransactionType,
    amount: Decimal,
    before: Decimal,
    after: Decimal,
    reference: &str,
) -> TransactionLog {
    TransactionLog {
        id: Uuid::new_v4(),
        ledger_entry_id: entry_id,
        account,
        direction,
        transaction_type,
        amount,
        balance_before: before,
        balance_after: after,
        reference: reference.to_string(),
        created_at: Utc::now(),
    }
}

// ===== SERVICE =====

pub struct WalletService {
    store: Arc<dyn LedgerStore>,
    locks: Arc<LockManager>,
}

impl WalletService {
    pub fn new(store: Arc<dyn LedgerStore>, locks: Arc<LockManager>) -> Self {
        Self { store, locks }
    }

    // =========================================================================
    // Wallet lookup
    // =========================================================================

    /// Idempotent: the first call creates the wallet and its owner mapping
    pub async fn get_or_create_wallet(
        &self,
        owner_id: Uuid,
        owner_type: OwnerType,
        tenant_id: Uuid,
        currency: &str,
    ) -> AppResult<Wallet> {
        let wallet = self
            .store
            .get_or_create_wallet(owner_type, owner_id, tenant_id, currency)
            .await?;

        if !wallet.currency.eq_ignore_ascii_case(currency) {
            return Err(AppError::CurrencyMismatch {
                expected: wallet.currency,
                actual: currency.to_uppercase(),
            });
        }
        Ok(wallet)
    }

    pub async fn get_wallet(&self, wallet_id: Uuid) -> AppResult<Wallet> {
        self.store
            .get_wallet(wallet_id)
            .await?
            .ok_or_else(|| AppError::WalletNotFound(wallet_id.to_string()))
    }

    pub async fn find_wallet(&self, owner_type: OwnerType, owner_id: Uuid) -> AppResult<Option<Wallet>> {
        Ok(self.store.find_wallet_by_owner(owner_type, owner_id).await?)
    }

    /// The tenant's operating float, which stakes flow into and payouts come from
    pub async fn tenant_float(&self, tenant_id: Uuid, currency: &str) -> AppResult<Wallet> {
        self.get_or_create_wallet(tenant_id, OwnerType::TenantFloat, tenant_id, currency)
            .await
    }

    pub async fn system_account(
        &self,
        code: SystemAccountCode,
        tenant_id: Option<Uuid>,
        country_code: Option<&str>,
        currency: &str,
    ) -> AppResult<SystemAccount> {
        Ok(self
            .store
            .get_or_create_system_account(code, tenant_id, country_code, currency)
            .await?)
    }

    pub async fn system_account_balances(&self, tenant_id: Option<Uuid>) -> AppResult<Vec<SystemAccount>> {
        Ok(self.store.list_system_accounts(tenant_id).await?)
    }

    pub async fn entries_for_wallet(&self, wallet_id: Uuid) -> AppResult<Vec<LedgerEntry>> {
        Ok(self
            .store
            .ledger_entries_for_account(AccountRef::Wallet(wallet_id))
            .await?)
    }

    pub async fn transactions_for_wallet(&self, wallet_id: Uuid) -> AppResult<Vec<TransactionLog>> {
        Ok(self
            .store
            .transactions_for_account(AccountRef::Wallet(wallet_id))
            .await?)
    }

    // =========================================================================
    // Batch execution
    // =========================================================================

    /// Lock, load and apply a batch without committing it
    pub async fn prepare(&self, batch: TransferBatch) -> AppResult<PreparedBatch> {
        if batch.steps.is_empty() {
            return Err(AppError::Validation("Transfer batch has no steps".to_string()));
        }

        let accounts = batch.accounts();
        let locks = self
            .locks
            .acquire(accounts.iter().copied().map(lock_key))
            .await?;

        // Read after locking so the snapshots reflect the latest commit
        let mut working = HashMap::with_capacity(accounts.len());
        for account in &accounts {
            working.insert(*account, self.load(*account, batch.tenant_id).await?);
        }

        let mut uow = UnitOfWork::new(batch.label.clone());
        let mut entries = Vec::new();
        let mut balance_moves = Vec::new();

        for step in &batch.steps {
            match step {
                Step::Transfer(leg) => {
                    let (entry, rows) = apply_leg(&mut working, leg, &batch)?;
                    uow.transactions.extend(rows);
                    entries.push(entry);
                }
                Step::Lock { wallet_id, amount } => {
                    let row = apply_lock(&mut working, *wallet_id, *amount, &batch, true)?;
                    balance_moves.push(serde_json::json!({
                        "wallet_id": wallet_id.to_string(),
                        "lock": amount.to_string(),
                    }));
                    uow.transactions.push(row);
                }
                Step::Unlock { wallet_id, amount } => {
                    let row = apply_lock(&mut working, *wallet_id, *amount, &batch, false)?;
                    balance_moves.push(serde_json::json!({
                        "wallet_id": wallet_id.to_string(),
                        "unlock": amount.to_string(),
                    }));
                    uow.transactions.push(row);
                }
            }
        }

        let mut wallets = HashMap::new();
        for (_, account) in working {
            match account {
                Working::Wallet {
                    wallet,
                    expected_version,
                } => {
                    wallets.insert(wallet.id, wallet.clone());
                    uow.put_wallet(WalletWrite {
                        wallet,
                        expected_version,
                    });
                }
                Working::System {
                    account,
                    expected_version,
                } => uow.put_system_account(SystemAccountWrite {
                    account,
                    expected_version,
                }),
            }
        }

        let mut draft = ledger_batch_draft(&batch.label, &batch.created_by, &batch.reference, &entries);
        if !balance_moves.is_empty() {
            draft.payload["balance_moves"] = serde_json::Value::Array(balance_moves);
        }
        uow.audit.push(draft);
        uow.ledger_entries = entries.clone();

        Ok(PreparedBatch {
            uow,
            entries,
            wallets,
            _locks: locks,
        })
    }

    /// Commit a prepared batch; locks are released when this returns
    pub async fn commit(&self, prepared: PreparedBatch) -> AppResult<BatchOutcome> {
        let PreparedBatch {
            uow,
            mut wallets,
            _locks,
            ..
        } = prepared;

        let label = uow.label.clone();
        let versions: HashMap<Uuid, i64> = uow
            .wallet_writes
            .iter()
            .map(|w| (w.wallet.id, w.expected_version + 1))
            .collect();

        let receipt = self.store.commit(uow).await.map_err(|e| {
            warn!(label = %label, "Unit of work rejected: {}", e);
            AppError::from(e)
        })?;

        for wallet in wallets.values_mut() {
            if let Some(version) = versions.get(&wallet.id) {
                wallet.version = *version;
            }
        }

        for entry in &receipt.ledger_entries {
            info!(
                entry_id = %entry.id,
                sequence = entry.sequence,
                transaction_type = entry.transaction_type.as_str(),
                debit = %entry.debit_account,
                credit = %entry.credit_account,
                amount = %entry.amount,
                "Ledger entry committed"
            );
        }

        Ok(BatchOutcome {
            entries: receipt.ledger_entries,
            wallets,
        })
    }

    /// Prepare and commit in one call
    pub async fn execute(&self, batch: TransferBatch) -> AppResult<BatchOutcome> {
        let prepared = self.prepare(batch).await?;
        self.commit(prepared).await
    }

    async fn load(&self, account: AccountRef, tenant_id: Uuid) -> AppResult<Working> {
        match account {
            AccountRef::Wallet(id) => {
                let wallet = self.get_wallet(id).await?;
                if wallet.tenant_id != tenant_id {
                    return Err(AppError::Validation(format!(
                        "Wallet {} does not belong to tenant {}",
                        id, tenant_id
                    )));
                }
                let expected_version = wallet.version;
                Ok(Working::Wallet {
                    wallet,
                    expected_version,
                })
            }
            AccountRef::System(id) => {
                let account = self
                    .store
                    .get_system_account(id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("System account {} not found", id)))?;
                if account.tenant_id.map_or(false, |t| t != tenant_id) {
                    return Err(AppError::Validation(format!(
                        "System account {} does not belong to tenant {}",
                        id, tenant_id
                    )));
                }
                let expected_version = account.version;
                Ok(Working::System {
                    account,
                    expected_version,
                })
            }
        }
    }

    // =========================================================================
    // Single-wallet operations
    // =========================================================================

    /// Take `amount` from the wallet's available balance
    pub async fn debit(&self, wallet_id: Uuid, amount: Decimal, movement: Movement) -> AppResult<LedgerEntry> {
        let wallet = self.get_wallet(wallet_id).await?;
        let leg = Leg {
            description: movement.description,
            ..Leg::new(
                AccountRef::Wallet(wallet_id),
                movement.counterparty,
                amount,
                movement.transaction_type,
            )
        };
        let batch = TransferBatch::new(
            "wallet.debit",
            wallet.tenant_id,
            &wallet.currency,
            &movement.created_by,
            movement.reference,
        )
        .transfer(leg);
        self.single_entry(batch).await
    }

    pub async fn credit(&self, wallet_id: Uuid, amount: Decimal, movement: Movement) -> AppResult<LedgerEntry> {
        let wallet = self.get_wallet(wallet_id).await?;
        let leg = Leg {
            description: movement.description,
            ..Leg::new(
                movement.counterparty,
                AccountRef::Wallet(wallet_id),
                amount,
                movement.transaction_type,
            )
        };
        let batch = TransferBatch::new(
            "wallet.credit",
            wallet.tenant_id,
            &wallet.currency,
            &movement.created_by,
            movement.reference,
        )
        .transfer(leg);
        self.single_entry(batch).await
    }

    /// Reserve funds for a pending stake
    pub async fn lock_balance(
        &self,
        wallet_id: Uuid,
        amount: Decimal,
        reference: &str,
        created_by: &str,
    ) -> AppResult<Wallet> {
        let wallet = self.get_wallet(wallet_id).await?;
        let batch = TransferBatch::new(
            "wallet.lock",
            wallet.tenant_id,
            &wallet.currency,
            created_by,
            reference,
        )
        .lock(wallet_id, amount);

        let outcome = self.execute(batch).await?;
        info!(%wallet_id, %amount, "Balance locked");
        outcome
            .wallet(wallet_id)
            .cloned()
            .ok_or_else(|| AppError::WalletNotFound(wallet_id.to_string()))
    }

    /// Release a lock, either back to available or captured as a ledger debit
    pub async fn unlock_balance(
        &self,
        wallet_id: Uuid,
        amount: Decimal,
        release: LockRelease,
        created_by: &str,
    ) -> AppResult<UnlockOutcome> {
        let wallet = self.get_wallet(wallet_id).await?;

        let batch = match release {
            LockRelease::ReturnToAvailable => TransferBatch::new(
                "wallet.unlock",
                wallet.tenant_id,
                &wallet.currency,
                created_by,
                format!("unlock:{}", wallet_id),
            )
            .unlock(wallet_id, amount),
            LockRelease::Capture {
                to,
                transaction_type,
                reference,
            } => TransferBatch::new(
                "wallet.capture",
                wallet.tenant_id,
                &wallet.currency,
                created_by,
                reference,
            )
            .transfer(Leg::new(AccountRef::Wallet(wallet_id), to, amount, transaction_type).from_locked()),
        };

        let outcome = self.execute(batch).await?;
        let wallet = outcome
            .wallet(wallet_id)
            .cloned()
            .ok_or_else(|| AppError::WalletNotFound(wallet_id.to_string()))?;
        info!(%wallet_id, %amount, captured = !outcome.entries.is_empty(), "Balance unlocked");

        Ok(UnlockOutcome {
            wallet,
            entry: outcome.entries.into_iter().next(),
        })
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Debit `from`, credit `to` and write one ledger entry, all or nothing
    pub async fn atomic_transfer(
        &self,
        from_wallet_id: Uuid,
        to_wallet_id: Uuid,
        amount: Decimal,
        transaction_type: TransactionType,
        reference: &str,
        created_by: &str,
    ) -> AppResult<LedgerEntry> {
        let from = self.get_wallet(from_wallet_id).await?;
        let batch = TransferBatch::new(
            "wallet.transfer",
            from.tenant_id,
            &from.currency,
            created_by,
            reference,
        )
        .transfer(Leg::new(
            AccountRef::Wallet(from_wallet_id),
            AccountRef::Wallet(to_wallet_id),
            amount,
            transaction_type,
        ));
        self.single_entry(batch).await
    }

    /// Route funds from a wallet into a tenant-scoped system account
    pub async fn transfer_to_system_account(
        &self,
        from_wallet_id: Uuid,
        code: SystemAccountCode,
        country_code: Option<&str>,
        amount: Decimal,
        transaction_type: TransactionType,
        reference: &str,
        created_by: &str,
    ) -> AppResult<LedgerEntry> {
        let from = self.get_wallet(from_wallet_id).await?;
        let account = self
            .system_account(code, Some(from.tenant_id), country_code, &from.currency)
            .await?;
        let batch = TransferBatch::new(
            "wallet.system_transfer",
            from.tenant_id,
            &from.currency,
            created_by,
            reference,
        )
        .transfer(
            Leg::new(
                AccountRef::Wallet(from_wallet_id),
                AccountRef::System(account.id),
                amount,
                transaction_type,
            )
            .describe(code.as_str()),
        );
        self.single_entry(batch).await
    }

    /// Record a deposit already settled with the payment provider
    pub async fn deposit(
        &self,
        wallet_id: Uuid,
        amount: Decimal,
        reference: &str,
        created_by: &str,
    ) -> AppResult<LedgerEntry> {
        let wallet = self.get_wallet(wallet_id).await?;
        let clearing = self
            .system_account(
                SystemAccountCode::PaymentClearing,
                Some(wallet.tenant_id),
                None,
                &wallet.currency,
            )
            .await?;
        let batch = TransferBatch::new(
            "wallet.deposit",
            wallet.tenant_id,
            &wallet.currency,
            created_by,
            reference,
        )
        .transfer(Leg::new(
            AccountRef::System(clearing.id),
            AccountRef::Wallet(wallet_id),
            amount,
            TransactionType::Deposit,
        ));
        self.single_entry(batch).await
    }

    /// Record a payout to the player's external account
    pub async fn withdraw(
        &self,
        wallet_id: Uuid,
        amount: Decimal,
        reference: &str,
        created_by: &str,
    ) -> AppResult<LedgerEntry> {
        let wallet = self.get_wallet(wallet_id).await?;
        let clearing = self
            .system_account(
                SystemAccountCode::PaymentClearing,
                Some(wallet.tenant_id),
                None,
                &wallet.currency,
            )
            .await?;
        let batch = TransferBatch::new(
            "wallet.withdraw",
            wallet.tenant_id,
            &wallet.currency,
            created_by,
            reference,
        )
        .transfer(Leg::new(
            AccountRef::Wallet(wallet_id),
            AccountRef::System(clearing.id),
            amount,
            TransactionType::Withdrawal,
        ));
        self.single_entry(batch).await
    }

    /// Admin correction. Positive amounts credit the wallet, negative debit it.
    pub async fn adjust_balance(
        &self,
        wallet_id: Uuid,
        amount: Decimal,
        reason: &str,
        created_by: &str,
    ) -> AppResult<LedgerEntry> {
        if amount.is_zero() {
            return Err(AppError::Validation("Adjustment amount must not be zero".to_string()));
        }
        if reason.trim().is_empty() {
            return Err(AppError::Validation("Adjustment requires a reason".to_string()));
        }

        let wallet = self.get_wallet(wallet_id).await?;
        let contra = self
            .system_account(
                SystemAccountCode::ManualAdjustment,
                Some(wallet.tenant_id),
                None,
                &wallet.currency,
            )
            .await?;

        let (from, to) = if amount > Decimal::ZERO {
            (AccountRef::System(contra.id), AccountRef::Wallet(wallet_id))
        } else {
            (AccountRef::Wallet(wallet_id), AccountRef::System(contra.id))
        };

        let batch = TransferBatch::new(
            "wallet.adjustment",
            wallet.tenant_id,
            &wallet.currency,
            created_by,
            format!("adjustment:{}", Uuid::new_v4()),
        )
        .transfer(Leg::new(from, to, amount.abs(), TransactionType::ManualAdjustment).describe(reason));

        let entry = self.single_entry(batch).await?;
        info!(%wallet_id, %amount, reason, created_by, "Manual adjustment applied");
        Ok(entry)
    }

    /// Write the opposite of `entry_id` as a new entry. The original row is
    /// left untouched and can be reversed only once.
    pub async fn reverse_entry(
        &self,
        entry_id: Uuid,
        reason: &str,
        created_by: &str,
    ) -> AppResult<LedgerEntry> {
        let original = self
            .store
            .get_ledger_entry(entry_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Ledger entry {} not found", entry_id)))?;

        if original.reverses_entry_id.is_some() {
            return Err(AppError::Validation(format!(
                "Entry {} is itself a correction and cannot be reversed",
                entry_id
            )));
        }
        if original.amount.is_zero() {
            return Err(AppError::Validation(format!(
                "Entry {} moved no funds",
                entry_id
            )));
        }
        if self.store.find_reversal(entry_id).await?.is_some() {
            return Err(AppError::Conflict(format!("Entry {} is already reversed", entry_id)));
        }

        let leg = Leg {
            status: EntryStatus::Reversed,
            reverses_entry_id: Some(original.id),
            ..Leg::new(
                original.credit_account,
                original.debit_account,
                original.amount,
                TransactionType::Reversal,
            )
            .describe(reason)
        };
        let batch = TransferBatch::new(
            "ledger.reversal",
            original.tenant_id,
            &original.currency,
            created_by,
            format!("reversal:{}", original.id),
        )
        .transfer(leg);

        let entry = self.single_entry(batch).await?;
        info!(original = %entry_id, reversal = %entry.id, reason, "Ledger entry reversed");
        Ok(entry)
    }

    /// Freeze, suspend, close or reactivate a wallet
    pub async fn set_wallet_status(
        &self,
        wallet_id: Uuid,
        status: WalletStatus,
        reason: &str,
        created_by: &str,
    ) -> AppResult<Wallet> {
        let _lock = self.locks.acquire(vec![LockKey::Wallet(wallet_id)]).await?;
        let mut wallet = self.get_wallet(wallet_id).await?;
        let previous = wallet.status;
        let expected_version = wallet.version;
        wallet.status = status;

        let mut uow = UnitOfWork::new("wallet.status");
        uow.put_wallet(WalletWrite {
            wallet: wallet.clone(),
            expected_version,
        });
        uow.audit.push(crate::models::AuditDraft::new(
            "wallet.status_changed",
            created_by,
            "wallet",
            wallet_id,
            serde_json::json!({
                "from": previous.as_str(),
                "to": status.as_str(),
                "reason": reason,
            }),
        ));
        self.store.commit(uow).await?;

        wallet.version = expected_version + 1;
        info!(%wallet_id, from = previous.as_str(), to = status.as_str(), "Wallet status changed");
        Ok(wallet)
    }

    // =========================================================================
    // Integrity
    // =========================================================================

    /// Replay the wallet's ledger and compare with its stored total
    pub async fn verify_wallet_balance(&self, wallet_id: Uuid) -> AppResult<WalletReconciliation> {
        let wallet = self.get_wallet(wallet_id).await?;
        let account = AccountRef::Wallet(wallet_id);
        let entries = self.store.ledger_entries_for_account(account).await?;

        let ledger_total = entries
            .iter()
            .filter(|e| e.status != EntryStatus::Failed)
            .map(|e| e.net_effect_on(account))
            .sum::<Decimal>();
        let stored_total = wallet.total_balance();
        let matches = ledger_total == stored_total;

        if !matches {
            warn!(%wallet_id, %stored_total, %ledger_total, "Wallet balance does not match its ledger");
        }

        Ok(WalletReconciliation {
            wallet_id,
            stored_total,
            ledger_total,
            entries: entries.len(),
            matches,
        })
    }

    pub async fn ledger_totals(&self) -> AppResult<LedgerTotals> {
        Ok(self.store.ledger_totals().await?)
    }

    async fn single_entry(&self, batch: TransferBatch) -> AppResult<LedgerEntry> {
        let outcome = self.execute(batch).await?;
        outcome
            .entries
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Store("transfer committed without a ledger entry".to_string()))
    }
}

// ===== STEP APPLICATION =====

fn apply_leg(
    working: &mut HashMap<AccountRef, Working>,
    leg: &Leg,
    batch: &TransferBatch,
) -> AppResult<(LedgerEntry, [TransactionLog; 2])> {
    if leg.amount < Decimal::ZERO
        || (leg.amount.is_zero() && !leg.transaction_type.allows_zero_amount())
    {
        return Err(AppError::Validation(format!(
            "Transfer amount must be positive, got {}",
            leg.amount
        )));
    }
    if leg.from == leg.to {
        return Err(AppError::Validation(format!(
            "Cannot transfer from {} to itself",
            leg.from
        )));
    }

    let (debit_before, debit_after) = {
        let debit = working
            .get_mut(&leg.from)
            .ok_or_else(|| AppError::NotFound(leg.from.to_string()))?;
        check_currency(debit, &batch.currency)?;
        let before = debit.total();
        match debit {
            Working::Wallet { wallet, .. } => {
                // Zero-amount records move nothing and pass any status
                if !leg.amount.is_zero() && !wallet.can_debit() {
                    return Err(status_error(wallet, "be debited"));
                }
                let bucket = match leg.source {
                    Funds::Available => &mut wallet.available_balance,
                    Funds::Locked => &mut wallet.locked_balance,
                };
                if leg.amount > *bucket {
                    return Err(AppError::InsufficientBalance {
                        account: leg.from.to_string(),
                        available: *bucket,
                        requested: leg.amount,
                    });
                }
                *bucket -= leg.amount;
            }
            Working::System { account, .. } => account.balance -= leg.amount,
        }
        (before, debit.total())
    };

    let (credit_before, credit_after) = {
        let credit = working
            .get_mut(&leg.to)
            .ok_or_else(|| AppError::NotFound(leg.to.to_string()))?;
        check_currency(credit, &batch.currency)?;
        let before = credit.total();
        match credit {
            Working::Wallet { wallet, .. } => {
                if !wallet.can_credit() {
                    return Err(status_error(wallet, "be credited"));
                }
                wallet.available_balance += leg.amount;
            }
            Working::System { account, .. } => account.balance += leg.amount,
        }
        (before, credit.total())
    };

    let now = Utc::now();
    let (fiscal_year, fiscal_period) = fiscal_period_of(now);
    let entry = LedgerEntry {
        id: Uuid::new_v4(),
        sequence: 0,
        tenant_id: batch.tenant_id,
        debit_account: leg.from,
        credit_account: leg.to,
        amount: leg.amount,
        currency: batch.currency.clone(),
        transaction_type: leg.transaction_type,
        reference: batch.reference.clone(),
        description: leg.description.clone(),
        debit_balance_before: debit_before,
        debit_balance_after: debit_after,
        credit_balance_before: credit_before,
        credit_balance_after: credit_after,
        status: leg.status,
        reverses_entry_id: leg.reverses_entry_id,
        fiscal_year,
        fiscal_period,
        created_by: batch.created_by.clone(),
        created_at: now,
    };

    let rows = [
        log_row(
            Some(entry.id),
            leg.from,
            Direction::Debit,
            leg.transaction_type,
            leg.amount,
            debit_before,
            debit_after,
            &batch.reference,
        ),
        log_row(
            Some(entry.id),
            leg.to,
            Direction::Credit,
            leg.transaction_type,
            leg.amount,
            credit_before,
            credit_after,
            &batch.reference,
        ),
    ];

    Ok((entry, rows))
}

fn apply_lock(
    working: &mut HashMap<AccountRef, Working>,
    wallet_id: Uuid,
    amount: Decimal,
    batch: &TransferBatch,
    locking: bool,
) -> AppResult<TransactionLog> {
    if amount <= Decimal::ZERO {
        return Err(AppError::Validation(format!(
            "Lock amount must be positive, got {}",
            amount
        )));
    }

    let account = AccountRef::Wallet(wallet_id);
    let Some(Working::Wallet { wallet, .. }) = working.get_mut(&account) else {
        return Err(AppError::WalletNotFound(wallet_id.to_string()));
    };
    if !wallet.currency.eq_ignore_ascii_case(&batch.currency) {
        return Err(AppError::CurrencyMismatch {
            expected: wallet.currency.clone(),
            actual: batch.currency.clone(),
        });
    }

    let before = wallet.available_balance;
    if locking {
        if !wallet.can_debit() {
            return Err(status_error(wallet, "lock funds"));
        }
        if amount > wallet.available_balance {
            return Err(AppError::InsufficientBalance {
                account: account.to_string(),
                available: wallet.available_balance,
                requested: amount,
            });
        }
        wallet.available_balance -= amount;
        wallet.locked_balance += amount;
    } else {
        if !wallet.can_credit() {
            return Err(status_error(wallet, "release locked funds"));
        }
        if amount > wallet.locked_balance {
            return Err(AppError::InsufficientBalance {
                account: format!("{} (locked)", account),
                available: wallet.locked_balance,
                requested: amount,
            });
        }
        wallet.locked_balance -= amount;
        wallet.available_balance += amount;
    }

    let (direction, transaction_type) = if locking {
        (Direction::Debit, TransactionType::BalanceLock)
    } else {
        (Direction::Credit, TransactionType::BalanceUnlock)
    };
    Ok(log_row(
        None,
        account,
        direction,
        transaction_type,
        amount,
        before,
        wallet.available_balance,
        &batch.reference,
    ))
}

fn check_currency(account: &Working, currency: &str) -> AppResult<()> {
    if !account.currency().eq_ignore_ascii_case(currency) {
        return Err(AppError::CurrencyMismatch {
            expected: account.currency().to_string(),
            actual: currency.to_string(),
        });
    }
    Ok(())
}
