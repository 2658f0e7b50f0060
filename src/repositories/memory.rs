//! In-process `LedgerStore` for tests and single-node development.
//!
//! State lives behind one mutex. A commit works on a copy of the state and
//! swaps it in only when every write succeeded, so a failure part-way
//! through a batch leaves nothing behind.

use super::{
    CommitReceipt, LedgerStore, UnitOfWork, BET_SETTLEMENT_KEY, ONE_ACTIVE_RULE_KEY,
    SETTLEMENT_PERIOD_KEY, SINGLE_REVERSAL_KEY, WAGER_KEY,
};
use crate::error::StoreError;
use crate::models::{
    AccountRef, AuditRecord, BetSettlementRecord, Direction, EntryStatus, JurisdictionRule,
    LedgerEntry, LedgerTotals, OwnerType, RuleStatus, Settlement, SettlementKey,
    SettlementPeriod, SystemAccount, SystemAccountCode, TransactionLog, Wager, Wallet,
    WalletOwner, GENESIS_CHECKSUM,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Where an injected fault fires inside `commit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Before any write of the batch is applied
    BeforeApply,
    /// After the given number of wallet writes were applied
    AfterWalletWrite(usize),
    /// After ledger rows, before the audit append
    BeforeAudit,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    wallets: HashMap<Uuid, Wallet>,
    owners: HashMap<(OwnerType, Uuid), WalletOwner>,
    system_accounts: HashMap<Uuid, SystemAccount>,
    ledger: Vec<LedgerEntry>,
    transactions: Vec<TransactionLog>,
    rules: HashMap<Uuid, JurisdictionRule>,
    settlements: HashMap<Uuid, Settlement>,
    bet_settlements: HashMap<Uuid, BetSettlementRecord>,
    wagers: HashMap<Uuid, Wager>,
    audit: Vec<AuditRecord>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_point: Arc<Mutex<Option<FailPoint>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot fault for the next commit that reaches `point`
    pub fn inject_fault(&self, point: FailPoint) {
        if let Ok(mut slot) = self.fail_point.lock() {
            *slot = Some(point);
        }
    }

    /// Overwrite a stored audit payload in place, as an out-of-band edit to
    /// the storage would. Only integrity tests call this.
    pub fn tamper_audit_payload(&self, sequence: i64, payload: serde_json::Value) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        match state.audit.iter_mut().find(|r| r.sequence == sequence) {
            Some(record) => {
                record.payload = payload;
                true
            }
            None => false,
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn trip(&self, reached: FailPoint) -> Result<(), StoreError> {
        let mut slot = self
            .fail_point
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        if *slot == Some(reached) {
            *slot = None;
            return Err(StoreError::Injected(format!("{:?}", reached)));
        }
        Ok(())
    }

    fn apply(&self, state: &mut MemoryState, uow: UnitOfWork) -> Result<CommitReceipt, StoreError> {
        let now = Utc::now();
        self.trip(FailPoint::BeforeApply)?;

        for (applied, write) in uow.wallet_writes.into_iter().enumerate() {
            let stored = state
                .wallets
                .get_mut(&write.wallet.id)
                .ok_or_else(|| StoreError::NotFound(format!("wallet {}", write.wallet.id)))?;
            if stored.version != write.expected_version {
                return Err(StoreError::Conflict(format!(
                    "wallet {} is at version {}, expected {}",
                    stored.id, stored.version, write.expected_version
                )));
            }
            if write.wallet.available_balance < Decimal::ZERO
                || write.wallet.locked_balance < Decimal::ZERO
            {
                return Err(StoreError::ConstraintViolation(format!(
                    "wallet {} balance would go negative",
                    stored.id
                )));
            }
            let mut wallet = write.wallet;
            wallet.version = write.expected_version + 1;
            wallet.updated_at = now;
            *stored = wallet;
            self.trip(FailPoint::AfterWalletWrite(applied + 1))?;
        }

        for write in uow.system_account_writes {
            let stored = state
                .system_accounts
                .get_mut(&write.account.id)
                .ok_or_else(|| StoreError::NotFound(format!("system account {}", write.account.id)))?;
            if stored.version != write.expected_version {
                return Err(StoreError::Conflict(format!(
                    "system account {} is at version {}, expected {}",
                    stored.id, stored.version, write.expected_version
                )));
            }
            let mut account = write.account;
            account.version = write.expected_version + 1;
            account.updated_at = now;
            *stored = account;
        }

        for archive in uow.rule_archives {
            let rule = state
                .rules
                .get_mut(&archive.rule_id)
                .ok_or_else(|| StoreError::NotFound(format!("rule {}", archive.rule_id)))?;
            if rule.status != RuleStatus::Active {
                return Err(StoreError::Conflict(format!(
                    "rule {} is no longer active",
                    rule.id
                )));
            }
            rule.status = RuleStatus::Archived;
            rule.effective_to = Some(archive.effective_to);
        }

        for rule in uow.rule_inserts {
            let clash = state.rules.values().any(|existing| {
                existing.country_code == rule.country_code
                    && existing.profile_name == rule.profile_name
                    && (existing.version == rule.version
                        || (existing.status == RuleStatus::Active
                            && rule.status == RuleStatus::Active))
            });
            if clash || state.rules.contains_key(&rule.id) {
                return Err(StoreError::Duplicate(
                    ONE_ACTIVE_RULE_KEY.to_string(),
                ));
            }
            state.rules.insert(rule.id, rule);
        }

        for settlement in uow.settlements {
            let key = settlement.key();
            let clash = state
                .settlements
                .values()
                .any(|existing| existing.id != settlement.id && existing.key() == key);
            if clash {
                return Err(StoreError::Duplicate(
                    SETTLEMENT_PERIOD_KEY.to_string(),
                ));
            }
            if let Some(existing) = state.settlements.get(&settlement.id) {
                if existing.is_completed() {
                    return Err(StoreError::Conflict(format!(
                        "settlement {} is completed and frozen",
                        existing.id
                    )));
                }
            }
            state.settlements.insert(settlement.id, settlement);
        }

        for record in uow.bet_settlements {
            if state.bet_settlements.contains_key(&record.bet_id) {
                return Err(StoreError::Duplicate(BET_SETTLEMENT_KEY.to_string()));
            }
            state.bet_settlements.insert(record.bet_id, record);
        }

        for wager in uow.wagers {
            if state.wagers.contains_key(&wager.id) {
                return Err(StoreError::Duplicate(WAGER_KEY.to_string()));
            }
            state.wagers.insert(wager.id, wager);
        }

        let mut committed = Vec::with_capacity(uow.ledger_entries.len());
        for mut entry in uow.ledger_entries {
            check_entry(&entry)?;
            if let Some(original) = entry.reverses_entry_id {
                if state
                    .ledger
                    .iter()
                    .any(|e| e.reverses_entry_id == Some(original))
                {
                    return Err(StoreError::Duplicate(
                        SINGLE_REVERSAL_KEY.to_string(),
                    ));
                }
            }
            entry.sequence = state.ledger.len() as i64 + 1;
            state.ledger.push(entry.clone());
            committed.push(entry);
        }
        state.transactions.extend(uow.transactions);

        self.trip(FailPoint::BeforeAudit)?;

        let mut sealed = Vec::with_capacity(uow.audit.len());
        for draft in uow.audit {
            let (sequence, previous) = match state.audit.last() {
                Some(last) => (last.sequence + 1, last.checksum.clone()),
                None => (1, GENESIS_CHECKSUM.to_string()),
            };
            let record = draft.seal(sequence, &previous, now);
            state.audit.push(record.clone());
            sealed.push(record);
        }

        Ok(CommitReceipt {
            ledger_entries: committed,
            audit_records: sealed,
        })
    }
}

/// Row-level checks a database would enforce with CHECK constraints
fn check_entry(entry: &LedgerEntry) -> Result<(), StoreError> {
    if entry.amount < Decimal::ZERO
        || (entry.amount == Decimal::ZERO && !entry.transaction_type.allows_zero_amount())
    {
        return Err(StoreError::ConstraintViolation(format!(
            "ledger entry {} has invalid amount {}",
            entry.id, entry.amount
        )));
    }
    if !entry.snapshots_consistent() {
        return Err(StoreError::ConstraintViolation(format!(
            "ledger entry {} snapshots do not move by its amount",
            entry.id
        )));
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_or_create_wallet(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
        tenant_id: Uuid,
        currency: &str,
    ) -> Result<Wallet, StoreError> {
        let mut state = self.lock_state()?;
        if let Some(owner) = state.owners.get(&(owner_type, owner_id)) {
            let wallet_id = owner.wallet_id;
            return state
                .wallets
                .get(&wallet_id)
                .cloned()
                .ok_or_else(|| StoreError::InvalidData(format!("dangling owner mapping to {}", wallet_id)));
        }

        let wallet = Wallet::new(tenant_id, currency);
        state.owners.insert(
            (owner_type, owner_id),
            WalletOwner {
                owner_type,
                owner_id,
                wallet_id: wallet.id,
                created_at: wallet.created_at,
            },
        );
        state.wallets.insert(wallet.id, wallet.clone());
        Ok(wallet)
    }

    async fn get_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>, StoreError> {
        Ok(self.lock_state()?.wallets.get(&wallet_id).cloned())
    }

    async fn find_wallet_by_owner(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
    ) -> Result<Option<Wallet>, StoreError> {
        let state = self.lock_state()?;
        Ok(state
            .owners
            .get(&(owner_type, owner_id))
            .and_then(|owner| state.wallets.get(&owner.wallet_id))
            .cloned())
    }

    async fn get_or_create_system_account(
        &self,
        code: SystemAccountCode,
        tenant_id: Option<Uuid>,
        country_code: Option<&str>,
        currency: &str,
    ) -> Result<SystemAccount, StoreError> {
        let mut state = self.lock_state()?;
        let candidate = SystemAccount::new(code, tenant_id, country_code, currency);
        if let Some(existing) = state.system_accounts.values().find(|a| {
            a.code == candidate.code
                && a.tenant_id == candidate.tenant_id
                && a.country_code == candidate.country_code
                && a.currency == candidate.currency
        }) {
            return Ok(existing.clone());
        }
        state
            .system_accounts
            .insert(candidate.id, candidate.clone());
        Ok(candidate)
    }

    async fn get_system_account(&self, id: Uuid) -> Result<Option<SystemAccount>, StoreError> {
        Ok(self.lock_state()?.system_accounts.get(&id).cloned())
    }

    async fn list_system_accounts(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Vec<SystemAccount>, StoreError> {
        let state = self.lock_state()?;
        let mut accounts: Vec<SystemAccount> = state
            .system_accounts
            .values()
            .filter(|a| a.tenant_id == tenant_id)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.code.cmp(&b.code).then(a.currency.cmp(&b.currency)));
        Ok(accounts)
    }

    async fn get_ledger_entry(&self, id: Uuid) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self.lock_state()?.ledger.iter().find(|e| e.id == id).cloned())
    }

    async fn ledger_entries_for_account(
        &self,
        account: AccountRef,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .lock_state()?
            .ledger
            .iter()
            .filter(|e| e.touches(account))
            .cloned()
            .collect())
    }

    async fn find_reversal(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self
            .lock_state()?
            .ledger
            .iter()
            .find(|e| e.reverses_entry_id == Some(entry_id))
            .cloned())
    }

    async fn ledger_totals(&self) -> Result<LedgerTotals, StoreError> {
        let state = self.lock_state()?;
        let mut totals = LedgerTotals {
            entry_count: state
                .ledger
                .iter()
                .filter(|e| e.status != EntryStatus::Failed)
                .count() as i64,
            ..Default::default()
        };
        for row in state.transactions.iter().filter(|t| t.ledger_entry_id.is_some()) {
            match row.direction {
                Direction::Debit => totals.total_debits += row.amount,
                Direction::Credit => totals.total_credits += row.amount,
            }
        }
        Ok(totals)
    }

    async fn transactions_for_account(
        &self,
        account: AccountRef,
    ) -> Result<Vec<TransactionLog>, StoreError> {
        Ok(self
            .lock_state()?
            .transactions
            .iter()
            .filter(|t| t.account == account)
            .cloned()
            .collect())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<JurisdictionRule>, StoreError> {
        Ok(self.lock_state()?.rules.get(&id).cloned())
    }

    async fn find_active_rule(
        &self,
        country_code: &str,
        profile_name: &str,
    ) -> Result<Option<JurisdictionRule>, StoreError> {
        let country = country_code.to_uppercase();
        Ok(self
            .lock_state()?
            .rules
            .values()
            .find(|r| {
                r.country_code == country
                    && r.profile_name == profile_name
                    && r.status == RuleStatus::Active
            })
            .cloned())
    }

    async fn rule_versions(
        &self,
        country_code: &str,
        profile_name: &str,
    ) -> Result<Vec<JurisdictionRule>, StoreError> {
        let country = country_code.to_uppercase();
        let mut versions: Vec<JurisdictionRule> = self
            .lock_state()?
            .rules
            .values()
            .filter(|r| r.country_code == country && r.profile_name == profile_name)
            .cloned()
            .collect();
        versions.sort_by_key(|r| r.version);
        Ok(versions)
    }

    async fn get_settlement(&self, id: Uuid) -> Result<Option<Settlement>, StoreError> {
        Ok(self.lock_state()?.settlements.get(&id).cloned())
    }

    async fn find_settlement(
        &self,
        key: &SettlementKey,
    ) -> Result<Option<Settlement>, StoreError> {
        Ok(self
            .lock_state()?
            .settlements
            .values()
            .find(|s| s.key() == *key)
            .cloned())
    }

    async fn list_settlements(
        &self,
        tenant_id: Uuid,
        period_start: Option<DateTime<Utc>>,
    ) -> Result<Vec<Settlement>, StoreError> {
        let mut settlements: Vec<Settlement> = self
            .lock_state()?
            .settlements
            .values()
            .filter(|s| {
                s.tenant_id == tenant_id && period_start.map_or(true, |p| s.period_start == p)
            })
            .cloned()
            .collect();
        settlements.sort_by_key(|s| s.created_at);
        Ok(settlements)
    }

    async fn find_bet_settlement(
        &self,
        bet_id: Uuid,
    ) -> Result<Option<BetSettlementRecord>, StoreError> {
        Ok(self.lock_state()?.bet_settlements.get(&bet_id).cloned())
    }

    async fn wagers_for_players(
        &self,
        tenant_id: Uuid,
        player_ids: &[Uuid],
        period: &SettlementPeriod,
    ) -> Result<Vec<Wager>, StoreError> {
        let mut wagers: Vec<Wager> = self
            .lock_state()?
            .wagers
            .values()
            .filter(|w| {
                w.tenant_id == tenant_id
                    && player_ids.contains(&w.player_id)
                    && period.contains(w.settled_at)
            })
            .cloned()
            .collect();
        wagers.sort_by_key(|w| w.settled_at);
        Ok(wagers)
    }

    async fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError> {
        Ok(self.lock_state()?.audit.clone())
    }

    async fn commit(&self, uow: UnitOfWork) -> Result<CommitReceipt, StoreError> {
        let mut state = self.lock_state()?;
        let mut working = state.clone();
        let receipt = self.apply(&mut working, uow)?;
        *state = working;
        Ok(receipt)
    }
}
