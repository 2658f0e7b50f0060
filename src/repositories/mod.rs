//! Storage for wallets, ledger rows, rules, settlements and the audit chain.
//!
//! Reads go straight to the store. Every mutation goes through
//! [`LedgerStore::commit`] as one [`UnitOfWork`].

pub mod memory;
pub mod postgres;
pub mod unit_of_work;

pub use memory::{FailPoint, MemoryStore};
pub use postgres::PgStore;
pub use unit_of_work::{CommitReceipt, RuleArchive, SystemAccountWrite, UnitOfWork, WalletWrite};

use crate::error::StoreError;
use crate::models::{
    AccountRef, AuditRecord, BetSettlementRecord, JurisdictionRule, LedgerEntry, LedgerTotals,
    OwnerType, Settlement, SettlementKey, SettlementPeriod, SystemAccount, SystemAccountCode,
    TransactionLog, Wager, Wallet,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

// ===== UNIQUE KEYS =====
// Both stores report duplicates under these names.

pub const SETTLEMENT_PERIOD_KEY: &str = "settlements_beneficiary_type_period_key";
pub const BET_SETTLEMENT_KEY: &str = "bet_settlements_pkey";
pub const WAGER_KEY: &str = "wagers_pkey";
pub const ONE_ACTIVE_RULE_KEY: &str = "jurisdiction_rules_one_active_version";
pub const SINGLE_REVERSAL_KEY: &str = "ledger_entries_reverses_entry_id_key";

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ===== WALLETS =====

    /// Return the wallet mapped to the owner, creating wallet and mapping on
    /// first reference. Concurrent first calls resolve to the same wallet.
    async fn get_or_create_wallet(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
        tenant_id: Uuid,
        currency: &str,
    ) -> Result<Wallet, StoreError>;

    async fn get_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>, StoreError>;

    async fn find_wallet_by_owner(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
    ) -> Result<Option<Wallet>, StoreError>;

    // ===== SYSTEM ACCOUNTS =====

    async fn get_or_create_system_account(
        &self,
        code: SystemAccountCode,
        tenant_id: Option<Uuid>,
        country_code: Option<&str>,
        currency: &str,
    ) -> Result<SystemAccount, StoreError>;

    async fn get_system_account(&self, id: Uuid) -> Result<Option<SystemAccount>, StoreError>;

    /// System accounts scoped to `tenant_id` (or the unscoped ones for `None`)
    async fn list_system_accounts(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Vec<SystemAccount>, StoreError>;

    // ===== LEDGER =====

    async fn get_ledger_entry(&self, id: Uuid) -> Result<Option<LedgerEntry>, StoreError>;

    /// Every entry touching `account`, ascending by sequence
    async fn ledger_entries_for_account(
        &self,
        account: AccountRef,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// The correction entry pointing at `entry_id`, if one was written
    async fn find_reversal(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>, StoreError>;

    async fn ledger_totals(&self) -> Result<LedgerTotals, StoreError>;

    async fn transactions_for_account(
        &self,
        account: AccountRef,
    ) -> Result<Vec<TransactionLog>, StoreError>;

    // ===== RULES =====

    async fn get_rule(&self, id: Uuid) -> Result<Option<JurisdictionRule>, StoreError>;

    async fn find_active_rule(
        &self,
        country_code: &str,
        profile_name: &str,
    ) -> Result<Option<JurisdictionRule>, StoreError>;

    /// All versions, ascending by version number
    async fn rule_versions(
        &self,
        country_code: &str,
        profile_name: &str,
    ) -> Result<Vec<JurisdictionRule>, StoreError>;

    // ===== SETTLEMENTS =====

    async fn get_settlement(&self, id: Uuid) -> Result<Option<Settlement>, StoreError>;

    async fn find_settlement(&self, key: &SettlementKey)
        -> Result<Option<Settlement>, StoreError>;

    async fn list_settlements(
        &self,
        tenant_id: Uuid,
        period_start: Option<DateTime<Utc>>,
    ) -> Result<Vec<Settlement>, StoreError>;

    async fn find_bet_settlement(
        &self,
        bet_id: Uuid,
    ) -> Result<Option<BetSettlementRecord>, StoreError>;

    /// Settled wagers of `player_ids` whose settlement time falls in `period`
    async fn wagers_for_players(
        &self,
        tenant_id: Uuid,
        player_ids: &[Uuid],
        period: &SettlementPeriod,
    ) -> Result<Vec<Wager>, StoreError>;

    // ===== AUDIT =====

    /// The full chain, ascending by sequence
    async fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError>;

    // ===== COMMIT =====

    /// Apply the whole batch atomically or fail without any visible effect
    async fn commit(&self, uow: UnitOfWork) -> Result<CommitReceipt, StoreError>;
}
