//! Atomic write batch handed to a `LedgerStore`

use crate::models::{
    AuditDraft, AuditRecord, BetSettlementRecord, JurisdictionRule, LedgerEntry, Settlement,
    SystemAccount, TransactionLog, Wager, Wallet,
};
use chrono::{DateTime, Utc};

/// Wallet row to persist. The store rejects the write with a conflict unless
/// the stored version still equals `expected_version`.
#[derive(Debug, Clone)]
pub struct WalletWrite {
    pub wallet: Wallet,
    pub expected_version: i64,
}

#[derive(Debug, Clone)]
pub struct SystemAccountWrite {
    pub account: SystemAccount,
    pub expected_version: i64,
}

/// Close an active rule version so its successor can take over
#[derive(Debug, Clone)]
pub struct RuleArchive {
    pub rule_id: uuid::Uuid,
    pub effective_to: DateTime<Utc>,
}

/// Everything one business operation writes. A store applies all of it or
/// none of it.
///
/// Ledger entries carry `sequence = 0` until the store numbers them, and the
/// audit drafts are chained onto the log inside the same commit.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    pub label: String,
    pub wallet_writes: Vec<WalletWrite>,
    pub system_account_writes: Vec<SystemAccountWrite>,
    pub ledger_entries: Vec<LedgerEntry>,
    pub transactions: Vec<TransactionLog>,
    pub rule_archives: Vec<RuleArchive>,
    pub rule_inserts: Vec<JurisdictionRule>,
    pub settlements: Vec<Settlement>,
    pub bet_settlements: Vec<BetSettlementRecord>,
    pub wagers: Vec<Wager>,
    pub audit: Vec<AuditDraft>,
}

impl UnitOfWork {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wallet_writes.is_empty()
            && self.system_account_writes.is_empty()
            && self.ledger_entries.is_empty()
            && self.transactions.is_empty()
            && self.rule_archives.is_empty()
            && self.rule_inserts.is_empty()
            && self.settlements.is_empty()
            && self.bet_settlements.is_empty()
            && self.wagers.is_empty()
            && self.audit.is_empty()
    }

    /// Fold another batch into this one, keeping the latest write per wallet
    /// and per system account
    pub fn merge(&mut self, other: UnitOfWork) {
        for write in other.wallet_writes {
            self.put_wallet(write);
        }
        for write in other.system_account_writes {
            self.put_system_account(write);
        }
        self.ledger_entries.extend(other.ledger_entries);
        self.transactions.extend(other.transactions);
        self.rule_archives.extend(other.rule_archives);
        self.rule_inserts.extend(other.rule_inserts);
        self.settlements.extend(other.settlements);
        self.bet_settlements.extend(other.bet_settlements);
        self.wagers.extend(other.wagers);
        self.audit.extend(other.audit);
    }

    /// Record a wallet write; a second write to the same wallet keeps the
    /// first expected version and the newest row
    pub fn put_wallet(&mut self, write: WalletWrite) {
        match self
            .wallet_writes
            .iter_mut()
            .find(|w| w.wallet.id == write.wallet.id)
        {
            Some(existing) => existing.wallet = write.wallet,
            None => self.wallet_writes.push(write),
        }
    }

    pub fn put_system_account(&mut self, write: SystemAccountWrite) {
        match self
            .system_account_writes
            .iter_mut()
            .find(|w| w.account.id == write.account.id)
        {
            Some(existing) => existing.account = write.account,
            None => self.system_account_writes.push(write),
        }
    }
}

/// What the store assigned while committing
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    /// Ledger entries with their final sequence numbers, in commit order
    pub ledger_entries: Vec<LedgerEntry>,
    pub audit_records: Vec<AuditRecord>,
}
