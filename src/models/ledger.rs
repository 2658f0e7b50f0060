//! Double-entry ledger records

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One side of a ledger entry: a wallet or a named system account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AccountRef {
    Wallet(Uuid),
    System(Uuid),
}

impl AccountRef {
    pub fn id(&self) -> Uuid {
        match self {
            AccountRef::Wallet(id) | AccountRef::System(id) => *id,
        }
    }

    /// Convert to database string
    pub fn kind(&self) -> &'static str {
        match self {
            AccountRef::Wallet(_) => "wallet",
            AccountRef::System(_) => "system",
        }
    }

    /// Rebuild from the (kind, id) column pair
    pub fn from_parts(kind: &str, id: Uuid) -> Result<Self, String> {
        match kind {
            "wallet" => Ok(AccountRef::Wallet(id)),
            "system" => Ok(AccountRef::System(id)),
            _ => Err(format!("Invalid account kind: {}", kind)),
        }
    }

    pub fn is_wallet(&self) -> bool {
        matches!(self, AccountRef::Wallet(_))
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Business meaning of a money movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    BetPlacement,
    BetWinning,
    BetStakeReturn,
    BetLoss,
    BetRefund,
    AgentCommission,
    CommissionWithdrawal,
    TaxDeduction,
    ManualAdjustment,
    Transfer,
    Reversal,
    BalanceLock,
    BalanceUnlock,
}

impl TransactionType {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "DEPOSIT" => Ok(Self::Deposit),
            "WITHDRAWAL" => Ok(Self::Withdrawal),
            "BET_PLACEMENT" => Ok(Self::BetPlacement),
            "BET_WINNING" => Ok(Self::BetWinning),
            "BET_STAKE_RETURN" => Ok(Self::BetStakeReturn),
            "BET_LOSS" => Ok(Self::BetLoss),
            "BET_REFUND" => Ok(Self::BetRefund),
            "AGENT_COMMISSION" => Ok(Self::AgentCommission),
            "COMMISSION_WITHDRAWAL" => Ok(Self::CommissionWithdrawal),
            "TAX_DEDUCTION" => Ok(Self::TaxDeduction),
            "MANUAL_ADJUSTMENT" => Ok(Self::ManualAdjustment),
            "TRANSFER" => Ok(Self::Transfer),
            "REVERSAL" => Ok(Self::Reversal),
            "BALANCE_LOCK" => Ok(Self::BalanceLock),
            "BALANCE_UNLOCK" => Ok(Self::BalanceUnlock),
            _ => Err(format!("Invalid transaction type: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "DEPOSIT",
            Self::Withdrawal => "WITHDRAWAL",
            Self::BetPlacement => "BET_PLACEMENT",
            Self::BetWinning => "BET_WINNING",
            Self::BetStakeReturn => "BET_STAKE_RETURN",
            Self::BetLoss => "BET_LOSS",
            Self::BetRefund => "BET_REFUND",
            Self::AgentCommission => "AGENT_COMMISSION",
            Self::CommissionWithdrawal => "COMMISSION_WITHDRAWAL",
            Self::TaxDeduction => "TAX_DEDUCTION",
            Self::ManualAdjustment => "MANUAL_ADJUSTMENT",
            Self::Transfer => "TRANSFER",
            Self::Reversal => "REVERSAL",
            Self::BalanceLock => "BALANCE_LOCK",
            Self::BalanceUnlock => "BALANCE_UNLOCK",
        }
    }

    /// Loss entries exist for the audit trail only and carry no funds
    pub fn allows_zero_amount(&self) -> bool {
        matches!(self, Self::BetLoss)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
}

impl EntryStatus {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(EntryStatus::Pending),
            "completed" => Ok(EntryStatus::Completed),
            "failed" => Ok(EntryStatus::Failed),
            "reversed" => Ok(EntryStatus::Reversed),
            _ => Err(format!("Invalid entry status: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
            EntryStatus::Reversed => "reversed",
        }
    }
}

/// Immutable double-entry record. Corrections are new entries that point
/// back through `reverses_entry_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    /// Global insertion order, assigned by the store at commit
    pub sequence: i64,
    pub tenant_id: Uuid,
    pub debit_account: AccountRef,
    pub credit_account: AccountRef,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_type: TransactionType,
    pub reference: String,
    pub description: Option<String>,
    pub debit_balance_before: Decimal,
    pub debit_balance_after: Decimal,
    pub credit_balance_before: Decimal,
    pub credit_balance_after: Decimal,
    pub status: EntryStatus,
    pub reverses_entry_id: Option<Uuid>,
    pub fiscal_year: i32,
    pub fiscal_period: i32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Both snapshots move by exactly `amount`
    pub fn snapshots_consistent(&self) -> bool {
        self.debit_balance_after == self.debit_balance_before - self.amount
            && self.credit_balance_after == self.credit_balance_before + self.amount
    }

    pub fn touches(&self, account: AccountRef) -> bool {
        self.debit_account == account || self.credit_account == account
    }

    /// Signed effect of this entry on `account`
    pub fn net_effect_on(&self, account: AccountRef) -> Decimal {
        let mut effect = Decimal::ZERO;
        if self.credit_account == account {
            effect += self.amount;
        }
        if self.debit_account == account {
            effect -= self.amount;
        }
        effect
    }
}

/// Fiscal year and month used for period reporting
pub fn fiscal_period_of(at: DateTime<Utc>) -> (i32, i32) {
    (at.year(), at.month() as i32)
}

/// Direction of a per-account transaction-log row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "debit" => Ok(Direction::Debit),
            "credit" => Ok(Direction::Credit),
            _ => Err(format!("Invalid direction: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }
}

/// Per-account movement row. A transfer writes one for each side; balance
/// locks write one with no ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLog {
    pub id: Uuid,
    pub ledger_entry_id: Option<Uuid>,
    pub account: AccountRef,
    pub direction: Direction,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

/// Whole-ledger sums used by the double-entry check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub entry_count: i64,
    pub total_debits: Decimal,
    pub total_credits: Decimal,
}

impl LedgerTotals {
    pub fn is_balanced(&self) -> bool {
        self.total_debits == self.total_credits
    }
}
