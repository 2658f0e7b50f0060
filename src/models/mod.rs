//! Domain models for the ledger core.
//!
//! Plain value types shared by the stores and services. Enumerations carry
//! `as_str`/`from_str` pairs for their text columns.

pub mod audit;
pub mod ledger;
pub mod rule;
pub mod settlement;
pub mod system_account;
pub mod wager;
pub mod wallet;

// Re-export all models for convenient access
pub use audit::{AuditDraft, AuditRecord, GENESIS_CHECKSUM};
pub use ledger::{
    fiscal_period_of, AccountRef, Direction, EntryStatus, LedgerEntry, LedgerTotals,
    TransactionLog, TransactionType,
};
pub use rule::{
    BettingLimits, CalculationBase, CommissionTerms, DeductionBreakdown, DeductionLine,
    DeductionRule, DeductionSide, DeductionStage, FeatureFlags, JurisdictionRule, NewRule,
    RoundingMode, RuleStatus, RuleUpdate,
};
pub use settlement::{
    Settlement, SettlementDeduction, SettlementKey, SettlementPeriod, SettlementStatus,
    SettlementType,
};
pub use system_account::{SystemAccount, SystemAccountCode};
pub use wager::{
    BetPlacement, BetResult, BetSettlementRecord, BetSettlementRequest, BetType, CasinoRound,
    PlacementDecision, Wager, WagerKind,
};
pub use wallet::{OwnerType, Wallet, WalletOwner, WalletStatus};
