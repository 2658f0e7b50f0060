//! Bet and casino-round inputs from the lifecycle sources, and the records
//! the engine keeps about them

use crate::models::DeductionLine;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetType {
    Single,
    Multiple,
    System,
    Casino,
    Virtual,
}

/// Final result reported by the bet lifecycle source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetResult {
    Won,
    Lost,
    Void,
}

impl BetResult {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "won" => Ok(BetResult::Won),
            "lost" => Ok(BetResult::Lost),
            "void" => Ok(BetResult::Void),
            _ => Err(format!("Invalid bet result: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            BetResult::Won => "won",
            BetResult::Lost => "lost",
            BetResult::Void => "void",
        }
    }
}

/// A bet about to be placed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetPlacement {
    pub bet_id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub stake: Decimal,
    pub currency: String,
    pub potential_win: Decimal,
    pub bet_type: BetType,
    pub is_live: bool,
    #[serde(default)]
    pub selections: Vec<String>,
}

/// Rule stamp and placement-time figures to persist on the bet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementDecision {
    pub bet_id: Uuid,
    pub currency: String,
    pub rule_id: Option<Uuid>,
    pub rule_version: Option<i32>,
    pub stake_deductions: Vec<DeductionLine>,
    pub stake_tax_total: Decimal,
}

/// Settlement callback from the bet lifecycle source. `rule_id` and
/// `rule_version` are the stamp returned at placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetSettlementRequest {
    pub bet_id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub stake: Decimal,
    pub payout: Decimal,
    pub currency: String,
    pub result: BetResult,
    pub rule_id: Option<Uuid>,
    pub rule_version: Option<i32>,
}

/// What a bet settlement did; unique per bet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetSettlementRecord {
    pub bet_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub result: BetResult,
    pub stake: Decimal,
    pub payout: Decimal,
    pub gross_win: Decimal,
    pub total_deducted: Decimal,
    /// Winnings credited after deductions (excludes the returned stake)
    pub net_win: Decimal,
    /// Everything credited to the player by this settlement
    pub amount_credited: Decimal,
    pub deductions: Vec<DeductionLine>,
    pub rule_id: Option<Uuid>,
    pub rule_version: Option<i32>,
    pub ledger_entry_ids: Vec<Uuid>,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WagerKind {
    Sports,
    Casino,
}

impl WagerKind {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "sports" => Ok(WagerKind::Sports),
            "casino" => Ok(WagerKind::Casino),
            _ => Err(format!("Invalid wager kind: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            WagerKind::Sports => "sports",
            WagerKind::Casino => "casino",
        }
    }
}

/// A settled bet or casino round, as read by GGR aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wager {
    /// Bet id or casino round id
    pub id: Uuid,
    pub kind: WagerKind,
    pub tenant_id: Uuid,
    pub player_id: Uuid,
    pub currency: String,
    pub stake: Decimal,
    pub payout: Decimal,
    pub settled_at: DateTime<Utc>,
}

/// Completed round from the casino settlement callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasinoRound {
    pub round_id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub currency: String,
    pub stake: Decimal,
    pub payout: Decimal,
    pub multiplier: Decimal,
    pub outcome: String,
    pub completed_at: DateTime<Utc>,
}
