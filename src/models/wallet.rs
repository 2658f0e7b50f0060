use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wallet status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletStatus {
    Active,
    Frozen,
    Suspended,
    Closed,
}

impl WalletStatus {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "active" => Ok(WalletStatus::Active),
            "frozen" => Ok(WalletStatus::Frozen),
            "suspended" => Ok(WalletStatus::Suspended),
            "closed" => Ok(WalletStatus::Closed),
            _ => Err(format!("Invalid wallet status: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletStatus::Active => "active",
            WalletStatus::Frozen => "frozen",
            WalletStatus::Suspended => "suspended",
            WalletStatus::Closed => "closed",
        }
    }
}

/// Kind of identity that owns a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    Player,
    /// Agent float wallet used to fund player transactions
    Agent,
    /// Commission earnings, kept apart from the agent float
    AgentCommission,
    TenantFloat,
    System,
}

impl OwnerType {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "player" => Ok(OwnerType::Player),
            "agent" => Ok(OwnerType::Agent),
            "agent_commission" => Ok(OwnerType::AgentCommission),
            "tenant_float" => Ok(OwnerType::TenantFloat),
            "system" => Ok(OwnerType::System),
            _ => Err(format!("Invalid owner type: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::Player => "player",
            OwnerType::Agent => "agent",
            OwnerType::AgentCommission => "agent_commission",
            OwnerType::TenantFloat => "tenant_float",
            OwnerType::System => "system",
        }
    }
}

/// Balance record for a single owner.
///
/// `available_balance + locked_balance` always equals the net of every ledger
/// movement that touched this wallet since it was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub currency: String,
    pub available_balance: Decimal,
    pub locked_balance: Decimal,
    pub status: WalletStatus,
    /// Optimistic concurrency token, bumped by the store on every write
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Create an empty active wallet
    pub fn new(tenant_id: Uuid, currency: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            currency: currency.to_uppercase(),
            available_balance: Decimal::ZERO,
            locked_balance: Decimal::ZERO,
            status: WalletStatus::Active,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Total balance (available + locked), the figure ledger snapshots record
    pub fn total_balance(&self) -> Decimal {
        self.available_balance + self.locked_balance
    }

    pub fn is_active(&self) -> bool {
        self.status == WalletStatus::Active
    }

    /// Frozen, suspended and closed wallets cannot spend
    pub fn can_debit(&self) -> bool {
        self.status == WalletStatus::Active
    }

    /// Only closed wallets refuse incoming funds
    pub fn can_credit(&self) -> bool {
        self.status != WalletStatus::Closed
    }
}

/// Maps an (owner_type, owner_id) identity to the wallet it currently uses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletOwner {
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
    pub wallet_id: Uuid,
    pub created_at: DateTime<Utc>,
}
