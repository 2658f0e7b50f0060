use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Named non-player accounts that deductions and external flows route into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemAccountCode {
    TaxPayable,
    CharityPayable,
    LevyPayable,
    OperatorRevenue,
    CommissionPool,
    /// Contra account for admin balance corrections
    ManualAdjustment,
    /// Mirrors deposits and withdrawals already settled with a payment provider
    PaymentClearing,
}

impl SystemAccountCode {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "tax_payable" => Ok(Self::TaxPayable),
            "charity_payable" => Ok(Self::CharityPayable),
            "levy_payable" => Ok(Self::LevyPayable),
            "operator_revenue" => Ok(Self::OperatorRevenue),
            "commission_pool" => Ok(Self::CommissionPool),
            "manual_adjustment" => Ok(Self::ManualAdjustment),
            "payment_clearing" => Ok(Self::PaymentClearing),
            _ => Err(format!("Invalid system account code: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaxPayable => "tax_payable",
            Self::CharityPayable => "charity_payable",
            Self::LevyPayable => "levy_payable",
            Self::OperatorRevenue => "operator_revenue",
            Self::CommissionPool => "commission_pool",
            Self::ManualAdjustment => "manual_adjustment",
            Self::PaymentClearing => "payment_clearing",
        }
    }
}

impl fmt::Display for SystemAccountCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running balance of a deduction destination, optionally scoped to a tenant.
///
/// Unlike wallets, clearing and adjustment accounts may run negative: they
/// mirror money that lives outside the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAccount {
    pub id: Uuid,
    pub code: SystemAccountCode,
    pub tenant_id: Option<Uuid>,
    pub country_code: Option<String>,
    pub currency: String,
    pub balance: Decimal,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SystemAccount {
    pub fn new(
        code: SystemAccountCode,
        tenant_id: Option<Uuid>,
        country_code: Option<&str>,
        currency: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            code,
            tenant_id,
            country_code: country_code.map(|c| c.to_uppercase()),
            currency: currency.to_uppercase(),
            balance: Decimal::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
