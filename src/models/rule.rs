//! Versioned jurisdiction rule sets and the deduction value types they carry

use crate::models::SystemAccountCode;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Figure a deduction percentage is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationBase {
    GrossWin,
    Stake,
    Payout,
    /// Gross figure minus everything deducted earlier in the pipeline
    NetProfit,
    Ggr,
    Turnover,
}

/// How a computed deduction is rounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Down to a whole currency unit
    Floor,
    /// Up to a whole currency unit
    Ceil,
    /// Nearest cent, midpoint away from zero
    #[default]
    #[serde(alias = "nearest_cent", alias = "round")]
    Normal,
}

impl RoundingMode {
    pub fn apply(&self, value: Decimal) -> Decimal {
        match self {
            RoundingMode::Floor => value.floor(),
            RoundingMode::Ceil => value.ceil(),
            RoundingMode::Normal => {
                value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
            }
        }
    }
}

/// When a player deduction is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionStage {
    /// On winnings, at bet settlement
    #[default]
    Settlement,
    /// On the stake, at bet placement (excise-style betting tax)
    Placement,
}

/// Which ordered list of a rule set a deduction belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionSide {
    Player,
    Operator,
}

fn default_enabled() -> bool {
    true
}

/// One named, percentage-based deduction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeductionRule {
    pub code: String,
    pub name: String,
    /// Percentage in the 0..=100 range
    pub percentage: Decimal,
    pub calculation_base: CalculationBase,
    /// Inclusive lower bound on the gross figure
    #[serde(default)]
    pub threshold: Decimal,
    #[serde(default)]
    pub rounding: RoundingMode,
    pub destination: SystemAccountCode,
    pub application_order: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub stage: DeductionStage,
}

impl DeductionRule {
    /// Check the rule is usable on the given side
    pub fn validate(&self, side: DeductionSide) -> Result<(), String> {
        if self.code.trim().is_empty() {
            return Err("Deduction code must not be empty".to_string());
        }
        if self.percentage < Decimal::ZERO || self.percentage > Decimal::ONE_HUNDRED {
            return Err(format!(
                "Deduction {} percentage must be between 0 and 100, got {}",
                self.code, self.percentage
            ));
        }
        if self.threshold < Decimal::ZERO {
            return Err(format!("Deduction {} threshold must not be negative", self.code));
        }

        let base_ok = match side {
            DeductionSide::Player => matches!(
                self.calculation_base,
                CalculationBase::GrossWin
                    | CalculationBase::Stake
                    | CalculationBase::Payout
                    | CalculationBase::NetProfit
            ),
            DeductionSide::Operator => matches!(
                self.calculation_base,
                CalculationBase::Ggr | CalculationBase::Turnover | CalculationBase::NetProfit
            ),
        };
        if !base_ok {
            return Err(format!(
                "Deduction {} uses base {:?} which is not available on the {:?} side",
                self.code, self.calculation_base, side
            ));
        }

        if self.stage == DeductionStage::Placement
            && (side == DeductionSide::Operator || self.calculation_base != CalculationBase::Stake)
        {
            return Err(format!(
                "Deduction {} is taken at placement and must be a player deduction on stake",
                self.code
            ));
        }

        Ok(())
    }
}

/// One applied deduction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeductionLine {
    pub code: String,
    pub name: String,
    pub calculation_base: CalculationBase,
    pub base_amount: Decimal,
    pub percentage: Decimal,
    pub amount: Decimal,
    pub destination: SystemAccountCode,
}

/// Ordered result of running a deduction pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeductionBreakdown {
    pub rule_id: Option<Uuid>,
    pub rule_version: Option<i32>,
    pub gross_amount: Decimal,
    pub lines: Vec<DeductionLine>,
    pub total_deducted: Decimal,
    pub net_amount: Decimal,
}

impl DeductionBreakdown {
    /// Breakdown used when no rule applies
    pub fn none(gross_amount: Decimal) -> Self {
        Self {
            rule_id: None,
            rule_version: None,
            gross_amount,
            lines: Vec::new(),
            total_deducted: Decimal::ZERO,
            net_amount: gross_amount.max(Decimal::ZERO),
        }
    }
}

/// Stake and payout limits of a jurisdiction
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BettingLimits {
    #[serde(default)]
    pub min_stake: Option<Decimal>,
    #[serde(default)]
    pub max_stake: Option<Decimal>,
    #[serde(default)]
    pub max_potential_win: Option<Decimal>,
}

/// Product switches of a jurisdiction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub live_betting: bool,
    pub casino: bool,
    pub virtual_sports: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            live_betting: true,
            casino: true,
            virtual_sports: true,
        }
    }
}

/// Agent commission terms; both figures are percentages
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommissionTerms {
    #[serde(default)]
    pub agent_rate: Decimal,
    #[serde(default)]
    pub platform_fee_percentage: Option<Decimal>,
}

/// Rule lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Active,
    Archived,
}

impl RuleStatus {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "active" => Ok(RuleStatus::Active),
            "archived" => Ok(RuleStatus::Archived),
            _ => Err(format!("Invalid rule status: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Active => "active",
            RuleStatus::Archived => "archived",
        }
    }
}

/// A versioned deduction configuration keyed by (country, profile, version)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JurisdictionRule {
    pub id: Uuid,
    pub country_code: String,
    pub profile_name: String,
    pub version: i32,
    pub status: RuleStatus,
    pub player_deductions: Vec<DeductionRule>,
    pub operator_deductions: Vec<DeductionRule>,
    pub limits: BettingLimits,
    pub features: FeatureFlags,
    pub commission: CommissionTerms,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
    pub previous_version_id: Option<Uuid>,
    pub created_by: String,
    pub change_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JurisdictionRule {
    /// `effective_from <= at < effective_to`
    pub fn is_effective_at(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.effective_to.map_or(true, |end| at < end)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.country_code.trim().is_empty() || self.profile_name.trim().is_empty() {
            return Err("Country code and profile name are required".to_string());
        }
        for deduction in &self.player_deductions {
            deduction.validate(DeductionSide::Player)?;
        }
        for deduction in &self.operator_deductions {
            deduction.validate(DeductionSide::Operator)?;
        }
        if let (Some(min), Some(max)) = (self.limits.min_stake, self.limits.max_stake) {
            if min > max {
                return Err(format!("min_stake {} exceeds max_stake {}", min, max));
            }
        }
        let rate = self.commission.agent_rate;
        if rate < Decimal::ZERO || rate > Decimal::ONE_HUNDRED {
            return Err(format!("Agent commission rate must be 0..=100, got {}", rate));
        }
        if let Some(fee) = self.commission.platform_fee_percentage {
            if fee < Decimal::ZERO || fee > Decimal::ONE_HUNDRED {
                return Err(format!("Platform fee must be 0..=100, got {}", fee));
            }
        }
        Ok(())
    }
}

/// Payload for the first version of a (country, profile) rule set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub country_code: String,
    pub profile_name: String,
    #[serde(default)]
    pub player_deductions: Vec<DeductionRule>,
    #[serde(default)]
    pub operator_deductions: Vec<DeductionRule>,
    #[serde(default)]
    pub limits: BettingLimits,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub commission: CommissionTerms,
    /// Defaults to now; may be backdated when importing historical rules
    #[serde(default)]
    pub effective_from: Option<DateTime<Utc>>,
}

impl NewRule {
    pub fn into_rule(self, created_by: &str) -> JurisdictionRule {
        let now = Utc::now();
        JurisdictionRule {
            id: Uuid::new_v4(),
            country_code: self.country_code.to_uppercase(),
            profile_name: self.profile_name,
            version: 1,
            status: RuleStatus::Active,
            player_deductions: self.player_deductions,
            operator_deductions: self.operator_deductions,
            limits: self.limits,
            features: self.features,
            commission: self.commission,
            effective_from: self.effective_from.unwrap_or(now),
            effective_to: None,
            previous_version_id: None,
            created_by: created_by.to_string(),
            change_reason: None,
            created_at: now,
        }
    }
}

/// Partial update used to derive the next version; `None` keeps the field
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub player_deductions: Option<Vec<DeductionRule>>,
    pub operator_deductions: Option<Vec<DeductionRule>>,
    pub limits: Option<BettingLimits>,
    pub features: Option<FeatureFlags>,
    pub commission: Option<CommissionTerms>,
}

impl RuleUpdate {
    /// Build version `current.version + 1`, effective from `at`
    pub fn next_version(
        self,
        current: &JurisdictionRule,
        at: DateTime<Utc>,
        created_by: &str,
        reason: &str,
    ) -> JurisdictionRule {
        JurisdictionRule {
            id: Uuid::new_v4(),
            country_code: current.country_code.clone(),
            profile_name: current.profile_name.clone(),
            version: current.version + 1,
            status: RuleStatus::Active,
            player_deductions: self
                .player_deductions
                .unwrap_or_else(|| current.player_deductions.clone()),
            operator_deductions: self
                .operator_deductions
                .unwrap_or_else(|| current.operator_deductions.clone()),
            limits: self.limits.unwrap_or_else(|| current.limits.clone()),
            features: self.features.unwrap_or(current.features),
            commission: self.commission.unwrap_or_else(|| current.commission.clone()),
            effective_from: at,
            effective_to: None,
            previous_version_id: Some(current.id),
            created_by: created_by.to_string(),
            change_reason: Some(reason.to_string()),
            created_at: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn win_tax() -> DeductionRule {
        DeductionRule {
            code: "win_tax".to_string(),
            name: "Winnings tax".to_string(),
            percentage: dec!(10),
            calculation_base: CalculationBase::GrossWin,
            threshold: Decimal::ZERO,
            rounding: RoundingMode::Normal,
            destination: SystemAccountCode::TaxPayable,
            application_order: 1,
            enabled: true,
            stage: DeductionStage::Settlement,
        }
    }

    #[test]
    fn test_rounding_modes() {
        assert_eq!(RoundingMode::Floor.apply(dec!(1.0999)), dec!(1));
        assert_eq!(RoundingMode::Ceil.apply(dec!(1.0001)), dec!(2));
        assert_eq!(RoundingMode::Normal.apply(dec!(1.005)), dec!(1.01));
        assert_eq!(RoundingMode::Normal.apply(dec!(15)), dec!(15.00));
    }

    #[test]
    fn test_deduction_validation() {
        assert!(win_tax().validate(DeductionSide::Player).is_ok());
        assert!(win_tax().validate(DeductionSide::Operator).is_err());

        let mut too_big = win_tax();
        too_big.percentage = dec!(101);
        assert!(too_big.validate(DeductionSide::Player).is_err());

        let mut placement_on_win = win_tax();
        placement_on_win.stage = DeductionStage::Placement;
        assert!(placement_on_win.validate(DeductionSide::Player).is_err());
    }

    #[test]
    fn test_deduction_deserializes_with_defaults() {
        let json = serde_json::json!({
            "code": "charity",
            "name": "Charity levy",
            "percentage": "2.5",
            "calculation_base": "net_profit",
            "rounding": "nearest_cent",
            "destination": "charity_payable",
            "application_order": 2
        });
        let rule: DeductionRule = serde_json::from_value(json).unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.threshold, Decimal::ZERO);
        assert_eq!(rule.rounding, RoundingMode::Normal);
        assert_eq!(rule.stage, DeductionStage::Settlement);
    }

    #[test]
    fn test_next_version_keeps_lineage() {
        let v1 = NewRule {
            country_code: "ke".to_string(),
            profile_name: "standard".to_string(),
            player_deductions: vec![win_tax()],
            operator_deductions: Vec::new(),
            limits: BettingLimits::default(),
            features: FeatureFlags::default(),
            commission: CommissionTerms::default(),
            effective_from: None,
        }
        .into_rule("admin");

        let now = Utc::now();
        let v2 = RuleUpdate::default().next_version(&v1, now, "admin", "tweak");

        assert_eq!(v1.country_code, "KE");
        assert_eq!(v2.version, 2);
        assert_eq!(v2.previous_version_id, Some(v1.id));
        assert_eq!(v2.player_deductions, v1.player_deductions);
        assert!(v2.is_effective_at(now));
    }
}
