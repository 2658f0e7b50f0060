//! Jurisdiction rule versions and the deduction pipeline.

use crate::directory::Directory;
use crate::error::{AppError, AppResult};
use crate::models::{
    BetType, CalculationBase, DeductionBreakdown, DeductionLine, DeductionRule, DeductionStage,
    JurisdictionRule, NewRule, RuleUpdate,
};
use crate::repositories::{LedgerStore, RuleArchive, UnitOfWork, ONE_ACTIVE_RULE_KEY};
use crate::services::audit::rule_version_draft;
use crate::services::locks::{LockKey, LockManager};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

// ===== PIPELINE =====

/// Figures a deduction can be computed on
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeductionInputs {
    /// Compared against thresholds and reduced to the net amount
    pub gross: Decimal,
    pub stake: Decimal,
    pub payout: Decimal,
    pub ggr: Decimal,
    pub turnover: Decimal,
    /// Starting point of the compounding `net_profit` base
    pub net_profit: Decimal,
}

impl DeductionInputs {
    pub fn for_win(gross_win: Decimal, stake: Decimal, payout: Decimal) -> Self {
        Self {
            gross: gross_win,
            stake,
            payout,
            net_profit: gross_win,
            ..Default::default()
        }
    }

    pub fn for_stake(stake: Decimal) -> Self {
        Self {
            gross: stake,
            stake,
            ..Default::default()
        }
    }

    pub fn for_operator(ggr: Decimal, turnover: Decimal, net_profit: Decimal) -> Self {
        Self {
            gross: ggr,
            ggr,
            turnover,
            net_profit,
            ..Default::default()
        }
    }

    fn base(&self, base: CalculationBase, deducted_so_far: Decimal) -> Decimal {
        match base {
            CalculationBase::GrossWin => self.gross,
            CalculationBase::Stake => self.stake,
            CalculationBase::Payout => self.payout,
            CalculationBase::NetProfit => (self.net_profit - deducted_so_far).max(Decimal::ZERO),
            CalculationBase::Ggr => self.ggr,
            CalculationBase::Turnover => self.turnover,
        }
    }
}

/// Run an ordered deduction list.
///
/// Enabled deductions (of `stage`, when given) are applied in ascending
/// `application_order`; the sort is stable so equal orders keep their
/// configured position. A threshold is inclusive. `net_profit` compounds on
/// everything deducted before it.
pub fn apply_deductions(
    deductions: &[DeductionRule],
    stage: Option<DeductionStage>,
    inputs: &DeductionInputs,
) -> (Vec<DeductionLine>, Decimal) {
    let mut ordered: Vec<&DeductionRule> = deductions
        .iter()
        .filter(|d| d.enabled && stage.map_or(true, |s| d.stage == s))
        .collect();
    ordered.sort_by_key(|d| d.application_order);

    let mut lines = Vec::new();
    let mut total = Decimal::ZERO;

    for deduction in ordered {
        if inputs.gross < deduction.threshold {
            continue;
        }
        let base = inputs.base(deduction.calculation_base, total);
        if base <= Decimal::ZERO {
            continue;
        }
        let amount = deduction
            .rounding
            .apply(base * deduction.percentage / Decimal::ONE_HUNDRED);
        if amount <= Decimal::ZERO {
            continue;
        }

        total += amount;
        lines.push(DeductionLine {
            code: deduction.code.clone(),
            name: deduction.name.clone(),
            calculation_base: deduction.calculation_base,
            base_amount: base,
            percentage: deduction.percentage,
            amount,
            destination: deduction.destination,
        });
    }

    (lines, total)
}

fn breakdown(rule: &JurisdictionRule, gross: Decimal, lines: Vec<DeductionLine>, total: Decimal) -> DeductionBreakdown {
    DeductionBreakdown {
        rule_id: Some(rule.id),
        rule_version: Some(rule.version),
        gross_amount: gross,
        lines,
        total_deducted: total,
        net_amount: (gross - total).max(Decimal::ZERO),
    }
}

/// Player deductions on a winning bet under a specific rule version
pub fn win_deductions(
    rule: &JurisdictionRule,
    gross_win: Decimal,
    stake: Decimal,
    payout: Decimal,
) -> DeductionBreakdown {
    let inputs = DeductionInputs::for_win(gross_win, stake, payout);
    let (lines, total) = apply_deductions(
        &rule.player_deductions,
        Some(DeductionStage::Settlement),
        &inputs,
    );
    breakdown(rule, gross_win, lines, total)
}

/// Operator deductions on a period's revenue under a specific rule version
pub fn operator_deductions(
    rule: &JurisdictionRule,
    ggr: Decimal,
    turnover: Decimal,
    net_profit: Decimal,
) -> DeductionBreakdown {
    let inputs = DeductionInputs::for_operator(ggr, turnover, net_profit);
    let (lines, total) = apply_deductions(&rule.operator_deductions, None, &inputs);
    breakdown(rule, ggr, lines, total)
}

// ===== PLACEMENT =====

/// Outcome of checking a bet against its jurisdiction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    /// Betting tax taken on the stake at placement
    pub stake_deductions: Vec<DeductionLine>,
    pub stake_tax_total: Decimal,
    pub rule_id: Option<Uuid>,
    pub rule_version: Option<i32>,
}

/// Limit and feature checks of one rule version
pub fn placement_errors(
    rule: &JurisdictionRule,
    stake: Decimal,
    potential_win: Decimal,
    bet_type: BetType,
    is_live: bool,
) -> Vec<String> {
    let mut errors = Vec::new();
    let limits = &rule.limits;

    if let Some(min) = limits.min_stake {
        if stake < min {
            errors.push(format!("Minimum stake is {}", min));
        }
    }
    if let Some(max) = limits.max_stake {
        if stake > max {
            errors.push(format!("Maximum stake is {}", max));
        }
    }
    if let Some(max) = limits.max_potential_win {
        if potential_win > max {
            errors.push(format!("Maximum potential win is {}", max));
        }
    }

    if is_live && !rule.features.live_betting {
        errors.push("Live betting is not available in this jurisdiction".to_string());
    }
    match bet_type {
        BetType::Casino if !rule.features.casino => {
            errors.push("Casino games are not available in this jurisdiction".to_string())
        }
        BetType::Virtual if !rule.features.virtual_sports => {
            errors.push("Virtual sports are not available in this jurisdiction".to_string())
        }
        _ => {}
    }

    errors
}

// ===== ENGINE =====

struct CachedRule {
    rule: JurisdictionRule,
    loaded_at: Instant,
}

fn cache_key(country_code: &str, profile_name: &str) -> (String, String) {
    (country_code.to_uppercase(), profile_name.to_string())
}

pub struct RuleEngine {
    store: Arc<dyn LedgerStore>,
    directory: Arc<dyn Directory>,
    locks: Arc<LockManager>,
    cache: RwLock<HashMap<(String, String), CachedRule>>,
    ttl: Duration,
}

impl RuleEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        directory: Arc<dyn Directory>,
        locks: Arc<LockManager>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            directory,
            locks,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// The active version in force right now, served from a short TTL cache
    pub async fn get_active_rule(&self, country_code: &str, profile_name: &str) -> AppResult<JurisdictionRule> {
        let key = cache_key(country_code, profile_name);
        let now = Utc::now();

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key) {
                if cached.loaded_at.elapsed() < self.ttl && cached.rule.is_effective_at(now) {
                    return Ok(cached.rule.clone());
                }
            }
        }

        let rule = self
            .store
            .find_active_rule(&key.0, &key.1)
            .await?
            .filter(|r| r.is_effective_at(now))
            .ok_or_else(|| AppError::RuleNotFound {
                country: key.0.clone(),
                profile: key.1.clone(),
            })?;

        self.cache.write().await.insert(
            key,
            CachedRule {
                rule: rule.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(rule)
    }

    /// A specific version by id, archived or not
    pub async fn get_rule(&self, rule_id: Uuid) -> AppResult<JurisdictionRule> {
        self.store
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Jurisdiction rule {} not found", rule_id)))
    }

    /// The version whose effective window contains `at`
    pub async fn get_rule_as_of(
        &self,
        country_code: &str,
        profile_name: &str,
        at: DateTime<Utc>,
    ) -> AppResult<JurisdictionRule> {
        let (country, profile) = cache_key(country_code, profile_name);
        let versions = self.store.rule_versions(&country, &profile).await?;
        versions
            .into_iter()
            .rev()
            .find(|r| r.is_effective_at(at))
            .ok_or(AppError::RuleNotFound { country, profile })
    }

    /// Every version, oldest first
    pub async fn rule_history(&self, country_code: &str, profile_name: &str) -> AppResult<Vec<JurisdictionRule>> {
        let (country, profile) = cache_key(country_code, profile_name);
        let versions = self.store.rule_versions(&country, &profile).await?;
        Ok(versions)
    }

    pub async fn invalidate(&self, country_code: &str, profile_name: &str) {
        self.cache
            .write()
            .await
            .remove(&cache_key(country_code, profile_name));
    }

    // =========================================================================
    // Versioning
    // =========================================================================

    /// Create version 1 of a (country, profile) rule set
    pub async fn create_rule(&self, new_rule: NewRule, created_by: &str) -> AppResult<JurisdictionRule> {
        let rule = new_rule.into_rule(created_by);
        rule.validate().map_err(AppError::Validation)?;

        let _lock = self.locks.acquire(vec![rule_lock(&rule)]).await?;
        if let Some(existing) = self
            .store
            .find_active_rule(&rule.country_code, &rule.profile_name)
            .await?
        {
            return Err(AppError::Validation(format!(
                "{}/{} already has active version {}; create a new version instead",
                rule.country_code, rule.profile_name, existing.version
            )));
        }

        let mut uow = UnitOfWork::new("rule.create");
        uow.audit.push(rule_version_draft(created_by, &rule, None));
        uow.rule_inserts.push(rule.clone());
        self.store.commit(uow).await?;

        self.invalidate(&rule.country_code, &rule.profile_name).await;
        info!(
            rule_id = %rule.id,
            country = %rule.country_code,
            profile = %rule.profile_name,
            "Jurisdiction rule created"
        );
        Ok(rule)
    }

    /// Archive the active version and insert its successor as one unit.
    ///
    /// `rule_id` must still be the active version when the lock is taken,
    /// otherwise the caller edited a stale copy and gets `Conflict`.
    pub async fn create_new_version(
        &self,
        rule_id: Uuid,
        updates: RuleUpdate,
        created_by: &str,
        reason: &str,
    ) -> AppResult<JurisdictionRule> {
        if reason.trim().is_empty() {
            return Err(AppError::Validation("A change reason is required".to_string()));
        }

        let target = self.get_rule(rule_id).await?;
        let _lock = self.locks.acquire(vec![rule_lock(&target)]).await?;

        let current = self
            .store
            .find_active_rule(&target.country_code, &target.profile_name)
            .await?
            .ok_or_else(|| AppError::RuleNotFound {
                country: target.country_code.clone(),
                profile: target.profile_name.clone(),
            })?;
        if current.id != rule_id {
            return Err(AppError::Conflict(format!(
                "Rule {} is no longer the active version of {}/{}",
                rule_id, current.country_code, current.profile_name
            )));
        }

        let now = Utc::now();
        let next = updates.next_version(&current, now, created_by, reason);
        next.validate().map_err(AppError::Validation)?;

        let mut uow = UnitOfWork::new("rule.new_version");
        uow.rule_archives.push(RuleArchive {
            rule_id: current.id,
            effective_to: now,
        });
        uow.rule_inserts.push(next.clone());
        uow.audit.push(rule_version_draft(created_by, &next, Some(&current)));
        self.store.commit(uow).await.map_err(|e| match AppError::from(e) {
            // Another replica activated a successor first
            AppError::Duplicate { constraint } if constraint == ONE_ACTIVE_RULE_KEY => {
                AppError::Conflict(format!(
                    "Rule {} was superseded while this version was being written",
                    rule_id
                ))
            }
            other => other,
        })?;

        self.invalidate(&next.country_code, &next.profile_name).await;
        info!(
            rule_id = %next.id,
            version = next.version,
            previous = %current.id,
            reason,
            "Jurisdiction rule version created"
        );
        Ok(next)
    }

    // =========================================================================
    // Calculation
    // =========================================================================

    /// Deductions on a winning bet under the tenant's active rule. A missing
    /// rule means no deductions.
    pub async fn calculate_win_deductions(
        &self,
        tenant_id: Uuid,
        gross_win: Decimal,
        stake: Decimal,
        payout: Decimal,
    ) -> AppResult<DeductionBreakdown> {
        match self.tenant_rule(tenant_id).await? {
            Some(rule) => Ok(win_deductions(&rule, gross_win, stake, payout)),
            None => Ok(DeductionBreakdown::none(gross_win)),
        }
    }

    /// Deductions on a winning bet under a rule already stamped on it
    pub fn calculate_with_rule(
        &self,
        rule: &JurisdictionRule,
        gross_win: Decimal,
        stake: Decimal,
        payout: Decimal,
    ) -> DeductionBreakdown {
        win_deductions(rule, gross_win, stake, payout)
    }

    pub async fn calculate_operator_deductions(
        &self,
        tenant_id: Uuid,
        ggr: Decimal,
        turnover: Decimal,
        net_profit: Decimal,
    ) -> AppResult<DeductionBreakdown> {
        match self.tenant_rule(tenant_id).await? {
            Some(rule) => Ok(operator_deductions(&rule, ggr, turnover, net_profit)),
            None => Ok(DeductionBreakdown::none(ggr)),
        }
    }

    /// Limits, feature flags and stake tax for a bet about to be placed
    pub async fn validate_bet_placement(
        &self,
        tenant_id: Uuid,
        stake: Decimal,
        potential_win: Decimal,
        bet_type: BetType,
        is_live: bool,
    ) -> AppResult<PlacementValidation> {
        let mut errors = Vec::new();
        if stake <= Decimal::ZERO {
            errors.push("Stake must be positive".to_string());
        }
        if potential_win < stake {
            errors.push("Potential win cannot be less than the stake".to_string());
        }

        let Some(rule) = self.tenant_rule(tenant_id).await? else {
            return Ok(PlacementValidation {
                valid: errors.is_empty(),
                errors,
                stake_deductions: Vec::new(),
                stake_tax_total: Decimal::ZERO,
                rule_id: None,
                rule_version: None,
            });
        };

        errors.extend(placement_errors(&rule, stake, potential_win, bet_type, is_live));
        let (stake_deductions, stake_tax_total) = apply_deductions(
            &rule.player_deductions,
            Some(DeductionStage::Placement),
            &DeductionInputs::for_stake(stake),
        );

        Ok(PlacementValidation {
            valid: errors.is_empty(),
            errors,
            stake_deductions,
            stake_tax_total,
            rule_id: Some(rule.id),
            rule_version: Some(rule.version),
        })
    }

    /// The tenant's active rule, or `None` with a warning when it has none
    async fn tenant_rule(&self, tenant_id: Uuid) -> AppResult<Option<JurisdictionRule>> {
        let tenant = self.directory.require_tenant(tenant_id).await?;
        match self
            .get_active_rule(&tenant.country_code, &tenant.profile_name)
            .await
        {
            Ok(rule) => Ok(Some(rule)),
            Err(AppError::RuleNotFound { country, profile }) => {
                warn!(%tenant_id, %country, %profile, "No active jurisdiction rule, applying no deductions");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn rule_lock(rule: &JurisdictionRule) -> LockKey {
    LockKey::Rule(format!("{}/{}", rule.country_code, rule.profile_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        BettingLimits, CommissionTerms, FeatureFlags, RoundingMode, SystemAccountCode,
    };
    use rust_decimal_macros::dec;

    fn deduction(code: &str, pct: Decimal, base: CalculationBase, order: i32) -> DeductionRule {
        DeductionRule {
            code: code.to_string(),
            name: code.to_string(),
            percentage: pct,
            calculation_base: base,
            threshold: Decimal::ZERO,
            rounding: RoundingMode::Normal,
            destination: SystemAccountCode::TaxPayable,
            application_order: order,
            enabled: true,
            stage: DeductionStage::Settlement,
        }
    }

    fn rule(player: Vec<DeductionRule>) -> JurisdictionRule {
        NewRule {
            country_code: "KE".to_string(),
            profile_name: "standard".to_string(),
            player_deductions: player,
            operator_deductions: Vec::new(),
            limits: BettingLimits {
                min_stake: Some(dec!(10)),
                max_stake: Some(dec!(1000)),
                max_potential_win: Some(dec!(50000)),
            },
            features: FeatureFlags {
                live_betting: false,
                casino: true,
                virtual_sports: true,
            },
            commission: CommissionTerms::default(),
            effective_from: None,
        }
        .into_rule("test")
    }

    #[test]
    fn test_win_tax_scenario() {
        let rule = rule(vec![deduction("win_tax", dec!(10), CalculationBase::GrossWin, 1)]);
        let result = win_deductions(&rule, dec!(150), dec!(100), dec!(250));

        assert_eq!(result.total_deducted, dec!(15.00));
        assert_eq!(result.net_amount, dec!(135.00));
        assert_eq!(result.lines[0].destination, SystemAccountCode::TaxPayable);
        assert_eq!(result.rule_version, Some(1));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut tax = deduction("win_tax", dec!(20), CalculationBase::GrossWin, 1);
        tax.threshold = dec!(500);
        let rule = rule(vec![tax]);

        assert_eq!(win_deductions(&rule, dec!(500), dec!(10), dec!(510)).total_deducted, dec!(100));
        assert!(win_deductions(&rule, dec!(499.99), dec!(10), dec!(509.99)).lines.is_empty());
    }

    #[test]
    fn test_floor_rounds_to_whole_units() {
        let mut tax = deduction("win_tax", dec!(10), CalculationBase::GrossWin, 1);
        tax.rounding = RoundingMode::Floor;
        let rule = rule(vec![tax]);

        let result = win_deductions(&rule, dec!(10.999), dec!(1), dec!(11.999));
        assert_eq!(result.total_deducted, dec!(1));
    }

    #[test]
    fn test_net_profit_compounds_in_order() {
        let rule_a = rule(vec![
            deduction("tax", dec!(20), CalculationBase::GrossWin, 1),
            deduction("levy", dec!(10), CalculationBase::NetProfit, 2),
        ]);
        // 20% of 1000 = 200, then 10% of (1000 - 200) = 80
        assert_eq!(win_deductions(&rule_a, dec!(1000), dec!(100), dec!(1100)).total_deducted, dec!(280));

        let rule_b = rule(vec![
            deduction("tax", dec!(20), CalculationBase::GrossWin, 2),
            deduction("levy", dec!(10), CalculationBase::NetProfit, 1),
        ]);
        // 10% of 1000 = 100, then 20% of 1000 = 200
        assert_eq!(win_deductions(&rule_b, dec!(1000), dec!(100), dec!(1100)).total_deducted, dec!(300));
    }

    #[test]
    fn test_disabled_and_placement_deductions_skipped_at_settlement() {
        let mut disabled = deduction("off", dec!(50), CalculationBase::GrossWin, 1);
        disabled.enabled = false;
        let mut excise = deduction("excise", dec!(12.5), CalculationBase::Stake, 2);
        excise.stage = DeductionStage::Placement;
        let rule = rule(vec![disabled, excise]);

        let result = win_deductions(&rule, dec!(100), dec!(100), dec!(200));
        assert!(result.lines.is_empty());
        assert_eq!(result.net_amount, dec!(100));

        let (lines, total) = apply_deductions(
            &rule.player_deductions,
            Some(DeductionStage::Placement),
            &DeductionInputs::for_stake(dec!(100)),
        );
        assert_eq!(lines.len(), 1);
        assert_eq!(total, dec!(12.50));
    }

    #[test]
    fn test_net_never_negative() {
        let rule = rule(vec![deduction("stake_tax", dec!(100), CalculationBase::Stake, 1)]);
        let result = win_deductions(&rule, dec!(10), dec!(100), dec!(110));
        assert_eq!(result.net_amount, Decimal::ZERO);
    }

    #[test]
    fn test_placement_limits_and_features() {
        let rule = rule(Vec::new());
        assert!(placement_errors(&rule, dec!(50), dec!(100), BetType::Single, false).is_empty());

        let errors = placement_errors(&rule, dec!(5), dec!(60000), BetType::Single, true);
        assert_eq!(errors.len(), 3);
    }
}
