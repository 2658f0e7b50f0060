use crate::config::SettlementConfig;
use crate::directory::{Agent, Directory, Tenant};
use crate::error::{AppError, AppResult};
use crate::models::{
    AccountRef, JurisdictionRule, LedgerEntry, OwnerType, Settlement, SettlementDeduction,
    SettlementKey, SettlementPeriod, SettlementStatus, SettlementType, TransactionType, WagerKind,
};
use crate::repositories::{LedgerStore, SETTLEMENT_PERIOD_KEY};
use crate::services::audit::settlement_draft;
use crate::services::rule_engine::RuleEngine;
use crate::services::wallet_service::{float_shortfall, Leg, TransferBatch, WalletService};
use chrono::{Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Actor stamped on pre-approved weekly settlements
pub const AUTO_APPROVER: &str = "system:weekly-settlement";

/// Stake and payout totals attributable to one agent over a period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentGgr {
    pub agent_id: Uuid,
    pub tenant_id: Uuid,
    pub period: SettlementPeriod,
    pub player_count: usize,
    pub wager_count: usize,
    pub sports_stake: Decimal,
    pub sports_payout: Decimal,
    pub casino_stake: Decimal,
    pub casino_payout: Decimal,
    pub total_stake: Decimal,
    pub total_payout: Decimal,
    /// `total_stake - total_payout`; negative when players won overall
    pub ggr: Decimal,
}

/// Calculated commission, before anything is written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionPreview {
    pub ggr: AgentGgr,
    pub currency: String,
    /// Percentage applied to GGR
    pub commission_rate: Decimal,
    pub gross_commission: Decimal,
    pub platform_fee_percentage: Decimal,
    pub platform_fee: Decimal,
    pub net_commission: Decimal,
    pub rule_id: Option<Uuid>,
    pub rule_version: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SkipReason {
    /// A completed settlement already exists for the period
    AlreadySettled { settlement_id: Uuid },
    /// Net commission was zero or negative
    NoCommission { net_commission: Decimal },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SettlementOutcome {
    Processed(Settlement),
    Skipped { agent_id: Uuid, reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub agent_id: Uuid,
    pub error: String,
}

/// Summary of one batch run over a tenant's agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRunReport {
    pub tenant_id: Uuid,
    pub period: SettlementPeriod,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total_paid: Decimal,
    pub settlement_ids: Vec<Uuid>,
    pub failures: Vec<AgentFailure>,
}

fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Weekly agent commission settlement
pub struct SettlementService {
    store: Arc<dyn LedgerStore>,
    wallets: Arc<WalletService>,
    rules: Arc<RuleEngine>,
    directory: Arc<dyn Directory>,
    config: SettlementConfig,
}

impl SettlementService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        wallets: Arc<WalletService>,
        rules: Arc<RuleEngine>,
        directory: Arc<dyn Directory>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            store,
            wallets,
            rules,
            directory,
            config,
        }
    }

    /// Sum sports bets and casino rounds of the agent's direct and downline
    /// players settled within the period
    pub async fn calculate_agent_ggr(
        &self,
        agent_id: Uuid,
        tenant_id: Uuid,
        period: SettlementPeriod,
    ) -> AppResult<AgentGgr> {
        let players = self.directory.attributed_players(agent_id).await?;
        let wagers = self
            .store
            .wagers_for_players(tenant_id, &players, &period)
            .await?;

        let mut ggr = AgentGgr {
            agent_id,
            tenant_id,
            period,
            player_count: players.len(),
            wager_count: wagers.len(),
            sports_stake: Decimal::ZERO,
            sports_payout: Decimal::ZERO,
            casino_stake: Decimal::ZERO,
            casino_payout: Decimal::ZERO,
            total_stake: Decimal::ZERO,
            total_payout: Decimal::ZERO,
            ggr: Decimal::ZERO,
        };

        for wager in &wagers {
            match wager.kind {
                WagerKind::Sports => {
                    ggr.sports_stake += wager.stake;
                    ggr.sports_payout += wager.payout;
                }
                WagerKind::Casino => {
                    ggr.casino_stake += wager.stake;
                    ggr.casino_payout += wager.payout;
                }
            }
        }
        ggr.total_stake = ggr.sports_stake + ggr.casino_stake;
        ggr.total_payout = ggr.sports_payout + ggr.casino_payout;
        ggr.ggr = ggr.total_stake - ggr.total_payout;

        Ok(ggr)
    }

    /// Commission the agent would receive for the period. Writes nothing.
    pub async fn preview_agent_settlement(
        &self,
        agent_id: Uuid,
        tenant_id: Uuid,
        period: SettlementPeriod,
    ) -> AppResult<CommissionPreview> {
        let (agent, tenant) = self.agent_and_tenant(agent_id, tenant_id).await?;
        let rule = self.rule_for_period(&tenant, &period).await?;
        let ggr = self.calculate_agent_ggr(agent_id, tenant_id, period).await?;
        Ok(self.commission(ggr, &agent, &tenant, rule.as_ref()))
    }

    /// Settle one agent for one period.
    ///
    /// Skips when a completed settlement exists or the net commission is not
    /// positive. Otherwise the commission-wallet credit and the completed
    /// settlement row commit together.
    pub async fn process_agent_settlement(
        &self,
        agent_id: Uuid,
        tenant_id: Uuid,
        period: SettlementPeriod,
        created_by: &str,
    ) -> AppResult<SettlementOutcome> {
        let key = SettlementKey {
            beneficiary_id: agent_id,
            settlement_type: SettlementType::AgentCommission,
            period,
        };

        let existing = self.store.find_settlement(&key).await?;
        if let Some(settlement) = existing.as_ref().filter(|s| s.is_completed()) {
            info!(%agent_id, settlement_id = %settlement.id, "Period already settled, skipping");
            return Ok(SettlementOutcome::Skipped {
                agent_id,
                reason: SkipReason::AlreadySettled {
                    settlement_id: settlement.id,
                },
            });
        }

        let preview = self
            .preview_agent_settlement(agent_id, tenant_id, period)
            .await?;
        if preview.net_commission <= Decimal::ZERO {
            info!(%agent_id, net = %preview.net_commission, "No commission due, skipping");
            return Ok(SettlementOutcome::Skipped {
                agent_id,
                reason: SkipReason::NoCommission {
                    net_commission: preview.net_commission,
                },
            });
        }

        let float = self.wallets.tenant_float(tenant_id, &preview.currency).await?;
        let commission_wallet = self
            .wallets
            .get_or_create_wallet(agent_id, OwnerType::AgentCommission, tenant_id, &preview.currency)
            .await?;

        let batch = TransferBatch::new(
            "settlement.agent_commission",
            tenant_id,
            &preview.currency,
            created_by,
            format!("settlement:{}:{}", agent_id, period.start.format("%Y-%m-%d")),
        )
        .transfer(
            Leg::new(
                AccountRef::Wallet(float.id),
                AccountRef::Wallet(commission_wallet.id),
                preview.net_commission,
                TransactionType::AgentCommission,
            )
            .describe(format!(
                "Commission {} to {}",
                period.start.format("%Y-%m-%d"),
                period.end.format("%Y-%m-%d")
            )),
        );
        let mut prepared = self
            .wallets
            .prepare(batch)
            .await
            .map_err(float_shortfall(float.id))?;

        let now = Utc::now();
        let settlement = Settlement {
            // A failed or draft row for the same key is completed in place
            id: existing.as_ref().map_or_else(Uuid::new_v4, |s| s.id),
            tenant_id,
            beneficiary_id: agent_id,
            settlement_type: SettlementType::AgentCommission,
            period_start: period.start,
            period_end: period.end,
            currency: preview.currency.clone(),
            total_stake: preview.ggr.total_stake,
            total_payout: preview.ggr.total_payout,
            ggr: preview.ggr.ggr,
            commission_rate: preview.commission_rate,
            gross_amount: preview.gross_commission,
            deductions: platform_fee_deduction(&preview),
            net_amount: preview.net_commission,
            status: SettlementStatus::Completed,
            rule_id: preview.rule_id,
            rule_version: preview.rule_version,
            ledger_entry_ids: prepared.entry_ids(),
            created_by: created_by.to_string(),
            approved_by: Some(AUTO_APPROVER.to_string()),
            approved_at: Some(now),
            processed_at: Some(now),
            completed_at: Some(now),
            created_at: existing.as_ref().map_or(now, |s| s.created_at),
        };
        prepared.uow.settlements.push(settlement.clone());
        prepared.uow.audit.push(settlement_draft(created_by, &settlement));

        let committed = self.wallets.commit(prepared).await.map_err(|e| match e {
            AppError::Duplicate { constraint } if constraint == SETTLEMENT_PERIOD_KEY => {
                AppError::DuplicateSettlement {
                    beneficiary_id: agent_id,
                    period_start: period.start,
                    period_end: period.end,
                }
            }
            other => other,
        });

        match committed {
            Ok(_) => {
                info!(
                    %agent_id,
                    settlement_id = %settlement.id,
                    wallet_id = %commission_wallet.id,
                    amount = %settlement.net_amount,
                    "Agent commission settled"
                );
                Ok(SettlementOutcome::Processed(settlement))
            }
            // Lost a race with a concurrent run for the same period
            Err(AppError::DuplicateSettlement { .. }) => self.skipped_as_settled(&key).await,
            Err(e) => Err(e),
        }
    }

    /// Settle every active agent of the tenant for the week before now
    pub async fn run_weekly_settlement(&self, tenant_id: Uuid) -> AppResult<SettlementRunReport> {
        let period = SettlementPeriod::previous_week(Utc::now());
        self.run_settlement_for_period(tenant_id, period).await
    }

    /// Best effort over all active agents: one agent's failure is recorded
    /// and the run moves on
    pub async fn run_settlement_for_period(
        &self,
        tenant_id: Uuid,
        period: SettlementPeriod,
    ) -> AppResult<SettlementRunReport> {
        let agents = self.directory.agents_for_tenant(tenant_id).await?;
        info!(
            %tenant_id,
            agents = agents.len(),
            period_start = %period.start,
            period_end = %period.end,
            "Starting commission settlement run"
        );

        let mut report = SettlementRunReport {
            tenant_id,
            period,
            processed: 0,
            skipped: 0,
            failed: 0,
            total_paid: Decimal::ZERO,
            settlement_ids: Vec::new(),
            failures: Vec::new(),
        };

        for agent in agents.iter().filter(|a| a.is_active()) {
            match self
                .process_agent_settlement(agent.id, tenant_id, period, AUTO_APPROVER)
                .await
            {
                Ok(SettlementOutcome::Processed(settlement)) => {
                    report.processed += 1;
                    report.total_paid += settlement.net_amount;
                    report.settlement_ids.push(settlement.id);
                }
                Ok(SettlementOutcome::Skipped { .. }) => report.skipped += 1,
                Err(e) => {
                    error!(agent_id = %agent.id, "Commission settlement failed: {}", e);
                    report.failed += 1;
                    report.failures.push(AgentFailure {
                        agent_id: agent.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            %tenant_id,
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            total_paid = %report.total_paid,
            "Commission settlement run finished"
        );
        Ok(report)
    }

    /// Move earned commission to the agent's main wallet
    pub async fn withdraw_commission(
        &self,
        agent_id: Uuid,
        tenant_id: Uuid,
        amount: Decimal,
        created_by: &str,
    ) -> AppResult<LedgerEntry> {
        let (_, tenant) = self.agent_and_tenant(agent_id, tenant_id).await?;
        let currency = tenant.base_currency.as_str();

        let commission_wallet = self
            .wallets
            .get_or_create_wallet(agent_id, OwnerType::AgentCommission, tenant_id, currency)
            .await?;
        let main_wallet = self
            .wallets
            .get_or_create_wallet(agent_id, OwnerType::Agent, tenant_id, currency)
            .await?;

        let entry = self
            .wallets
            .atomic_transfer(
                commission_wallet.id,
                main_wallet.id,
                amount,
                TransactionType::CommissionWithdrawal,
                &format!("commission-withdrawal:{}", Uuid::new_v4()),
                created_by,
            )
            .await?;
        info!(%agent_id, %amount, entry_id = %entry.id, "Commission withdrawn");
        Ok(entry)
    }

    /// Recompute a stored settlement under the rule version it was stamped
    /// with. Writes nothing.
    pub async fn recalculate_settlement(&self, settlement_id: Uuid) -> AppResult<CommissionPreview> {
        let settlement = self
            .store
            .get_settlement(settlement_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Settlement {} not found", settlement_id)))?;
        let (agent, tenant) = self
            .agent_and_tenant(settlement.beneficiary_id, settlement.tenant_id)
            .await?;

        let rule = match settlement.rule_id {
            Some(rule_id) => Some(self.rules.get_rule(rule_id).await?),
            None => None,
        };
        let period = SettlementPeriod {
            start: settlement.period_start,
            end: settlement.period_end,
        };
        let ggr = self
            .calculate_agent_ggr(agent.id, settlement.tenant_id, period)
            .await?;
        Ok(self.commission(ggr, &agent, &tenant, rule.as_ref()))
    }

    pub async fn list_settlements(&self, tenant_id: Uuid) -> AppResult<Vec<Settlement>> {
        Ok(self.store.list_settlements(tenant_id, None).await?)
    }

    // ===== helpers =====

    async fn agent_and_tenant(&self, agent_id: Uuid, tenant_id: Uuid) -> AppResult<(Agent, Tenant)> {
        let agent = self
            .directory
            .agent(agent_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Agent {} not found", agent_id)))?;
        if agent.tenant_id != tenant_id {
            return Err(AppError::Validation(format!(
                "Agent {} does not belong to tenant {}",
                agent_id, tenant_id
            )));
        }
        let tenant = self.directory.require_tenant(tenant_id).await?;
        Ok((agent, tenant))
    }

    /// The version in force on the last instant of the period, falling back
    /// to the active one
    async fn rule_for_period(&self, tenant: &Tenant, period: &SettlementPeriod) -> AppResult<Option<JurisdictionRule>> {
        let last_instant = period.end - Duration::microseconds(1);
        match self
            .rules
            .get_rule_as_of(&tenant.country_code, &tenant.profile_name, last_instant)
            .await
        {
            Ok(rule) => return Ok(Some(rule)),
            Err(AppError::RuleNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        match self
            .rules
            .get_active_rule(&tenant.country_code, &tenant.profile_name)
            .await
        {
            Ok(rule) => {
                warn!(tenant_id = %tenant.id, "No rule effective in settlement period, using the active rule");
                Ok(Some(rule))
            }
            Err(AppError::RuleNotFound { country, profile }) => {
                warn!(tenant_id = %tenant.id, %country, %profile, "No jurisdiction rule for settlement");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn commission(
        &self,
        ggr: AgentGgr,
        agent: &Agent,
        tenant: &Tenant,
        rule: Option<&JurisdictionRule>,
    ) -> CommissionPreview {
        let commission_rate = agent
            .commission_rate
            .or_else(|| rule.map(|r| r.commission.agent_rate))
            .unwrap_or(Decimal::ZERO);
        let platform_fee_percentage = rule
            .and_then(|r| r.commission.platform_fee_percentage)
            .unwrap_or(self.config.platform_fee_percentage);

        let gross_commission = round_cents(ggr.ggr * commission_rate / Decimal::ONE_HUNDRED);
        let platform_fee = if gross_commission > Decimal::ZERO {
            round_cents(gross_commission * platform_fee_percentage / Decimal::ONE_HUNDRED)
        } else {
            Decimal::ZERO
        };

        CommissionPreview {
            ggr,
            currency: tenant.base_currency.clone(),
            commission_rate,
            gross_commission,
            platform_fee_percentage,
            platform_fee,
            net_commission: gross_commission - platform_fee,
            rule_id: rule.map(|r| r.id),
            rule_version: rule.map(|r| r.version),
        }
    }

    async fn skipped_as_settled(&self, key: &SettlementKey) -> AppResult<SettlementOutcome> {
        let settlement = self
            .store
            .find_settlement(key)
            .await?
            .ok_or_else(|| AppError::Conflict("settlement vanished after duplicate".to_string()))?;
        info!(agent_id = %key.beneficiary_id, "Concurrent run settled this period first");
        Ok(SettlementOutcome::Skipped {
            agent_id: key.beneficiary_id,
            reason: SkipReason::AlreadySettled {
                settlement_id: settlement.id,
            },
        })
    }
}

fn platform_fee_deduction(preview: &CommissionPreview) -> Vec<SettlementDeduction> {
    if preview.platform_fee.is_zero() {
        return Vec::new();
    }
    vec![SettlementDeduction {
        code: "platform_fee".to_string(),
        name: "Platform fee".to_string(),
        percentage: preview.platform_fee_percentage,
        amount: preview.platform_fee,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_cents() {
        assert_eq!(round_cents(dec!(12.345)), dec!(12.35));
        assert_eq!(round_cents(dec!(-12.345)), dec!(-12.35));
        assert_eq!(round_cents(dec!(7)), dec!(7.00));
    }
}
