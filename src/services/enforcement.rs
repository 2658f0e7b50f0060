//! Bet placement and settlement under jurisdiction rules.
//!
//! Stakes flow from the player wallet into the tenant float; refunds,
//! returned stakes and winnings flow back out of it. Deductions on winnings
//! are paid from the float into their destination system accounts, so the
//! float's outflow on a winning bet equals the payout.

use crate::directory::{Directory, Tenant};
use crate::error::{AppError, AppResult};
use crate::models::{
    AccountRef, AuditDraft, BetPlacement, BetResult, BetSettlementRecord, BetSettlementRequest,
    CasinoRound, DeductionBreakdown, DeductionLine, JurisdictionRule, OwnerType,
    PlacementDecision, TransactionType, Wager, WagerKind, Wallet,
};
use crate::repositories::{LedgerStore, UnitOfWork, BET_SETTLEMENT_KEY, WAGER_KEY};
use crate::services::audit::bet_settlement_draft;
use crate::services::rule_engine::RuleEngine;
use crate::services::wallet_service::{float_shortfall, Leg, TransferBatch, WalletService};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What placing a bet did
#[derive(Debug, Clone)]
pub struct PlacementOutcome {
    pub decision: PlacementDecision,
    pub entry_ids: Vec<Uuid>,
    pub wallet: Wallet,
}

/// What a settlement callback did. A repeated callback returns the stored
/// record with `already_settled` set and no wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetSettlementOutcome {
    pub record: BetSettlementRecord,
    pub already_settled: bool,
    pub wallet: Option<Wallet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasinoRoundOutcome {
    pub wager: Wager,
    pub already_recorded: bool,
}

pub struct EnforcementEngine {
    store: Arc<dyn LedgerStore>,
    wallets: Arc<WalletService>,
    rules: Arc<RuleEngine>,
    directory: Arc<dyn Directory>,
}

impl EnforcementEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        wallets: Arc<WalletService>,
        rules: Arc<RuleEngine>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            store,
            wallets,
            rules,
            directory,
        }
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Check a bet against its tenant's currency and jurisdiction, returning
    /// the rule stamp to persist on it
    pub async fn enforce_rules(&self, bet: &BetPlacement) -> AppResult<PlacementDecision> {
        let tenant = self.directory.require_tenant(bet.tenant_id).await?;
        check_currency(&tenant, &bet.currency)?;

        let validation = self
            .rules
            .validate_bet_placement(
                bet.tenant_id,
                bet.stake,
                bet.potential_win,
                bet.bet_type,
                bet.is_live,
            )
            .await?;
        if !validation.valid {
            return Err(AppError::Validation(validation.errors.join("; ")));
        }

        Ok(PlacementDecision {
            bet_id: bet.bet_id,
            currency: tenant.base_currency,
            rule_id: validation.rule_id,
            rule_version: validation.rule_version,
            stake_deductions: validation.stake_deductions,
            stake_tax_total: validation.stake_tax_total,
        })
    }

    /// Enforce rules, then move the stake into the tenant float and route any
    /// stake tax out of it, as one unit
    pub async fn place_bet(&self, bet: &BetPlacement, created_by: &str) -> AppResult<PlacementOutcome> {
        let decision = self.enforce_rules(bet).await?;
        let tenant = self.directory.require_tenant(bet.tenant_id).await?;

        let player = self
            .wallets
            .get_or_create_wallet(bet.user_id, OwnerType::Player, bet.tenant_id, &decision.currency)
            .await?;
        let float = self.wallets.tenant_float(bet.tenant_id, &decision.currency).await?;

        let mut batch = TransferBatch::new(
            "bet.placed",
            bet.tenant_id,
            &decision.currency,
            created_by,
            bet.bet_id.to_string(),
        )
        .transfer(Leg::new(
            AccountRef::Wallet(player.id),
            AccountRef::Wallet(float.id),
            bet.stake,
            TransactionType::BetPlacement,
        ));
        for leg in self.deduction_legs(&tenant, float.id, &decision.stake_deductions).await? {
            batch.push(leg);
        }

        let outcome = self.wallets.execute(batch).await?;
        let wallet = outcome
            .wallet(player.id)
            .cloned()
            .ok_or_else(|| AppError::WalletNotFound(player.id.to_string()))?;

        info!(
            bet_id = %bet.bet_id,
            wallet_id = %player.id,
            stake = %bet.stake,
            stake_tax = %decision.stake_tax_total,
            rule_version = ?decision.rule_version,
            "Bet placed"
        );

        Ok(PlacementOutcome {
            entry_ids: outcome.entries.iter().map(|e| e.id).collect(),
            decision,
            wallet,
        })
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    /// Settle a bet using the rule version stamped on it at placement.
    ///
    /// Every deduction, the player credit, the bet-settlement record and the
    /// wager row commit together. A bet settles once; later callbacks get
    /// the stored outcome back.
    pub async fn settle_bet_with_rules(
        &self,
        request: &BetSettlementRequest,
        created_by: &str,
    ) -> AppResult<BetSettlementOutcome> {
        if let Some(record) = self.store.find_bet_settlement(request.bet_id).await? {
            info!(bet_id = %request.bet_id, "Bet already settled");
            return Ok(BetSettlementOutcome {
                record,
                already_settled: true,
                wallet: None,
            });
        }

        if request.stake < Decimal::ZERO || request.payout < Decimal::ZERO {
            return Err(AppError::Validation(
                "Stake and payout must not be negative".to_string(),
            ));
        }

        let tenant = self.directory.require_tenant(request.tenant_id).await?;
        check_currency(&tenant, &request.currency)?;
        let currency = tenant.base_currency.clone();

        let player = self
            .wallets
            .get_or_create_wallet(request.user_id, OwnerType::Player, request.tenant_id, &currency)
            .await?;
        let float = self.wallets.tenant_float(request.tenant_id, &currency).await?;
        let player_ref = AccountRef::Wallet(player.id);
        let float_ref = AccountRef::Wallet(float.id);

        let mut batch = TransferBatch::new(
            "bet.settled",
            request.tenant_id,
            &currency,
            created_by,
            request.bet_id.to_string(),
        );

        let (breakdown, stake_return, recorded_payout) = match request.result {
            BetResult::Won => {
                if request.payout <= Decimal::ZERO {
                    return Err(AppError::Validation(
                        "A winning bet needs a positive payout".to_string(),
                    ));
                }
                let gross_win = (request.payout - request.stake).max(Decimal::ZERO);
                let breakdown = self.win_breakdown(request, gross_win).await?;
                let stake_return = request.stake.min(request.payout);

                if stake_return > Decimal::ZERO {
                    batch.push(Leg::new(
                        float_ref,
                        player_ref,
                        stake_return,
                        TransactionType::BetStakeReturn,
                    ));
                }
                if breakdown.net_amount > Decimal::ZERO {
                    batch.push(Leg::new(
                        float_ref,
                        player_ref,
                        breakdown.net_amount,
                        TransactionType::BetWinning,
                    ));
                }
                for leg in self.deduction_legs(&tenant, float.id, &breakdown.lines).await? {
                    batch.push(leg);
                }
                (breakdown, stake_return, request.payout)
            }
            BetResult::Lost => {
                // Audit trail only; the stake already moved at placement
                batch.push(Leg::new(
                    player_ref,
                    float_ref,
                    Decimal::ZERO,
                    TransactionType::BetLoss,
                ));
                (DeductionBreakdown::none(Decimal::ZERO), Decimal::ZERO, Decimal::ZERO)
            }
            BetResult::Void => {
                if request.stake <= Decimal::ZERO {
                    return Err(AppError::Validation(
                        "A void bet needs a positive stake to refund".to_string(),
                    ));
                }
                batch.push(Leg::new(
                    float_ref,
                    player_ref,
                    request.stake,
                    TransactionType::BetRefund,
                ));
                (DeductionBreakdown::none(Decimal::ZERO), request.stake, request.stake)
            }
        };

        let mut prepared = self
            .wallets
            .prepare(batch)
            .await
            .map_err(float_shortfall(float.id))?;
        let now = Utc::now();

        let record = BetSettlementRecord {
            bet_id: request.bet_id,
            tenant_id: request.tenant_id,
            user_id: request.user_id,
            result: request.result,
            stake: request.stake,
            payout: recorded_payout,
            gross_win: breakdown.gross_amount,
            total_deducted: breakdown.total_deducted,
            net_win: breakdown.net_amount,
            amount_credited: stake_return + breakdown.net_amount,
            deductions: breakdown.lines.clone(),
            rule_id: breakdown.rule_id,
            rule_version: breakdown.rule_version,
            ledger_entry_ids: prepared.entry_ids(),
            settled_at: now,
        };

        // Void bets never count towards revenue
        if request.result != BetResult::Void {
            prepared.uow.wagers.push(Wager {
                id: request.bet_id,
                kind: WagerKind::Sports,
                tenant_id: request.tenant_id,
                player_id: request.user_id,
                currency: currency.clone(),
                stake: request.stake,
                payout: recorded_payout,
                settled_at: now,
            });
        }
        prepared.uow.bet_settlements.push(record.clone());
        prepared.uow.audit.push(bet_settlement_draft(created_by, &record));

        match self.wallets.commit(prepared).await {
            Ok(outcome) => {
                info!(
                    bet_id = %record.bet_id,
                    wallet_id = %player.id,
                    result = record.result.as_str(),
                    amount = %record.amount_credited,
                    deducted = %record.total_deducted,
                    "Bet settled"
                );
                Ok(BetSettlementOutcome {
                    wallet: outcome.wallet(player.id).cloned(),
                    record,
                    already_settled: false,
                })
            }
            Err(AppError::Duplicate { constraint })
                if constraint == BET_SETTLEMENT_KEY || constraint == WAGER_KEY =>
            {
                // Lost a race with a concurrent callback for the same bet
                let record = self
                    .store
                    .find_bet_settlement(request.bet_id)
                    .await?
                    .ok_or(AppError::Duplicate { constraint })?;
                Ok(BetSettlementOutcome {
                    record,
                    already_settled: true,
                    wallet: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Deductions on a win: the stamped rule version when the bet carries
    /// one, the tenant's active rule otherwise
    async fn win_breakdown(
        &self,
        request: &BetSettlementRequest,
        gross_win: Decimal,
    ) -> AppResult<DeductionBreakdown> {
        if let Some(rule) = self.stamped_rule(request).await? {
            return Ok(self
                .rules
                .calculate_with_rule(&rule, gross_win, request.stake, request.payout));
        }
        self.rules
            .calculate_win_deductions(request.tenant_id, gross_win, request.stake, request.payout)
            .await
    }

    async fn stamped_rule(&self, request: &BetSettlementRequest) -> AppResult<Option<JurisdictionRule>> {
        let Some(rule_id) = request.rule_id else {
            return Ok(None);
        };

        match self.rules.get_rule(rule_id).await {
            Ok(rule) => {
                if let Some(version) = request.rule_version {
                    if version != rule.version {
                        return Err(AppError::Validation(format!(
                            "Bet {} is stamped with rule {} version {}, but that rule is version {}",
                            request.bet_id, rule_id, version, rule.version
                        )));
                    }
                }
                Ok(Some(rule))
            }
            Err(e) if e.is_not_found() => {
                warn!(bet_id = %request.bet_id, %rule_id, "Stamped rule missing, using the active rule");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// One leg per deduction line, float to the line's system account
    async fn deduction_legs(
        &self,
        tenant: &Tenant,
        float_id: Uuid,
        lines: &[DeductionLine],
    ) -> AppResult<Vec<Leg>> {
        let mut legs = Vec::with_capacity(lines.len());
        for line in lines.iter().filter(|l| l.amount > Decimal::ZERO) {
            let account = self
                .wallets
                .system_account(
                    line.destination,
                    Some(tenant.id),
                    Some(&tenant.country_code),
                    &tenant.base_currency,
                )
                .await?;
            legs.push(
                Leg::new(
                    AccountRef::Wallet(float_id),
                    AccountRef::System(account.id),
                    line.amount,
                    TransactionType::TaxDeduction,
                )
                .describe(line.code.clone()),
            );
        }
        Ok(legs)
    }

    // =========================================================================
    // Casino
    // =========================================================================

    /// Store a completed casino round for revenue aggregation; idempotent per
    /// round id
    pub async fn record_casino_round(&self, round: &CasinoRound, created_by: &str) -> AppResult<CasinoRoundOutcome> {
        if round.stake < Decimal::ZERO || round.payout < Decimal::ZERO {
            return Err(AppError::Validation(
                "Stake and payout must not be negative".to_string(),
            ));
        }
        let tenant = self.directory.require_tenant(round.tenant_id).await?;
        check_currency(&tenant, &round.currency)?;

        let wager = Wager {
            id: round.round_id,
            kind: WagerKind::Casino,
            tenant_id: round.tenant_id,
            player_id: round.user_id,
            currency: tenant.base_currency.clone(),
            stake: round.stake,
            payout: round.payout,
            settled_at: round.completed_at,
        };

        let mut uow = UnitOfWork::new("casino.round");
        uow.wagers.push(wager.clone());
        uow.audit.push(AuditDraft::new(
            "casino.round_recorded",
            created_by,
            "casino_round",
            round.round_id,
            serde_json::json!({
                "stake": round.stake.to_string(),
                "payout": round.payout.to_string(),
                "multiplier": round.multiplier.to_string(),
                "outcome": round.outcome,
            }),
        ));

        match self.store.commit(uow).await.map_err(AppError::from) {
            Ok(_) => Ok(CasinoRoundOutcome {
                wager,
                already_recorded: false,
            }),
            Err(AppError::Duplicate { constraint }) if constraint == WAGER_KEY => {
                info!(round_id = %round.round_id, "Casino round already recorded");
                Ok(CasinoRoundOutcome {
                    wager,
                    already_recorded: true,
                })
            }
            Err(e) => Err(e),
        }
    }
}

fn check_currency(tenant: &Tenant, currency: &str) -> AppResult<()> {
    if !tenant.base_currency.eq_ignore_ascii_case(currency) {
        return Err(AppError::CurrencyMismatch {
            expected: tenant.base_currency.clone(),
            actual: currency.to_uppercase(),
        });
    }
    Ok(())
}
