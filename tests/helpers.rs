#![allow(dead_code)]

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sportsbook_ledger::directory::{Agent, AgentStatus, StaticDirectory, Tenant};
use sportsbook_ledger::models::*;
use sportsbook_ledger::repositories::MemoryStore;
use sportsbook_ledger::{AppConfig, AppState};
use std::sync::Arc;
use uuid::Uuid;

pub const CURRENCY: &str = "KES";
pub const COUNTRY: &str = "KE";
pub const PROFILE: &str = "standard";
pub const ACTOR: &str = "test-suite";

/// Float balance every context starts with
pub const FLOAT_SEED: Decimal = dec!(1000000);

pub fn test_tenant() -> Tenant {
    Tenant {
        id: Uuid::new_v4(),
        name: "Test Sportsbook".to_string(),
        base_currency: CURRENCY.to_string(),
        country_code: COUNTRY.to_string(),
        profile_name: PROFILE.to_string(),
    }
}

pub fn test_agent(tenant_id: Uuid, parent: Option<Uuid>, players: Vec<Uuid>) -> Agent {
    Agent {
        id: Uuid::new_v4(),
        tenant_id,
        name: "Test Agent".to_string(),
        parent_agent_id: parent,
        commission_rate: None,
        status: AgentStatus::Active,
        player_ids: players,
    }
}

pub fn deduction(
    code: &str,
    percentage: Decimal,
    base: CalculationBase,
    destination: SystemAccountCode,
    order: i32,
) -> DeductionRule {
    DeductionRule {
        code: code.to_string(),
        name: code.replace('_', " "),
        percentage,
        calculation_base: base,
        threshold: Decimal::ZERO,
        rounding: RoundingMode::Normal,
        destination,
        application_order: order,
        enabled: true,
        stage: DeductionStage::Settlement,
    }
}

pub fn win_tax(percentage: Decimal) -> DeductionRule {
    deduction(
        "win_tax",
        percentage,
        CalculationBase::GrossWin,
        SystemAccountCode::TaxPayable,
        1,
    )
}

/// 10% tax on gross winnings and the given agent rate, backdated a month
pub fn standard_rule(agent_rate: Decimal) -> NewRule {
    NewRule {
        country_code: COUNTRY.to_string(),
        profile_name: PROFILE.to_string(),
        player_deductions: vec![win_tax(dec!(10))],
        operator_deductions: Vec::new(),
        limits: BettingLimits {
            min_stake: Some(dec!(1)),
            max_stake: Some(dec!(100000)),
            max_potential_win: Some(dec!(5000000)),
        },
        features: FeatureFlags::default(),
        commission: CommissionTerms {
            agent_rate,
            platform_fee_percentage: None,
        },
        effective_from: Some(Utc::now() - Duration::days(30)),
    }
}

/// Services wired onto a fresh in-memory store, one tenant with a funded float
pub struct TestContext {
    pub store: MemoryStore,
    pub state: AppState,
    pub tenant: Tenant,
    pub float: Wallet,
    pub rule: Option<JurisdictionRule>,
}

impl TestContext {
    /// Tenant with the standard rule at a 5% agent rate and no agents
    pub async fn new() -> Self {
        Self::build(test_tenant(), Vec::new(), Some(standard_rule(dec!(5)))).await
    }

    pub async fn build(tenant: Tenant, agents: Vec<Agent>, rule: Option<NewRule>) -> Self {
        Self::build_with_float(tenant, agents, rule, FLOAT_SEED).await
    }

    /// Same as `build`, with the operator float holding `float_seed`
    pub async fn build_with_float(
        tenant: Tenant,
        agents: Vec<Agent>,
        rule: Option<NewRule>,
        float_seed: Decimal,
    ) -> Self {
        let directory = agents
            .into_iter()
            .fold(StaticDirectory::new().with_tenant(tenant.clone()), StaticDirectory::with_agent);

        let store = MemoryStore::new();
        let state = AppState::new(
            Arc::new(store.clone()),
            Arc::new(directory),
            &AppConfig::default(),
        );

        let rule = match rule {
            Some(new_rule) => Some(
                state
                    .rules
                    .create_rule(new_rule, ACTOR)
                    .await
                    .expect("Failed to seed rule"),
            ),
            None => None,
        };

        let float = state
            .wallets
            .tenant_float(tenant.id, CURRENCY)
            .await
            .expect("Failed to create float");
        if float_seed > Decimal::ZERO {
            state
                .wallets
                .deposit(float.id, float_seed, "float-seed", ACTOR)
                .await
                .expect("Failed to fund float");
        }

        Self {
            store,
            state,
            tenant,
            float,
            rule,
        }
    }

    /// New player wallet holding `amount`
    pub async fn funded_player(&self, amount: Decimal) -> (Uuid, Wallet) {
        let user_id = Uuid::new_v4();
        (user_id, self.fund_player(user_id, amount).await)
    }

    /// Wallet of a known player, topped up by `amount`
    pub async fn fund_player(&self, user_id: Uuid, amount: Decimal) -> Wallet {
        let wallet = self
            .state
            .wallets
            .get_or_create_wallet(user_id, OwnerType::Player, self.tenant.id, CURRENCY)
            .await
            .expect("Failed to create player wallet");
        if amount > Decimal::ZERO {
            self.state
                .wallets
                .deposit(wallet.id, amount, &format!("seed:{}", user_id), ACTOR)
                .await
                .expect("Failed to fund player");
        }
        self.state.wallets.get_wallet(wallet.id).await.unwrap()
    }

    pub async fn balance(&self, wallet_id: Uuid) -> Decimal {
        self.state
            .wallets
            .get_wallet(wallet_id)
            .await
            .expect("Wallet not found")
            .available_balance
    }

    /// Balance of the tenant's country-scoped system account
    pub async fn system_balance(&self, code: SystemAccountCode) -> Decimal {
        self.state
            .wallets
            .system_account(code, Some(self.tenant.id), Some(COUNTRY), CURRENCY)
            .await
            .expect("Failed to load system account")
            .balance
    }

    pub fn bet(&self, user_id: Uuid, stake: Decimal, potential_win: Decimal) -> BetPlacement {
        BetPlacement {
            bet_id: Uuid::new_v4(),
            user_id,
            tenant_id: self.tenant.id,
            stake,
            currency: CURRENCY.to_string(),
            potential_win,
            bet_type: BetType::Single,
            is_live: false,
            selections: vec!["match-1:home".to_string()],
        }
    }

    /// Settlement callback for a placed bet, carrying its rule stamp
    pub fn settlement(
        &self,
        bet: &BetPlacement,
        decision: &PlacementDecision,
        result: BetResult,
        payout: Decimal,
    ) -> BetSettlementRequest {
        BetSettlementRequest {
            bet_id: bet.bet_id,
            user_id: bet.user_id,
            tenant_id: bet.tenant_id,
            stake: bet.stake,
            payout,
            currency: CURRENCY.to_string(),
            result,
            rule_id: decision.rule_id,
            rule_version: decision.rule_version,
        }
    }

    pub fn casino_round(&self, user_id: Uuid, stake: Decimal, payout: Decimal) -> CasinoRound {
        CasinoRound {
            round_id: Uuid::new_v4(),
            user_id,
            tenant_id: self.tenant.id,
            currency: CURRENCY.to_string(),
            stake,
            payout,
            multiplier: if stake.is_zero() { Decimal::ZERO } else { payout / stake },
            outcome: if payout > stake { "win" } else { "loss" }.to_string(),
            completed_at: Utc::now(),
        }
    }

    /// Ledger balanced, audit chain intact and every wallet matching its entries
    pub async fn assert_consistent(&self, wallet_ids: &[Uuid]) {
        let totals = self.state.wallets.ledger_totals().await.unwrap();
        assert!(totals.is_balanced(), "ledger out of balance: {:?}", totals);

        self.state
            .audit
            .verify_chain()
            .await
            .expect("Audit chain should verify");

        for wallet_id in wallet_ids {
            let check = self.state.wallets.verify_wallet_balance(*wallet_id).await.unwrap();
            assert!(check.matches, "wallet does not match its ledger: {:?}", check);
        }
    }
}
