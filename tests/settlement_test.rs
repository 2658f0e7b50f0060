mod helpers;

use async_trait::async_trait;
use chrono::Utc;
use helpers::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sportsbook_ledger::directory::{Agent, AgentStatus, Directory, StaticDirectory, Tenant};
use sportsbook_ledger::models::*;
use sportsbook_ledger::scheduler::SettlementScheduler;
use sportsbook_ledger::services::{SettlementOutcome, SkipReason};
use sportsbook_ledger::{AppError, AppResult};
use std::sync::Arc;
use uuid::Uuid;

/// Root agent with two players and a sub-agent with one more
struct AgentFixture {
    ctx: TestContext,
    root: Agent,
    sub: Agent,
    players: [Uuid; 3],
    period: SettlementPeriod,
}

fn commission_rule(agent_rate: Decimal) -> NewRule {
    let mut rule = standard_rule(agent_rate);
    rule.commission.platform_fee_percentage = Some(dec!(10));
    rule
}

async fn fixture(configure: impl FnOnce(&mut Agent, &mut Agent)) -> AgentFixture {
    let tenant = test_tenant();
    let players = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    let mut root = test_agent(tenant.id, None, vec![players[0], players[1]]);
    let mut sub = test_agent(tenant.id, Some(root.id), vec![players[2]]);
    configure(&mut root, &mut sub);

    let ctx = TestContext::build(
        tenant,
        vec![root.clone(), sub.clone()],
        Some(commission_rule(dec!(5))),
    )
    .await;

    AgentFixture {
        ctx,
        root,
        sub,
        players,
        period: SettlementPeriod::week_containing(Utc::now()),
    }
}

async fn settle_bet(ctx: &TestContext, user_id: Uuid, stake: Decimal, result: BetResult, payout: Decimal) {
    ctx.fund_player(user_id, stake).await;
    let bet = ctx.bet(user_id, stake, stake * dec!(3));
    let placed = ctx.state.enforcement.place_bet(&bet, ACTOR).await.unwrap();
    ctx.state
        .enforcement
        .settle_bet_with_rules(&ctx.settlement(&bet, &placed.decision, result, payout), ACTOR)
        .await
        .unwrap();
}

async fn casino(ctx: &TestContext, user_id: Uuid, stake: Decimal, payout: Decimal) {
    ctx.state
        .enforcement
        .record_casino_round(&ctx.casino_round(user_id, stake, payout), "casino-callback")
        .await
        .unwrap();
}

/// Root GGR 160 (sports 100 lost, casino 50/20, downline casino 30/0)
async fn seed_activity(f: &AgentFixture) {
    settle_bet(&f.ctx, f.players[0], dec!(100), BetResult::Lost, Decimal::ZERO).await;
    casino(&f.ctx, f.players[1], dec!(50), dec!(20)).await;
    casino(&f.ctx, f.players[2], dec!(30), Decimal::ZERO).await;
}

async fn commission_balance(ctx: &TestContext, agent_id: Uuid) -> Decimal {
    ctx.state
        .wallets
        .find_wallet(OwnerType::AgentCommission, agent_id)
        .await
        .unwrap()
        .map_or(Decimal::ZERO, |w| w.available_balance)
}

#[tokio::test]
async fn test_agent_ggr_includes_downline() {
    let f = fixture(|_, _| {}).await;
    seed_activity(&f).await;
    // Void bets do not count
    settle_bet(&f.ctx, f.players[0], dec!(75), BetResult::Void, Decimal::ZERO).await;

    let ggr = f
        .ctx
        .state
        .settlement
        .calculate_agent_ggr(f.root.id, f.ctx.tenant.id, f.period)
        .await
        .unwrap();

    assert_eq!(ggr.player_count, 3);
    assert_eq!(ggr.wager_count, 3);
    assert_eq!(ggr.sports_stake, dec!(100));
    assert_eq!(ggr.casino_stake, dec!(80));
    assert_eq!(ggr.total_payout, dec!(20));
    assert_eq!(ggr.ggr, dec!(160));

    let sub = f
        .ctx
        .state
        .settlement
        .calculate_agent_ggr(f.sub.id, f.ctx.tenant.id, f.period)
        .await
        .unwrap();
    assert_eq!(sub.ggr, dec!(30));
}

#[tokio::test]
async fn test_process_agent_settlement_once() {
    let f = fixture(|_, _| {}).await;
    seed_activity(&f).await;

    let first = f
        .ctx
        .state
        .settlement
        .process_agent_settlement(f.root.id, f.ctx.tenant.id, f.period, "ops")
        .await
        .unwrap();
    let settlement = match first {
        SettlementOutcome::Processed(s) => s,
        other => panic!("Expected a processed settlement, got {:?}", other),
    };

    assert_eq!(settlement.status, SettlementStatus::Completed);
    assert_eq!(settlement.ggr, dec!(160));
    assert_eq!(settlement.commission_rate, dec!(5));
    assert_eq!(settlement.gross_amount, dec!(8.00));
    assert_eq!(settlement.deductions.len(), 1);
    assert_eq!(settlement.deductions[0].amount, dec!(0.80));
    assert_eq!(settlement.net_amount, dec!(7.20));
    assert_eq!(settlement.rule_version, Some(1));
    assert_eq!(settlement.ledger_entry_ids.len(), 1);
    assert_eq!(commission_balance(&f.ctx, f.root.id).await, dec!(7.20));

    let float_after_first = f.ctx.balance(f.ctx.float.id).await;
    let second = f
        .ctx
        .state
        .settlement
        .process_agent_settlement(f.root.id, f.ctx.tenant.id, f.period, "ops")
        .await
        .unwrap();
    assert_eq!(
        second,
        SettlementOutcome::Skipped {
            agent_id: f.root.id,
            reason: SkipReason::AlreadySettled {
                settlement_id: settlement.id
            },
        }
    );
    assert_eq!(commission_balance(&f.ctx, f.root.id).await, dec!(7.20));
    assert_eq!(f.ctx.balance(f.ctx.float.id).await, float_after_first);
    assert_eq!(
        f.ctx.state.settlement.list_settlements(f.ctx.tenant.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_settlement_run_twice_pays_once() {
    let f = fixture(|_, _| {}).await;
    seed_activity(&f).await;

    let first = f
        .ctx
        .state
        .settlement
        .run_settlement_for_period(f.ctx.tenant.id, f.period)
        .await
        .unwrap();
    assert_eq!(first.processed, 2);
    assert_eq!(first.failed, 0);
    // 7.20 to the root agent, 1.35 to the sub-agent
    assert_eq!(first.total_paid, dec!(8.55));
    assert_eq!(commission_balance(&f.ctx, f.sub.id).await, dec!(1.35));

    let float_after_first = f.ctx.balance(f.ctx.float.id).await;
    let second = f
        .ctx
        .state
        .settlement
        .run_settlement_for_period(f.ctx.tenant.id, f.period)
        .await
        .unwrap();
    assert_eq!(second.processed, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(second.total_paid, Decimal::ZERO);
    assert_eq!(f.ctx.balance(f.ctx.float.id).await, float_after_first);
    assert_eq!(
        f.ctx.state.settlement.list_settlements(f.ctx.tenant.id).await.unwrap().len(),
        2
    );

    let float = f.ctx.float.id;
    f.ctx.assert_consistent(&[float]).await;
}

#[tokio::test]
async fn test_negative_ggr_pays_nothing() {
    let f = fixture(|_, _| {}).await;
    settle_bet(&f.ctx, f.players[0], dec!(100), BetResult::Won, dec!(300)).await;

    let outcome = f
        .ctx
        .state
        .settlement
        .process_agent_settlement(f.root.id, f.ctx.tenant.id, f.period, "ops")
        .await
        .unwrap();

    match outcome {
        SettlementOutcome::Skipped {
            reason: SkipReason::NoCommission { net_commission },
            ..
        } => assert!(net_commission < Decimal::ZERO),
        other => panic!("Expected NoCommission, got {:?}", other),
    }
    assert!(f
        .ctx
        .state
        .settlement
        .list_settlements(f.ctx.tenant.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_suspended_agents_are_not_settled() {
    let f = fixture(|_, sub| sub.status = AgentStatus::Suspended).await;
    seed_activity(&f).await;

    let report = f
        .ctx
        .state
        .settlement
        .run_settlement_for_period(f.ctx.tenant.id, f.period)
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(commission_balance(&f.ctx, f.sub.id).await, Decimal::ZERO);
}

#[tokio::test]
async fn test_agent_rate_overrides_rule() {
    let f = fixture(|root, _| root.commission_rate = Some(dec!(12.5))).await;
    seed_activity(&f).await;

    let preview = f
        .ctx
        .state
        .settlement
        .preview_agent_settlement(f.root.id, f.ctx.tenant.id, f.period)
        .await
        .unwrap();
    assert_eq!(preview.commission_rate, dec!(12.5));
    assert_eq!(preview.gross_commission, dec!(20.00));
    assert_eq!(preview.platform_fee, dec!(2.00));
    assert_eq!(preview.net_commission, dec!(18.00));
}

#[tokio::test]
async fn test_recalculation_uses_stamped_rule() {
    let f = fixture(|_, _| {}).await;
    seed_activity(&f).await;
    let v1 = f.ctx.rule.clone().unwrap();

    let settlement = match f
        .ctx
        .state
        .settlement
        .process_agent_settlement(f.root.id, f.ctx.tenant.id, f.period, "ops")
        .await
        .unwrap()
    {
        SettlementOutcome::Processed(s) => s,
        other => panic!("Expected a processed settlement, got {:?}", other),
    };
    assert_eq!(settlement.rule_id, Some(v1.id));

    f.ctx
        .state
        .rules
        .create_new_version(
            v1.id,
            RuleUpdate {
                commission: Some(CommissionTerms {
                    agent_rate: dec!(7),
                    platform_fee_percentage: Some(dec!(10)),
                }),
                ..Default::default()
            },
            "commercial",
            "Agent rate review",
        )
        .await
        .unwrap();

    let recalculated = f
        .ctx
        .state
        .settlement
        .recalculate_settlement(settlement.id)
        .await
        .unwrap();
    assert_eq!(recalculated.commission_rate, dec!(5));
    assert_eq!(recalculated.rule_version, Some(1));
    assert_eq!(recalculated.net_commission, settlement.net_amount);

    // A fresh preview of the same week now falls under v2
    let preview = f
        .ctx
        .state
        .settlement
        .preview_agent_settlement(f.root.id, f.ctx.tenant.id, f.period)
        .await
        .unwrap();
    assert_eq!(preview.commission_rate, dec!(7));
    assert_eq!(preview.rule_version, Some(2));
}

#[tokio::test]
async fn test_one_failing_agent_does_not_stop_the_run() {
    let f = fixture(|_, _| {}).await;
    seed_activity(&f).await;

    let sub_wallet = f
        .ctx
        .state
        .wallets
        .get_or_create_wallet(f.sub.id, OwnerType::AgentCommission, f.ctx.tenant.id, CURRENCY)
        .await
        .unwrap();
    f.ctx
        .state
        .wallets
        .set_wallet_status(sub_wallet.id, WalletStatus::Closed, "agent offboarded", "ops")
        .await
        .unwrap();

    let report = f
        .ctx
        .state
        .settlement
        .run_settlement_for_period(f.ctx.tenant.id, f.period)
        .await
        .unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].agent_id, f.sub.id);
    assert_eq!(commission_balance(&f.ctx, f.root.id).await, dec!(7.20));
}

#[tokio::test]
async fn test_withdraw_commission() {
    let f = fixture(|_, _| {}).await;
    seed_activity(&f).await;
    f.ctx
        .state
        .settlement
        .process_agent_settlement(f.root.id, f.ctx.tenant.id, f.period, "ops")
        .await
        .unwrap();

    let too_much = f
        .ctx
        .state
        .settlement
        .withdraw_commission(f.root.id, f.ctx.tenant.id, dec!(10), "agent-portal")
        .await;
    assert!(matches!(too_much, Err(AppError::InsufficientBalance { .. })));

    let entry = f
        .ctx
        .state
        .settlement
        .withdraw_commission(f.root.id, f.ctx.tenant.id, dec!(7.20), "agent-portal")
        .await
        .unwrap();
    assert_eq!(entry.transaction_type, TransactionType::CommissionWithdrawal);
    assert_eq!(commission_balance(&f.ctx, f.root.id).await, Decimal::ZERO);

    let main = f
        .ctx
        .state
        .wallets
        .find_wallet(OwnerType::Agent, f.root.id)
        .await
        .unwrap()
        .expect("Agent main wallet");
    assert_eq!(main.available_balance, dec!(7.20));

    let foreign = f
        .ctx
        .state
        .settlement
        .withdraw_commission(f.root.id, Uuid::new_v4(), dec!(1), "agent-portal")
        .await;
    assert!(matches!(foreign, Err(AppError::Validation(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_settle_agent_once() {
    let f = Arc::new(fixture(|_, _| {}).await);
    seed_activity(&f).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            f.ctx
                .state
                .settlement
                .process_agent_settlement(f.root.id, f.ctx.tenant.id, f.period, "ops")
                .await
        }));
    }

    let mut processed = 0;
    for handle in handles {
        match handle.await.unwrap().expect("A racing run must not fail") {
            SettlementOutcome::Processed(_) => processed += 1,
            SettlementOutcome::Skipped {
                reason: SkipReason::AlreadySettled { .. },
                ..
            } => {}
            other => panic!("Unexpected outcome: {:?}", other),
        }
    }
    assert_eq!(processed, 1);
    assert_eq!(commission_balance(&f.ctx, f.root.id).await, dec!(7.20));
    assert_eq!(
        f.ctx.state.settlement.list_settlements(f.ctx.tenant.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_commission_on_drained_float_is_an_operator_error() {
    let f = fixture(|_, _| {}).await;
    seed_activity(&f).await;

    let float_balance = f.ctx.balance(f.ctx.float.id).await;
    f.ctx
        .state
        .wallets
        .withdraw(f.ctx.float.id, float_balance, "float-sweep", ACTOR)
        .await
        .unwrap();

    let result = f
        .ctx
        .state
        .settlement
        .process_agent_settlement(f.root.id, f.ctx.tenant.id, f.period, "ops")
        .await;
    assert!(matches!(result, Err(AppError::OperatorUnderfunded { .. })));
    assert_eq!(commission_balance(&f.ctx, f.root.id).await, Decimal::ZERO);
    assert!(f
        .ctx
        .state
        .settlement
        .list_settlements(f.ctx.tenant.id)
        .await
        .unwrap()
        .is_empty());
}

/// Tenant listing from somewhere other than the static seed
struct TenantFeed {
    inner: StaticDirectory,
    listed: Vec<Uuid>,
}

#[async_trait]
impl Directory for TenantFeed {
    async fn tenant(&self, tenant_id: Uuid) -> AppResult<Option<Tenant>> {
        self.inner.tenant(tenant_id).await
    }

    async fn agent(&self, agent_id: Uuid) -> AppResult<Option<Agent>> {
        self.inner.agent(agent_id).await
    }

    async fn agents_for_tenant(&self, tenant_id: Uuid) -> AppResult<Vec<Agent>> {
        self.inner.agents_for_tenant(tenant_id).await
    }

    async fn tenant_ids(&self) -> AppResult<Vec<Uuid>> {
        Ok(self.listed.clone())
    }
}

#[tokio::test]
async fn test_scheduler_settles_previous_week() {
    let f = fixture(|_, _| {}).await;
    let last_week = SettlementPeriod::previous_week(Utc::now());
    let mut round = f.ctx.casino_round(f.players[0], dec!(400), dec!(100));
    round.completed_at = last_week.start + chrono::Duration::hours(12);
    f.ctx
        .state
        .enforcement
        .record_casino_round(&round, "casino-callback")
        .await
        .unwrap();

    // Tenants come from a feed that also lists one the directory does not know
    let directory = TenantFeed {
        inner: StaticDirectory::new()
            .with_tenant(f.ctx.tenant.clone())
            .with_agent(f.root.clone())
            .with_agent(f.sub.clone()),
        listed: vec![Uuid::new_v4(), f.ctx.tenant.id],
    };
    let scheduler = SettlementScheduler::new(f.ctx.state.settlement.clone(), Arc::new(directory));

    scheduler.run_once().await;
    scheduler.run_once().await;

    // 5% of 300 less the 10% platform fee, paid once
    assert_eq!(commission_balance(&f.ctx, f.root.id).await, dec!(13.50));
    let settlements = f.ctx.state.settlement.list_settlements(f.ctx.tenant.id).await.unwrap();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].period_start, last_week.start);
}
