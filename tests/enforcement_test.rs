mod helpers;

use helpers::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sportsbook_ledger::models::*;
use sportsbook_ledger::AppError;
use std::sync::Arc;

#[tokio::test]
async fn test_winning_bet_with_win_tax() {
    let ctx = TestContext::new().await;
    let (user_id, wallet) = ctx.funded_player(dec!(100)).await;

    let bet = ctx.bet(user_id, dec!(100), dec!(250));
    let placed = ctx.state.enforcement.place_bet(&bet, ACTOR).await.unwrap();
    assert_eq!(placed.wallet.available_balance, Decimal::ZERO);
    assert_eq!(placed.decision.rule_version, Some(1));
    assert_eq!(placed.decision.stake_tax_total, Decimal::ZERO);

    let request = ctx.settlement(&bet, &placed.decision, BetResult::Won, dec!(250));
    let outcome = ctx
        .state
        .enforcement
        .settle_bet_with_rules(&request, ACTOR)
        .await
        .unwrap();

    assert!(!outcome.already_settled);
    let record = &outcome.record;
    assert_eq!(record.gross_win, dec!(150));
    assert_eq!(record.total_deducted, dec!(15.00));
    assert_eq!(record.net_win, dec!(135.00));
    assert_eq!(record.amount_credited, dec!(235.00));
    assert_eq!(record.deductions.len(), 1);
    assert_eq!(record.deductions[0].code, "win_tax");
    assert_eq!(record.rule_version, Some(1));

    assert_eq!(ctx.balance(wallet.id).await, dec!(235));
    assert_eq!(ctx.system_balance(SystemAccountCode::TaxPayable).await, dec!(15));
    let report = ctx
        .state
        .wallets
        .system_account_balances(Some(ctx.tenant.id))
        .await
        .unwrap();
    assert!(report
        .iter()
        .any(|a| a.code == SystemAccountCode::TaxPayable && a.balance == dec!(15)));
    // Stake in, payout out
    assert_eq!(ctx.balance(ctx.float.id).await, FLOAT_SEED + dec!(100) - dec!(250));

    let entries = ctx.state.wallets.entries_for_wallet(wallet.id).await.unwrap();
    let winning = entries
        .iter()
        .find(|e| e.transaction_type == TransactionType::BetWinning)
        .expect("BET_WINNING entry");
    assert_eq!(winning.amount, dec!(135.00));
    assert!(entries
        .iter()
        .any(|e| e.transaction_type == TransactionType::BetStakeReturn && e.amount == dec!(100)));

    ctx.assert_consistent(&[wallet.id, ctx.float.id]).await;
}

#[tokio::test]
async fn test_repeated_settlement_callback_is_a_no_op() {
    let ctx = TestContext::new().await;
    let (user_id, wallet) = ctx.funded_player(dec!(100)).await;
    let bet = ctx.bet(user_id, dec!(100), dec!(250));
    let placed = ctx.state.enforcement.place_bet(&bet, ACTOR).await.unwrap();
    let request = ctx.settlement(&bet, &placed.decision, BetResult::Won, dec!(250));

    let first = ctx
        .state
        .enforcement
        .settle_bet_with_rules(&request, ACTOR)
        .await
        .unwrap();
    let entries_after_first = ctx.state.wallets.ledger_totals().await.unwrap().entry_count;

    let second = ctx
        .state
        .enforcement
        .settle_bet_with_rules(&request, ACTOR)
        .await
        .unwrap();

    assert!(second.already_settled);
    assert!(second.wallet.is_none());
    assert_eq!(second.record, first.record);
    assert_eq!(ctx.balance(wallet.id).await, dec!(235));
    assert_eq!(
        ctx.state.wallets.ledger_totals().await.unwrap().entry_count,
        entries_after_first
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_settlement_callbacks_pay_once() {
    let ctx = Arc::new(TestContext::new().await);
    let (user_id, wallet) = ctx.funded_player(dec!(100)).await;
    let bet = ctx.bet(user_id, dec!(100), dec!(250));
    let placed = ctx.state.enforcement.place_bet(&bet, ACTOR).await.unwrap();
    let request = ctx.settlement(&bet, &placed.decision, BetResult::Won, dec!(250));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let ctx = ctx.clone();
        let request = request.clone();
        handles.push(tokio::spawn(async move {
            ctx.state
                .enforcement
                .settle_bet_with_rules(&request, ACTOR)
                .await
        }));
    }

    let mut fresh = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().expect("Callback should not fail");
        if !outcome.already_settled {
            fresh += 1;
        }
    }
    assert_eq!(fresh, 1);
    assert_eq!(ctx.balance(wallet.id).await, dec!(235));
    ctx.assert_consistent(&[wallet.id, ctx.float.id]).await;
}

#[tokio::test]
async fn test_lost_bet_writes_zero_amount_entry() {
    let ctx = TestContext::new().await;
    let (user_id, wallet) = ctx.funded_player(dec!(100)).await;
    let bet = ctx.bet(user_id, dec!(40), dec!(90));
    let placed = ctx.state.enforcement.place_bet(&bet, ACTOR).await.unwrap();

    let request = ctx.settlement(&bet, &placed.decision, BetResult::Lost, Decimal::ZERO);
    let outcome = ctx
        .state
        .enforcement
        .settle_bet_with_rules(&request, ACTOR)
        .await
        .unwrap();

    assert_eq!(outcome.record.amount_credited, Decimal::ZERO);
    assert!(outcome.record.deductions.is_empty());
    assert_eq!(ctx.balance(wallet.id).await, dec!(60));

    let loss = ctx
        .state
        .wallets
        .entries_for_wallet(wallet.id)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.transaction_type == TransactionType::BetLoss)
        .expect("BET_LOSS entry");
    assert_eq!(loss.amount, Decimal::ZERO);
    assert_eq!(loss.debit_balance_before, loss.debit_balance_after);
    ctx.assert_consistent(&[wallet.id]).await;
}

#[tokio::test]
async fn test_loss_settles_on_frozen_wallet() {
    let ctx = TestContext::new().await;
    let (user_id, wallet) = ctx.funded_player(dec!(100)).await;
    let bet = ctx.bet(user_id, dec!(40), dec!(90));
    let placed = ctx.state.enforcement.place_bet(&bet, ACTOR).await.unwrap();

    ctx.state
        .wallets
        .set_wallet_status(wallet.id, WalletStatus::Frozen, "fraud review", "admin-1")
        .await
        .unwrap();

    let request = ctx.settlement(&bet, &placed.decision, BetResult::Lost, Decimal::ZERO);
    let outcome = ctx
        .state
        .enforcement
        .settle_bet_with_rules(&request, ACTOR)
        .await
        .expect("A loss moves no funds and must settle on a frozen wallet");

    assert!(!outcome.already_settled);
    assert_eq!(outcome.record.result, BetResult::Lost);
    assert_eq!(ctx.balance(wallet.id).await, dec!(60));
    assert!(ctx
        .state
        .wallets
        .entries_for_wallet(wallet.id)
        .await
        .unwrap()
        .iter()
        .any(|e| e.transaction_type == TransactionType::BetLoss));

    // Real debits are still refused
    let spend = ctx
        .state
        .wallets
        .withdraw(wallet.id, dec!(1), "after-freeze", ACTOR)
        .await;
    assert!(matches!(spend, Err(AppError::Validation(_))));
    ctx.assert_consistent(&[wallet.id, ctx.float.id]).await;
}

#[tokio::test]
async fn test_win_on_underfunded_float_is_an_operator_error() {
    let ctx = TestContext::build_with_float(
        test_tenant(),
        Vec::new(),
        Some(standard_rule(dec!(5))),
        Decimal::ZERO,
    )
    .await;
    let (user_id, wallet) = ctx.funded_player(dec!(100)).await;
    let bet = ctx.bet(user_id, dec!(100), dec!(250));
    let placed = ctx.state.enforcement.place_bet(&bet, ACTOR).await.unwrap();
    let request = ctx.settlement(&bet, &placed.decision, BetResult::Won, dec!(250));

    let result = ctx
        .state
        .enforcement
        .settle_bet_with_rules(&request, ACTOR)
        .await;
    match result {
        Err(AppError::OperatorUnderfunded { account, .. }) => {
            assert_eq!(account, AccountRef::Wallet(ctx.float.id).to_string())
        }
        other => panic!("Expected OperatorUnderfunded, got {:?}", other),
    }

    // Nothing applied, so the same callback can settle once the float is topped up
    assert_eq!(ctx.balance(wallet.id).await, Decimal::ZERO);
    assert_eq!(ctx.balance(ctx.float.id).await, dec!(100));
    ctx.state
        .wallets
        .deposit(ctx.float.id, dec!(150), "float-top-up", ACTOR)
        .await
        .unwrap();

    let outcome = ctx
        .state
        .enforcement
        .settle_bet_with_rules(&request, ACTOR)
        .await
        .unwrap();
    assert!(!outcome.already_settled);
    assert_eq!(ctx.balance(wallet.id).await, dec!(235));
    assert_eq!(ctx.balance(ctx.float.id).await, Decimal::ZERO);
    assert_eq!(ctx.system_balance(SystemAccountCode::TaxPayable).await, dec!(15));
    ctx.assert_consistent(&[wallet.id, ctx.float.id]).await;
}

#[tokio::test]
async fn test_void_bet_refunds_stake() {
    let ctx = TestContext::new().await;
    let (user_id, wallet) = ctx.funded_player(dec!(100)).await;
    let bet = ctx.bet(user_id, dec!(40), dec!(90));
    let placed = ctx.state.enforcement.place_bet(&bet, ACTOR).await.unwrap();

    let request = ctx.settlement(&bet, &placed.decision, BetResult::Void, Decimal::ZERO);
    let outcome = ctx
        .state
        .enforcement
        .settle_bet_with_rules(&request, ACTOR)
        .await
        .unwrap();

    assert_eq!(outcome.record.amount_credited, dec!(40));
    assert_eq!(ctx.balance(wallet.id).await, dec!(100));
    assert_eq!(ctx.balance(ctx.float.id).await, FLOAT_SEED);
}

#[tokio::test]
async fn test_settlement_uses_rule_stamped_at_placement() {
    let ctx = TestContext::new().await;
    let v1 = ctx.rule.clone().unwrap();
    let (user_id, wallet) = ctx.funded_player(dec!(200)).await;

    let stamped_bet = ctx.bet(user_id, dec!(100), dec!(250));
    let stamped = ctx.state.enforcement.place_bet(&stamped_bet, ACTOR).await.unwrap();
    assert_eq!(stamped.decision.rule_id, Some(v1.id));

    // Tax doubles after placement
    let v2 = ctx
        .state
        .rules
        .create_new_version(
            v1.id,
            RuleUpdate {
                player_deductions: Some(vec![win_tax(dec!(20))]),
                ..Default::default()
            },
            "compliance",
            "Finance act amendment",
        )
        .await
        .unwrap();
    assert_eq!(v2.version, 2);

    let outcome = ctx
        .state
        .enforcement
        .settle_bet_with_rules(
            &ctx.settlement(&stamped_bet, &stamped.decision, BetResult::Won, dec!(250)),
            ACTOR,
        )
        .await
        .unwrap();
    assert_eq!(outcome.record.total_deducted, dec!(15.00));
    assert_eq!(outcome.record.rule_version, Some(1));

    // A bet placed now is stamped with v2
    let fresh_bet = ctx.bet(user_id, dec!(100), dec!(250));
    let fresh = ctx.state.enforcement.place_bet(&fresh_bet, ACTOR).await.unwrap();
    assert_eq!(fresh.decision.rule_version, Some(2));
    let outcome = ctx
        .state
        .enforcement
        .settle_bet_with_rules(
            &ctx.settlement(&fresh_bet, &fresh.decision, BetResult::Won, dec!(250)),
            ACTOR,
        )
        .await
        .unwrap();
    assert_eq!(outcome.record.total_deducted, dec!(30.00));

    // 200 - 100 + 235 - 100 + 220
    assert_eq!(ctx.balance(wallet.id).await, dec!(455));
    ctx.assert_consistent(&[wallet.id, ctx.float.id]).await;
}

#[tokio::test]
async fn test_mismatched_stamp_version_is_rejected() {
    let ctx = TestContext::new().await;
    let (user_id, _) = ctx.funded_player(dec!(100)).await;
    let bet = ctx.bet(user_id, dec!(100), dec!(250));
    let placed = ctx.state.enforcement.place_bet(&bet, ACTOR).await.unwrap();

    let mut request = ctx.settlement(&bet, &placed.decision, BetResult::Won, dec!(250));
    request.rule_version = Some(7);
    let result = ctx.state.enforcement.settle_bet_with_rules(&request, ACTOR).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_placement_currency_mismatch() {
    let ctx = TestContext::new().await;
    let (user_id, wallet) = ctx.funded_player(dec!(100)).await;

    let mut bet = ctx.bet(user_id, dec!(10), dec!(20));
    bet.currency = "USD".to_string();
    let result = ctx.state.enforcement.place_bet(&bet, ACTOR).await;

    match result {
        Err(AppError::CurrencyMismatch { expected, actual }) => {
            assert_eq!(expected, CURRENCY);
            assert_eq!(actual, "USD");
        }
        other => panic!("Expected CurrencyMismatch, got {:?}", other.map(|o| o.decision)),
    }
    assert_eq!(ctx.balance(wallet.id).await, dec!(100));
}

#[tokio::test]
async fn test_placement_limits_and_features() {
    let ctx = TestContext::new().await;
    let (user_id, wallet) = ctx.funded_player(dec!(500000)).await;

    let too_big = ctx.bet(user_id, dec!(200000), dec!(400000));
    assert!(matches!(
        ctx.state.enforcement.place_bet(&too_big, ACTOR).await,
        Err(AppError::Validation(_))
    ));

    let v1 = ctx.rule.clone().unwrap();
    ctx.state
        .rules
        .create_new_version(
            v1.id,
            RuleUpdate {
                features: Some(FeatureFlags {
                    live_betting: false,
                    ..FeatureFlags::default()
                }),
                ..Default::default()
            },
            "compliance",
            "Live betting suspended",
        )
        .await
        .unwrap();

    let mut live = ctx.bet(user_id, dec!(10), dec!(20));
    live.is_live = true;
    let validation = ctx
        .state
        .rules
        .validate_bet_placement(ctx.tenant.id, live.stake, live.potential_win, live.bet_type, true)
        .await
        .unwrap();
    assert!(!validation.valid);
    assert!(validation.errors.iter().any(|e| e.contains("Live betting")));
    assert!(ctx.state.enforcement.place_bet(&live, ACTOR).await.is_err());

    live.is_live = false;
    ctx.state.enforcement.place_bet(&live, ACTOR).await.unwrap();
    assert_eq!(ctx.balance(wallet.id).await, dec!(499990));
}

#[tokio::test]
async fn test_stake_tax_taken_at_placement() {
    let mut rule = standard_rule(dec!(5));
    rule.player_deductions.push(DeductionRule {
        stage: DeductionStage::Placement,
        ..deduction(
            "excise_duty",
            dec!(7.5),
            CalculationBase::Stake,
            SystemAccountCode::LevyPayable,
            0,
        )
    });
    let ctx = TestContext::build(test_tenant(), Vec::new(), Some(rule)).await;
    let (user_id, wallet) = ctx.funded_player(dec!(100)).await;

    let bet = ctx.bet(user_id, dec!(100), dec!(180));
    let placed = ctx.state.enforcement.place_bet(&bet, ACTOR).await.unwrap();

    assert_eq!(placed.decision.stake_tax_total, dec!(7.50));
    assert_eq!(placed.entry_ids.len(), 2);
    assert_eq!(placed.wallet.available_balance, Decimal::ZERO);
    assert_eq!(ctx.system_balance(SystemAccountCode::LevyPayable).await, dec!(7.50));
    assert_eq!(ctx.balance(ctx.float.id).await, FLOAT_SEED + dec!(92.50));

    // The stake tax is not charged again on winnings
    let outcome = ctx
        .state
        .enforcement
        .settle_bet_with_rules(
            &ctx.settlement(&bet, &placed.decision, BetResult::Won, dec!(180)),
            ACTOR,
        )
        .await
        .unwrap();
    assert_eq!(outcome.record.deductions.len(), 1);
    assert_eq!(outcome.record.total_deducted, dec!(8.00));
    ctx.assert_consistent(&[wallet.id, ctx.float.id]).await;
}

#[tokio::test]
async fn test_missing_rule_means_no_deductions() {
    let ctx = TestContext::build(test_tenant(), Vec::new(), None).await;
    let (user_id, wallet) = ctx.funded_player(dec!(100)).await;

    let bet = ctx.bet(user_id, dec!(100), dec!(250));
    let placed = ctx.state.enforcement.place_bet(&bet, ACTOR).await.unwrap();
    assert_eq!(placed.decision.rule_id, None);

    let outcome = ctx
        .state
        .enforcement
        .settle_bet_with_rules(
            &ctx.settlement(&bet, &placed.decision, BetResult::Won, dec!(250)),
            ACTOR,
        )
        .await
        .unwrap();
    assert_eq!(outcome.record.total_deducted, Decimal::ZERO);
    assert_eq!(outcome.record.net_win, dec!(150));
    assert_eq!(ctx.balance(wallet.id).await, dec!(250));
}

#[tokio::test]
async fn test_casino_round_recorded_once() {
    let ctx = TestContext::new().await;
    let (user_id, _) = ctx.funded_player(Decimal::ZERO).await;
    let round = ctx.casino_round(user_id, dec!(50), dec!(20));

    let first = ctx
        .state
        .enforcement
        .record_casino_round(&round, "casino-callback")
        .await
        .unwrap();
    let second = ctx
        .state
        .enforcement
        .record_casino_round(&round, "casino-callback")
        .await
        .unwrap();

    assert!(!first.already_recorded);
    assert!(second.already_recorded);
    assert_eq!(first.wager.kind, WagerKind::Casino);
}
