mod helpers;

use helpers::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sportsbook_ledger::models::*;
use sportsbook_ledger::services::rule_engine::win_deductions;
use sportsbook_ledger::AppError;

#[derive(Debug, Clone)]
enum Op {
    Deposit { to: usize, cents: i64 },
    Withdraw { from: usize, cents: i64 },
    Transfer { from: usize, to: usize, cents: i64 },
    Lock { wallet: usize, cents: i64 },
}

fn op() -> impl Strategy<Value = Op> {
    let cents = 1i64..20_000;
    prop_oneof![
        (0usize..3, cents.clone()).prop_map(|(to, cents)| Op::Deposit { to, cents }),
        (0usize..3, cents.clone()).prop_map(|(from, cents)| Op::Withdraw { from, cents }),
        (0usize..3, 0usize..3, cents.clone())
            .prop_map(|(from, to, cents)| Op::Transfer { from, to, cents }),
        (0usize..3, cents).prop_map(|(wallet, cents)| Op::Lock { wallet, cents }),
    ]
}

fn amount(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_wallet_operations_conserve_funds(ops in prop::collection::vec(op(), 1..40)) {
        tokio_test::block_on(async {
            let ctx = TestContext::new().await;
            let mut ids = Vec::new();
            for _ in 0..3 {
                ids.push(ctx.funded_player(dec!(50)).await.1.id);
            }
            // Expected available and locked per wallet
            let mut model = vec![(dec!(50), Decimal::ZERO); 3];

            for (i, op) in ops.iter().enumerate() {
                let reference = format!("op-{}", i);
                let result = match *op {
                    Op::Deposit { to, cents } => ctx
                        .state
                        .wallets
                        .deposit(ids[to], amount(cents), &reference, ACTOR)
                        .await
                        .map(|_| model[to].0 += amount(cents)),
                    Op::Withdraw { from, cents } => ctx
                        .state
                        .wallets
                        .withdraw(ids[from], amount(cents), &reference, ACTOR)
                        .await
                        .map(|_| model[from].0 -= amount(cents)),
                    Op::Transfer { from, to, cents } => ctx
                        .state
                        .wallets
                        .atomic_transfer(
                            ids[from],
                            ids[to],
                            amount(cents),
                            TransactionType::Transfer,
                            &reference,
                            ACTOR,
                        )
                        .await
                        .map(|_| {
                            model[from].0 -= amount(cents);
                            model[to].0 += amount(cents);
                        }),
                    Op::Lock { wallet, cents } => ctx
                        .state
                        .wallets
                        .lock_balance(ids[wallet], amount(cents), &reference, ACTOR)
                        .await
                        .map(|_| {
                            model[wallet].0 -= amount(cents);
                            model[wallet].1 += amount(cents);
                        }),
                };

                match result {
                    Ok(()) => {}
                    Err(AppError::InsufficientBalance { .. }) => {}
                    Err(AppError::Validation(_)) if matches!(op, Op::Transfer { from, to, .. } if from == to) => {}
                    Err(e) => panic!("Unexpected error for {:?}: {}", op, e),
                }
            }

            for (index, id) in ids.iter().enumerate() {
                let wallet = ctx.state.wallets.get_wallet(*id).await.unwrap();
                assert!(wallet.available_balance >= Decimal::ZERO);
                assert!(wallet.locked_balance >= Decimal::ZERO);
                assert_eq!((wallet.available_balance, wallet.locked_balance), model[index]);
            }
            ctx.assert_consistent(&ids).await;
        });
    }

    #[test]
    fn prop_stamped_rule_reproduces_deductions(
        gross_cents in 0i64..10_000_000,
        stake_cents in 1i64..1_000_000,
        new_rates in prop::collection::vec(1u32..60, 1..4),
    ) {
        tokio_test::block_on(async {
            let ctx = TestContext::new().await;
            let v1 = ctx.rule.clone().unwrap();
            let gross = amount(gross_cents);
            let stake = amount(stake_cents);

            let before = win_deductions(&v1, gross, stake, gross + stake);

            let mut current = v1.id;
            for rate in &new_rates {
                let next = ctx
                    .state
                    .rules
                    .create_new_version(
                        current,
                        RuleUpdate {
                            player_deductions: Some(vec![win_tax(Decimal::from(*rate))]),
                            ..Default::default()
                        },
                        "compliance",
                        "rate change",
                    )
                    .await
                    .unwrap();
                current = next.id;
            }

            let stamped = ctx.state.rules.get_rule(v1.id).await.unwrap();
            let after = ctx.state.rules.calculate_with_rule(&stamped, gross, stake, gross + stake);
            assert_eq!(after, before);
            assert!(after.net_amount >= Decimal::ZERO);
            assert_eq!(after.net_amount, (gross - after.total_deducted).max(Decimal::ZERO));
        });
    }
}
