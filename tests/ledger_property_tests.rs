//! Property-based tests for valuation and the balance ledger
//!
//! Pricing properties run in memory. Ledger properties replay a random list
//! of credits and debits against a temporary sled database and compare the
//! result with a plain running sum.

use proptest::prelude::*;
use recycle_rewards::ledger::{Ledger, Metadata, Posting};
use recycle_rewards::pricing::{Tariff, round_half_up};
use recycle_rewards::store::Store;
use recycle_rewards::{Category, EntryKind, HistoryRange, Settings};
use rust_decimal::Decimal;
use std::sync::Arc;

fn temporary_ledger() -> Ledger {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let store = Store::new(Arc::new(db)).unwrap();
    Ledger::new(store, Arc::new(Settings::default()))
}

#[derive(Debug, Clone)]
enum Op {
    Credit(Decimal),
    Debit(Decimal),
}

fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..5_000_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        amount_strategy().prop_map(Op::Credit),
        amount_strategy().prop_map(Op::Debit),
    ]
}

proptest! {
    #[test]
    fn fee_and_payout_split_gross_exactly(
        grams in 1i64..1_000_000i64,
        price in 1i64..10_000_000i64,
        fee_basis_points in 0i64..10_000i64,
    ) {
        let tariff = Tariff::new(Decimal::new(price, 2), Decimal::new(fee_basis_points, 4), 2);
        let valuation = tariff.value(Decimal::new(grams, 3)).unwrap();

        prop_assert_eq!(valuation.fee.value() + valuation.payout.value(), valuation.gross.value());
        prop_assert!(valuation.payout.value() >= Decimal::ZERO);
        prop_assert!(valuation.fee.value() <= valuation.gross.value());
        prop_assert_eq!(round_half_up(valuation.gross.value(), 2), valuation.gross.value());
        prop_assert_eq!(tariff.estimate(Decimal::new(grams, 3)).unwrap(), valuation.gross);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn balance_is_credits_minus_debits(ops in prop::collection::vec(op_strategy(), 1..24)) {
        let ledger = temporary_ledger();
        let mut expected = Decimal::ZERO;
        let mut accepted = 0u64;

        for op in &ops {
            let posting = match op {
                Op::Credit(amount) => Posting::credit("user_prop", *amount, Category::Bonus),
                Op::Debit(amount) => Posting::debit("user_prop", *amount, Category::Bonus),
            };
            let result = ledger.post(posting);
            match op {
                Op::Credit(amount) => {
                    prop_assert!(result.is_ok());
                    expected += *amount;
                    accepted += 1;
                }
                Op::Debit(amount) if *amount <= expected => {
                    prop_assert!(result.is_ok());
                    expected -= *amount;
                    accepted += 1;
                }
                Op::Debit(_) => {
                    let err = result.unwrap_err();
                    prop_assert_eq!(err.code(), "insufficient_balance");
                }
            }
            prop_assert_eq!(ledger.current_balance("user_prop").unwrap(), expected);
        }

        let audit = ledger.verify("user_prop").unwrap();
        prop_assert_eq!(audit.entries, accepted);
        prop_assert_eq!(audit.balance.value(), expected);
        prop_assert_eq!(audit.credits.value() - audit.debits.value(), expected);
        prop_assert_eq!(ledger.head("user_prop").unwrap().balance.value(), expected);

        let entries: Vec<_> = ledger
            .history("user_prop", HistoryRange::default())
            .collect::<Result<_, _>>()
            .unwrap();
        prop_assert_eq!(entries.len() as u64, accepted);
        for (newer, older) in entries.iter().zip(entries.iter().skip(1)) {
            prop_assert_eq!(newer.sequence, older.sequence + 1);
            prop_assert_eq!(newer.balance_before, older.balance_after);
            prop_assert!(newer.created_at > older.created_at);
        }
        for entry in &entries {
            let signed = match entry.kind {
                EntryKind::Credit => entry.balance_before.value() + entry.amount.value(),
                EntryKind::Debit => entry.balance_before.value() - entry.amount.value(),
            };
            prop_assert_eq!(signed, entry.balance_after.value());
            prop_assert!(entry.balance_after.value() >= Decimal::ZERO);
        }
    }

    #[test]
    fn users_do_not_share_balances(first in amount_strategy(), second in amount_strategy()) {
        let ledger = temporary_ledger();
        ledger.post_credit("user_a", first, Category::Bonus, None, Metadata::new()).unwrap();
        ledger.post_credit("user_ab", second, Category::Bonus, None, Metadata::new()).unwrap();

        prop_assert_eq!(ledger.current_balance("user_a").unwrap(), first);
        prop_assert_eq!(ledger.current_balance("user_ab").unwrap(), second);
        prop_assert_eq!(ledger.verify("user_a").unwrap().entries, 1);
    }
}
