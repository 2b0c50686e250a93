use payflow::config::LedgerConfig;
use payflow::quote::{
    BalanceSnapshot, FeePolicy, LedgerBalance, LedgerId, PlanError, Planner, StepKind,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn ledger(id: &str, supports_conversion: bool) -> LedgerConfig {
    LedgerConfig {
        id: id.to_string(),
        native_asset: "ETH".to_string(),
        supports_conversion,
        gas_reserve: Decimal::ZERO,
    }
}

fn planner_with(fees: FeePolicy) -> Planner {
    Planner::new(
        vec![
            ledger("alt", true),
            ledger("base", true),
            ledger("opt", true),
            ledger("side", false),
        ],
        LedgerId::from("base"),
        fees,
    )
    .unwrap()
}

fn planner() -> Planner {
    planner_with(FeePolicy::default())
}

fn snapshot(entries: &[(&str, LedgerBalance)]) -> BalanceSnapshot {
    entries
        .iter()
        .map(|(id, balance)| (LedgerId::from(*id), balance.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Non-negative decimal from an integer mantissa and a scale
fn arb_amount(max_mantissa: i64, max_scale: u32) -> impl Strategy<Value = Decimal> {
    (0..=max_mantissa, 0..=max_scale).prop_map(|(mantissa, scale)| Decimal::new(mantissa, scale))
}

fn arb_target() -> impl Strategy<Value = Decimal> {
    (1i64..=100_000_000, 0u32..=4).prop_map(|(mantissa, scale)| Decimal::new(mantissa, scale))
}

fn arb_balance() -> impl Strategy<Value = LedgerBalance> {
    (
        arb_amount(1_000_000_000, 6),
        arb_amount(10_000_000, 6),
        proptest::option::of(arb_amount(100_000_000, 2)),
    )
        .prop_map(|(settlement, native, native_value)| LedgerBalance {
            native,
            settlement,
            native_value,
        })
}

/// Balances over the configured ledgers plus one the planner does not know
fn arb_snapshot() -> impl Strategy<Value = BalanceSnapshot> {
    proptest::collection::btree_map(
        prop::sample::select(vec!["alt", "base", "opt", "side", "ghost"]).prop_map(LedgerId::from),
        arb_balance(),
        0..5,
    )
}

fn arb_fee_policy() -> impl Strategy<Value = FeePolicy> {
    (0u32..=5_000, 0u32..=2_000).prop_map(|(buffer_bps, platform_fee_bps)| FeePolicy {
        buffer_bps,
        platform_fee_bps,
        ..FeePolicy::default()
    })
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn scenario_direct_plus_conversion() {
    let snap = snapshot(&[
        ("base", LedgerBalance::settlement(dec!(30))),
        ("alt", LedgerBalance::native(dec!(0.02))),
    ]);
    let quote = planner().plan(&snap, dec!(50)).unwrap();

    assert!(!quote.trivial);
    assert_eq!(quote.plan.len(), 2);

    let direct = &quote.plan[0];
    assert_eq!(direct.kind, StepKind::Direct);
    assert_eq!(direct.ledger.as_str(), "base");
    assert_eq!(direct.amount, dec!(30));

    let convert = &quote.plan[1];
    assert_eq!(convert.kind, StepKind::Convert);
    assert_eq!(convert.ledger.as_str(), "alt");
    // the remainder plus buffered fees, not just the bare remainder
    assert!(convert.amount > dec!(20));
    assert_eq!(convert.amount, dec!(20) + quote.fees.total());
}

#[test]
fn scenario_all_zero_is_infeasible() {
    let snap = snapshot(&[
        ("base", LedgerBalance::default()),
        ("alt", LedgerBalance::default()),
    ]);
    match planner().plan(&snap, dec!(1000)) {
        Err(PlanError::Infeasible { shortfall, .. }) => {
            assert!(shortfall >= dec!(1000));
            assert!(shortfall < dec!(1000.1), "shortfall {}", shortfall);
        }
        other => panic!("expected infeasible, got {:?}", other),
    }
}

#[test]
fn scenario_destination_already_covers() {
    let snap = snapshot(&[("base", LedgerBalance::settlement(dec!(60)))]);
    let quote = planner().plan(&snap, dec!(50)).unwrap();

    assert!(quote.trivial);
    assert_eq!(quote.plan.len(), 1);
    assert!(quote.plan[0].no_transfer);
    assert!(!quote.has_conversions());
    assert!(!quote.needs_transfer());
}

#[test]
fn scenario_touching_more_ledgers_costs_more() {
    let p = planner();
    let concentrated = snapshot(&[("alt", LedgerBalance::settlement(dec!(100)))]);
    let spread = snapshot(&[
        ("alt", LedgerBalance::settlement(dec!(20))),
        ("opt", LedgerBalance::settlement(dec!(20))),
        ("side", LedgerBalance::settlement(dec!(20))),
    ]);

    let one = p.plan(&concentrated, dec!(50)).unwrap();
    let three = p.plan(&spread, dec!(50)).unwrap();
    assert_eq!(one.fees.transfers, 1);
    assert_eq!(three.fees.transfers, 3);
    assert!(three.fees.total() >= one.fees.total());
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_planning_is_deterministic(snap in arb_snapshot(), target in arb_target()) {
        let p = planner();
        let first = p.plan(&snap, target);
        let second = p.plan(&snap, target);
        let cloned = p.clone().plan(&snap, target);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&first, &cloned);
    }

    #[test]
    fn prop_fee_estimate_monotone_in_transfers(
        target in arb_target(),
        volume in arb_amount(1_000_000_000, 4),
        transfers in 0usize..16,
        policy in arb_fee_policy(),
    ) {
        let fewer = policy.estimate(target, transfers, volume);
        let more = policy.estimate(target, transfers + 1, volume);
        prop_assert!(more.bridge_fee >= fewer.bridge_fee);
        prop_assert!(
            more.total() >= fewer.total(),
            "fees dropped from {} to {} at {} transfers",
            fewer.total(),
            more.total(),
            transfers + 1
        );
    }

    #[test]
    fn prop_recipient_receives_exact_target(
        snap in arb_snapshot(),
        target in arb_target(),
        policy in arb_fee_policy(),
    ) {
        if let Ok(quote) = planner_with(policy).plan(&snap, target) {
            prop_assert_eq!(quote.recipient_amount, target);
            prop_assert_eq!(quote.target_amount, target);
            prop_assert_eq!(quote.settlement_gross, target + quote.fees.platform_fee);
            prop_assert_eq!(quote.payer_total, target + quote.fees.total());
            prop_assert!(quote.payer_total >= quote.settlement_gross);
        }
    }

    #[test]
    fn prop_feasible_plans_cover_payer_total(
        snap in arb_snapshot(),
        target in arb_target(),
        policy in arb_fee_policy(),
    ) {
        let tolerance = policy.rounding_tolerance;
        match planner_with(policy).plan(&snap, target) {
            Ok(quote) => {
                let planned: Decimal = quote.plan.iter().map(|s| s.amount).sum();
                prop_assert!(
                    planned + tolerance >= quote.payer_total,
                    "plan {} does not cover {}",
                    planned,
                    quote.payer_total
                );
                prop_assert!(quote.plan.iter().all(|s| s.amount > Decimal::ZERO));
            }
            Err(PlanError::Infeasible { shortfall, required }) => {
                prop_assert!(shortfall > tolerance);
                prop_assert!(required > target);
            }
            Err(other) => prop_assert!(false, "unexpected error {:?}", other),
        }
    }
}
