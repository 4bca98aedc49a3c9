//! Property tests checking the invariants that must hold after any legal
//! sequence of approve/allocate/reverse/confirm operations.

use chrono::Utc;
use kudu_ledger_core::aggregates;
use kudu_ledger_core::categories::Category;
use kudu_ledger_core::deposits;
use kudu_ledger_core::ledger::LedgerReplay;
use kudu_ledger_core::ledger::{LedgerEntryType, reconstruct_approved_total};
use kudu_ledger_core::merchants::StaticMerchantDirectory;
use kudu_ledger_core::sponsorship::{self, CategoryAmount};
use kudu_ledger_core::store::memory::MemoryStore;
use kudu_ledger_core::transactions;
use proptest::prelude::*;

const CATEGORIES: &[Category] = &[Category::FoodAndGroceries, Category::Transport, Category::Books];

#[derive(Debug, Clone)]
enum Op {
    Approve(i64),
    Allocate(usize, i64),
    Reverse(usize, i64),
    Spend(usize, i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..500_00).prop_map(Op::Approve),
        (0usize..CATEGORIES.len(), 1i64..50_00).prop_map(|(c, a)| Op::Allocate(c, a)),
        (0usize..CATEGORIES.len(), 1i64..50_00).prop_map(|(c, a)| Op::Reverse(c, a)),
        (0usize..CATEGORIES.len(), 1i64..50_00).prop_map(|(c, a)| Op::Spend(c, a)),
    ]
}

async fn run_history(ops: &[Op]) -> MemoryStore {
    let store = MemoryStore::new();
    let directory = StaticMerchantDirectory::new();
    let now = Utc::now();
    aggregates::seed_sponsor_aggregate(&store, "s1").await.unwrap();
    sponsorship::link_student(&store, "s1", "st1", now).await.unwrap();

    for op in ops {
        match op {
            Op::Approve(amount) => {
                aggregates::credit_sponsor_approved(&store, "s1", *amount).await.unwrap();
            }
            Op::Allocate(cat_idx, amount) => {
                let _ = sponsorship::allocate(
                    &store,
                    "s1",
                    "st1",
                    &[CategoryAmount { category: CATEGORIES[*cat_idx], amount_cents: *amount }],
                    None,
                    now,
                )
                .await;
            }
            Op::Reverse(cat_idx, amount) => {
                let _ = sponsorship::reverse(
                    &store,
                    "s1",
                    "st1",
                    &[CategoryAmount { category: CATEGORIES[*cat_idx], amount_cents: *amount }],
                    None,
                    now,
                )
                .await;
            }
            Op::Spend(cat_idx, amount) => {
                if let Ok(pending) =
                    transactions::prepare(&store, &directory, "st1", None, Some(CATEGORIES[*cat_idx]), *amount, None, now).await
                {
                    let _ = transactions::confirm(&store, &directory, "st1", &pending.tx_id, pending.created_at, None, now).await;
                }
            }
        }
    }
    store
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn available_equals_approved_minus_allocated(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = rt.block_on(run_history(&ops));

        let agg = rt.block_on(aggregates::load_sponsor_aggregate(&store, "s1")).unwrap().unwrap();
        prop_assert_eq!(agg.available_total_cents, agg.approved_total_cents - agg.allocated_total_cents);
    }

    #[test]
    fn budget_allocated_never_below_used(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = rt.block_on(run_history(&ops));

        for category in CATEGORIES {
            if let Some(budget) = rt.block_on(aggregates::load_budget(&store, "st1", "s1", category.canonical())).unwrap() {
                prop_assert!(budget.allocated_total_cents >= budget.used_total_cents);
                prop_assert!(budget.used_total_cents >= 0);
            }
        }
    }

    #[test]
    fn ledger_replay_reproduces_approved_total(approvals in prop::collection::vec(1i64..100_000, 0..10)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = MemoryStore::new();
        rt.block_on(aggregates::seed_sponsor_aggregate(&store, "s1")).unwrap();
        for amount in &approvals {
            rt.block_on(aggregates::credit_sponsor_approved(&store, "s1", *amount)).unwrap();
            rt.block_on(kudu_ledger_core::ledger::append_entry(
                &store,
                "SPONSOR#s1",
                1,
                &kudu_ledger_core::ledger::LedgerEntry {
                    entry_type: LedgerEntryType::DepositApproved,
                    amount_cents: *amount,
                    category: None,
                    sponsor_id: None,
                    tx_id: None,
                    eft_id: Some("eft".into()),
                },
                true,
            )).unwrap();
        }

        let replayed = rt.block_on(store.replay_signed_total("SPONSOR#s1", LedgerEntryType::DepositApproved)).unwrap();
        let expected: i64 = approvals.iter().sum();
        prop_assert_eq!(replayed, expected);

        let reconstructed = rt.block_on(reconstruct_approved_total(&store, "SPONSOR#s1")).unwrap();
        prop_assert_eq!(reconstructed, expected);
    }
}

#[tokio::test]
async fn concurrent_confirms_never_over_consume_a_lot() {
    let store = MemoryStore::new();
    let directory = StaticMerchantDirectory::new();
    let now = Utc::now();

    aggregates::seed_sponsor_aggregate(&store, "s1").await.unwrap();
    aggregates::credit_sponsor_approved(&store, "s1", 100_000).await.unwrap();
    sponsorship::link_student(&store, "s1", "st1", now).await.unwrap();
    sponsorship::allocate(&store, "s1", "st1", &[CategoryAmount { category: Category::Transport, amount_cents: 10_000 }], None, now)
        .await
        .unwrap();

    let pending_a = transactions::prepare(&store, &directory, "st1", None, Some(Category::Transport), 6_000, None, now).await.unwrap();
    let pending_b = transactions::prepare(&store, &directory, "st1", None, Some(Category::Transport), 6_000, None, now).await.unwrap();

    let result_a = transactions::confirm(&store, &directory, "st1", &pending_a.tx_id, pending_a.created_at, None, now).await;
    let result_b = transactions::confirm(&store, &directory, "st1", &pending_b.tx_id, pending_b.created_at, None, now).await;

    let mut total_confirmed = 0i64;
    for result in [result_a, result_b] {
        if let Ok(transactions::ConfirmResult::Final(spend)) = result {
            total_confirmed += spend.amount_cents;
        }
    }
    assert!(total_confirmed <= 10_000, "over-consumed: {total_confirmed}");
}

#[tokio::test]
async fn eft_state_machine_allows_exactly_one_terminal_transition() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let deposit = deposits::submit(&store, "s1", 50_000, None, None, now).await.unwrap();

    let first = deposits::approve(&store, &deposit.id, 50_000, "admin", None, now).await.unwrap();
    assert!(matches!(first, deposits::EftApproveResult::Approved(_)));

    let second = deposits::approve(&store, &deposit.id, 50_000, "admin", None, now).await.unwrap();
    assert!(matches!(second, deposits::EftApproveResult::AlreadyTerminal(deposits::EftStatus::Allocated)));

    let third = deposits::reject(&store, &deposit.id, "too late", None, now).await.unwrap();
    assert!(matches!(third, deposits::EftApproveResult::AlreadyTerminal(deposits::EftStatus::Allocated)));
}
