//! Literal scenario tests against a `MemoryStore`, mirroring the six
//! worked examples used to validate the budget engine's behavior.

use chrono::Utc;
use kudu_ledger_core::aggregates;
use kudu_ledger_core::categories::Category;
use kudu_ledger_core::deposits::{self, EftApproveResult};
use kudu_ledger_core::merchants::StaticMerchantDirectory;
use kudu_ledger_core::sponsorship::{self, CategoryAmount};
use kudu_ledger_core::store::memory::MemoryStore;
use kudu_ledger_core::transactions::{self, ConfirmResult, SpendStatus};
use kudu_ledger_core::CoreError;

#[tokio::test]
async fn deposit_approve_allocate_spend_fully_covered() {
    let store = MemoryStore::new();
    let directory = StaticMerchantDirectory::new();
    let now = Utc::now();

    let deposit = deposits::submit(&store, "sponsor-1", 200_000, None, None, now).await.unwrap();
    let approval = deposits::approve(&store, &deposit.id, 200_000, "admin-1", None, now).await.unwrap();
    assert!(matches!(approval, EftApproveResult::Approved(_)));

    sponsorship::link_student(&store, "sponsor-1", "student-1", now).await.unwrap();
    sponsorship::allocate(
        &store,
        "sponsor-1",
        "student-1",
        &[
            CategoryAmount { category: Category::FoodAndGroceries, amount_cents: 120_000 },
            CategoryAmount { category: Category::Transport, amount_cents: 50_000 },
        ],
        None,
        now,
    )
    .await
    .unwrap();

    let pending = transactions::prepare(
        &store,
        &directory,
        "student-1",
        None,
        Some(Category::FoodAndGroceries),
        30_000,
        None,
        now,
    )
    .await
    .unwrap();
    assert_eq!(pending.amount_covered_cents, 30_000);
    assert_eq!(pending.amount_shortfall_cents, 0);

    let result = transactions::confirm(&store, &directory, "student-1", &pending.tx_id, pending.created_at, None, now)
        .await
        .unwrap();
    match result {
        ConfirmResult::Final(spend) => assert_eq!(spend.status, SpendStatus::Approved),
        other => panic!("expected Final(Approved), got {other:?}"),
    }

    let sponsor_agg = aggregates::load_sponsor_aggregate(&store, "sponsor-1").await.unwrap().unwrap();
    assert_eq!(sponsor_agg.approved_total_cents, 200_000);
    assert_eq!(sponsor_agg.allocated_total_cents, 170_000);
    assert_eq!(sponsor_agg.available_total_cents, 30_000);

    let food_budget = aggregates::load_budget(&store, "student-1", "sponsor-1", "Food & Groceries")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(food_budget.allocated_total_cents, 120_000);
    assert_eq!(food_budget.used_total_cents, 30_000);
    assert_eq!(food_budget.available(), 90_000);
}

#[tokio::test]
async fn partial_coverage_confirms_as_partial_approved() {
    let store = MemoryStore::new();
    let directory = StaticMerchantDirectory::new();
    let now = Utc::now();

    aggregates::seed_sponsor_aggregate(&store, "sponsor-1").await.unwrap();
    aggregates::credit_sponsor_approved(&store, "sponsor-1", 200_000).await.unwrap();
    sponsorship::link_student(&store, "sponsor-1", "student-1", now).await.unwrap();
    sponsorship::allocate(
        &store,
        "sponsor-1",
        "student-1",
        &[
            CategoryAmount { category: Category::FoodAndGroceries, amount_cents: 120_000 },
            CategoryAmount { category: Category::Transport, amount_cents: 50_000 },
        ],
        None,
        now,
    )
    .await
    .unwrap();

    let pending = transactions::prepare(&store, &directory, "student-1", None, Some(Category::Transport), 60_000, None, now)
        .await
        .unwrap();
    assert_eq!(pending.amount_covered_cents, 50_000);
    assert_eq!(pending.amount_shortfall_cents, 10_000);

    let result = transactions::confirm(&store, &directory, "student-1", &pending.tx_id, pending.created_at, None, now)
        .await
        .unwrap();
    assert!(matches!(result, ConfirmResult::Final(spend) if spend.status == SpendStatus::PartialApproved));

    let transport_budget = aggregates::load_budget(&store, "student-1", "sponsor-1", "Transport")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport_budget.allocated_total_cents, 50_000);
    assert_eq!(transport_budget.used_total_cents, 50_000);
    assert_eq!(transport_budget.available(), 0);
}

#[tokio::test]
async fn racing_confirm_reports_reconfirm_required_then_settles() {
    let store = MemoryStore::new();
    let directory = StaticMerchantDirectory::new();
    let now = Utc::now();

    aggregates::seed_sponsor_aggregate(&store, "sponsor-1").await.unwrap();
    aggregates::credit_sponsor_approved(&store, "sponsor-1", 200_000).await.unwrap();
    sponsorship::link_student(&store, "sponsor-1", "student-1", now).await.unwrap();
    sponsorship::allocate(&store, "sponsor-1", "student-1", &[CategoryAmount { category: Category::Transport, amount_cents: 50_000 }], None, now)
        .await
        .unwrap();

    let pending_a = transactions::prepare(&store, &directory, "student-1", None, Some(Category::Transport), 40_000, None, now)
        .await
        .unwrap();
    let pending_b = transactions::prepare(&store, &directory, "student-1", None, Some(Category::Transport), 30_000, None, now)
        .await
        .unwrap();
    transactions::confirm(&store, &directory, "student-1", &pending_b.tx_id, pending_b.created_at, None, now)
        .await
        .unwrap();

    let result = transactions::confirm(&store, &directory, "student-1", &pending_a.tx_id, pending_a.created_at, None, now)
        .await
        .unwrap();
    match result {
        ConfirmResult::ReconfirmRequired { amount_covered_cents, amount_shortfall_cents } => {
            assert_eq!(amount_covered_cents, 20_000);
            assert_eq!(amount_shortfall_cents, 20_000);
        }
        other => panic!("expected ReconfirmRequired, got {other:?}"),
    }

    let result = transactions::confirm(&store, &directory, "student-1", &pending_a.tx_id, pending_a.created_at, None, now)
        .await
        .unwrap();
    assert!(matches!(result, ConfirmResult::Final(spend) if spend.status == SpendStatus::PartialApproved));

    let transport_budget = aggregates::load_budget(&store, "student-1", "sponsor-1", "Transport")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport_budget.used_total_cents, 50_000);
}

#[tokio::test]
async fn allocation_beyond_balance_is_rejected_and_mutates_nothing() {
    let store = MemoryStore::new();
    let now = Utc::now();

    aggregates::seed_sponsor_aggregate(&store, "sponsor-1").await.unwrap();
    aggregates::credit_sponsor_approved(&store, "sponsor-1", 10_000).await.unwrap();
    sponsorship::link_student(&store, "sponsor-1", "student-1", now).await.unwrap();

    let err = sponsorship::allocate(
        &store,
        "sponsor-1",
        "student-1",
        &[CategoryAmount { category: Category::Transport, amount_cents: 15_000 }],
        None,
        now,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::InsufficientCredits { requested: 15_000, available: 10_000 }));

    let sponsor_agg = aggregates::load_sponsor_aggregate(&store, "sponsor-1").await.unwrap().unwrap();
    assert_eq!(sponsor_agg.allocated_total_cents, 0);
    assert_eq!(sponsor_agg.available_total_cents, 10_000);
    assert!(aggregates::load_budget(&store, "student-1", "sponsor-1", "Transport").await.unwrap().is_none());
}

#[tokio::test]
async fn reject_then_approve_conflicts_and_leaves_balance_unchanged() {
    let store = MemoryStore::new();
    let now = Utc::now();

    let deposit = deposits::submit(&store, "sponsor-1", 100_000, None, None, now).await.unwrap();
    let rejection = deposits::reject(&store, &deposit.id, "wrong amount", None, now).await.unwrap();
    assert!(matches!(rejection, EftApproveResult::AlreadyTerminal(deposits::EftStatus::Rejected)));

    let second = deposits::approve(&store, &deposit.id, 100_000, "admin-1", None, now).await.unwrap();
    assert!(matches!(second, EftApproveResult::AlreadyTerminal(deposits::EftStatus::Rejected)));

    let balance = deposits::effective_balance(&store, "sponsor-1").await.unwrap();
    assert_eq!(balance, 0);
}

#[tokio::test]
async fn reversal_drains_lots_lifo() {
    let store = MemoryStore::new();
    let directory = StaticMerchantDirectory::new();
    let now = Utc::now();

    aggregates::seed_sponsor_aggregate(&store, "sponsor-1").await.unwrap();
    aggregates::credit_sponsor_approved(&store, "sponsor-1", 60_000).await.unwrap();
    sponsorship::link_student(&store, "sponsor-1", "student-1", now).await.unwrap();

    sponsorship::allocate(&store, "sponsor-1", "student-1", &[CategoryAmount { category: Category::FoodAndGroceries, amount_cents: 10_000 }], None, now)
        .await
        .unwrap();
    sponsorship::allocate(&store, "sponsor-1", "student-1", &[CategoryAmount { category: Category::FoodAndGroceries, amount_cents: 20_000 }], None, now)
        .await
        .unwrap();
    sponsorship::allocate(&store, "sponsor-1", "student-1", &[CategoryAmount { category: Category::FoodAndGroceries, amount_cents: 30_000 }], None, now)
        .await
        .unwrap();

    let pending = transactions::prepare(&store, &directory, "student-1", None, Some(Category::FoodAndGroceries), 15_000, None, now)
        .await
        .unwrap();
    transactions::confirm(&store, &directory, "student-1", &pending.tx_id, pending.created_at, None, now)
        .await
        .unwrap();

    let result = sponsorship::reverse(
        &store,
        "sponsor-1",
        "student-1",
        &[CategoryAmount { category: Category::FoodAndGroceries, amount_cents: 25_000 }],
        None,
        now,
    )
    .await
    .unwrap();

    let budget = &result.budgets[0];
    assert_eq!(budget.allocated_total_cents, 35_000);
    assert_eq!(budget.used_total_cents, 15_000);
    assert_eq!(budget.allocated_total_cents - budget.used_total_cents, 20_000);
}
