//! Sponsor-student linking, allocation, and reversal.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregates::{self, Budget};
use crate::categories::Category;
use crate::deposits;
use crate::error::CoreError;
use crate::idempotency;
use crate::ledger::{self, LedgerEntry, LedgerEntryType};
use crate::lots;
use crate::store::memory::with_gsi;
use crate::store::{Item, PutCondition, StoreAdapter};

fn sponsor_pk(sponsor_id: &str) -> String {
    format!("SPONSOR#{sponsor_id}")
}

fn student_pk(student_id: &str) -> String {
    format!("STUDENT#{student_id}")
}

fn link_sk(student_id: &str) -> String {
    format!("STUDENT_LINK#{student_id}")
}

/// Links a sponsor to a student. `ConditionFailed` (already linked) is
/// treated as success and returned idempotently, per spec §4.5.
pub async fn link_student<S: StoreAdapter>(
    store: &S,
    sponsor_id: &str,
    student_id: &str,
    now: DateTime<Utc>,
) -> crate::Result<()> {
    let item = with_gsi(
        Item::new(sponsor_pk(sponsor_id), link_sk(student_id)).with("createdAt", now.to_rfc3339()),
        "GSI2",
        student_pk(student_id),
        format!("SPON#{}#{sponsor_id}", now.timestamp_millis()),
    );
    match store.put(item, Some(PutCondition::AttributeNotExists)).await {
        Ok(()) => Ok(()),
        Err(crate::store::StoreError::ConditionFailed { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn is_linked<S: StoreAdapter>(store: &S, sponsor_id: &str, student_id: &str) -> crate::Result<bool> {
    Ok(store.get(&sponsor_pk(sponsor_id), &link_sk(student_id)).await?.is_some())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryAmount {
    pub category: Category,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub category: Category,
    pub allocated_total_cents: i64,
    pub used_total_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateResult {
    pub budgets: Vec<BudgetSummary>,
}

/// Allocates a sponsor's credit to a student across one or more categories.
pub async fn allocate<S: StoreAdapter>(
    store: &S,
    sponsor_id: &str,
    student_id: &str,
    lines: &[CategoryAmount],
    idempotency_key: Option<&str>,
    now: DateTime<Utc>,
) -> crate::Result<AllocateResult> {
    let scope = idempotency::scope("ALLOCATE", &[sponsor_id, student_id]);
    if let Some(key) = idempotency_key {
        if let Some(cached) = idempotency::lookup(store, &scope, key, now).await? {
            return serde_json::from_value(cached).map_err(|e| CoreError::Internal(e.to_string()));
        }
    }

    if lines.is_empty() {
        return Err(CoreError::BadInput("allocation must include at least one category".into()));
    }
    for line in lines {
        if line.amount_cents <= 0 {
            return Err(CoreError::BadInput("allocation amounts must be > 0".into()));
        }
    }
    if !is_linked(store, sponsor_id, student_id).await? {
        return Err(CoreError::BadInput(format!("sponsor {sponsor_id} is not linked to student {student_id}")));
    }

    let total: i64 = lines.iter().map(|l| l.amount_cents).sum();
    let balance = deposits::effective_balance(store, sponsor_id).await?;
    if balance < total {
        return Err(CoreError::InsufficientCredits { requested: total, available: balance });
    }

    aggregates::apply_allocation(store, sponsor_id, total).await?;
    aggregates::incr_sponsor_student_aggregate(store, student_id, sponsor_id, total).await?;

    let mut touched: BTreeMap<String, Category> = BTreeMap::new();
    for (i, line) in lines.iter().enumerate() {
        let category_name = line.category.canonical();
        lots::create_lot(
            store,
            student_id,
            sponsor_id,
            category_name,
            line.amount_cents,
            now.timestamp_millis() as u64 + i as u64,
        )
        .await?;

        let entry = LedgerEntry {
            entry_type: LedgerEntryType::Allocation,
            amount_cents: line.amount_cents,
            category: Some(category_name.to_string()),
            sponsor_id: Some(sponsor_id.to_string()),
            tx_id: None,
            eft_id: None,
        };
        ledger::append_entry(store, &student_pk(student_id), now.timestamp_millis() as u64 + i as u64, &entry, false)
            .await?;

        aggregates::incr_budget_allocated(store, student_id, sponsor_id, category_name, line.amount_cents).await?;
        touched.insert(category_name.to_string(), line.category);
    }

    let mut budgets = Vec::new();
    for (name, category) in touched {
        if let Some(b) = aggregates::load_budget(store, student_id, sponsor_id, &name).await? {
            budgets.push(BudgetSummary {
                category,
                allocated_total_cents: b.allocated_total_cents,
                used_total_cents: b.used_total_cents,
            });
        }
    }
    let result = AllocateResult { budgets };
    if let Some(key) = idempotency_key {
        let cached = serde_json::to_value(&result).map_err(|e| CoreError::Internal(e.to_string()))?;
        idempotency::record(store, &scope, key, &cached, idempotency::DEFAULT_TTL_DAYS, now).await;
    }
    Ok(result)
}

/// Reverses previously allocated, unused credit, LIFO, per spec §4.7.
pub async fn reverse<S: StoreAdapter>(
    store: &S,
    sponsor_id: &str,
    student_id: &str,
    lines: &[CategoryAmount],
    idempotency_key: Option<&str>,
    now: DateTime<Utc>,
) -> crate::Result<AllocateResult> {
    let scope = idempotency::scope("REVERSE", &[sponsor_id, student_id]);
    if let Some(key) = idempotency_key {
        if let Some(cached) = idempotency::lookup(store, &scope, key, now).await? {
            return serde_json::from_value(cached).map_err(|e| CoreError::Internal(e.to_string()));
        }
    }

    let mut budgets = Vec::new();
    for line in lines {
        let category_name = line.category.canonical();
        let budget = aggregates::load_budget(store, student_id, sponsor_id, category_name)
            .await?
            .unwrap_or(Budget { allocated_total_cents: 0, used_total_cents: 0 });
        let max_reducible = budget.allocated_total_cents - budget.used_total_cents;
        if max_reducible <= 0 {
            continue;
        }

        let sponsor_lots = lots::query_lots_lifo(store, student_id, category_name, sponsor_id).await?;
        let sponsor_remaining: i64 = sponsor_lots.iter().map(|l| l.remaining_cents).sum();
        let target = line.amount_cents.min(max_reducible).min(sponsor_remaining);
        if target <= 0 {
            continue;
        }

        let plan = lots::plan_consumption(&sponsor_lots, target);
        let drained = lots::apply_plan_best_effort(store, &plan).await?;
        if drained == 0 {
            continue;
        }

        aggregates::apply_reversal(store, sponsor_id, drained).await?;
        aggregates::incr_sponsor_student_aggregate(store, student_id, sponsor_id, -drained).await?;
        let updated = aggregates::incr_budget_allocated(store, student_id, sponsor_id, category_name, -drained).await?;

        let entry = LedgerEntry {
            entry_type: LedgerEntryType::Reversal,
            amount_cents: drained,
            category: Some(category_name.to_string()),
            sponsor_id: Some(sponsor_id.to_string()),
            tx_id: None,
            eft_id: None,
        };
        ledger::append_entry(store, &student_pk(student_id), now.timestamp_millis() as u64, &entry, false).await?;

        budgets.push(BudgetSummary {
            category: line.category,
            allocated_total_cents: updated.allocated_total_cents,
            used_total_cents: updated.used_total_cents,
        });
    }
    let result = AllocateResult { budgets };
    if let Some(key) = idempotency_key {
        let cached = serde_json::to_value(&result).map_err(|e| CoreError::Internal(e.to_string()))?;
        idempotency::record(store, &scope, key, &cached, idempotency::DEFAULT_TTL_DAYS, now).await;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    async fn funded_sponsor(store: &MemoryStore, sponsor_id: &str, amount: i64) {
        aggregates::seed_sponsor_aggregate(store, sponsor_id).await.unwrap();
        aggregates::credit_sponsor_approved(store, sponsor_id, amount).await.unwrap();
    }

    #[tokio::test]
    async fn allocate_requires_link() {
        let store = MemoryStore::new();
        funded_sponsor(&store, "s1", 100_000).await;
        let lines = vec![CategoryAmount { category: Category::Transport, amount_cents: 10_000 }];
        let err = allocate(&store, "s1", "st1", &lines, None, Utc::now()).await.unwrap_err();
        assert!(matches!(err, CoreError::BadInput(_)));
    }

    #[tokio::test]
    async fn allocate_fails_when_balance_insufficient() {
        let store = MemoryStore::new();
        funded_sponsor(&store, "s1", 10_000).await;
        link_student(&store, "s1", "st1", Utc::now()).await.unwrap();
        let lines = vec![CategoryAmount { category: Category::Transport, amount_cents: 15_000 }];
        let err = allocate(&store, "s1", "st1", &lines, None, Utc::now()).await.unwrap_err();
        assert!(matches!(err, CoreError::InsufficientCredits { requested: 15_000, available: 10_000 }));
    }

    #[tokio::test]
    async fn allocate_then_reverse_lifo() {
        let store = MemoryStore::new();
        funded_sponsor(&store, "s1", 200_000).await;
        link_student(&store, "s1", "st1", Utc::now()).await.unwrap();

        allocate(&store, "s1", "st1", &[CategoryAmount { category: Category::FoodAndGroceries, amount_cents: 10_000 }], None, Utc::now()).await.unwrap();
        allocate(&store, "s1", "st1", &[CategoryAmount { category: Category::FoodAndGroceries, amount_cents: 20_000 }], None, Utc::now()).await.unwrap();
        allocate(&store, "s1", "st1", &[CategoryAmount { category: Category::FoodAndGroceries, amount_cents: 30_000 }], None, Utc::now()).await.unwrap();

        let result = reverse(&store, "s1", "st1", &[CategoryAmount { category: Category::FoodAndGroceries, amount_cents: 25_000 }], None, Utc::now()).await.unwrap();
        assert_eq!(result.budgets[0].allocated_total_cents, 35_000);
    }

    #[tokio::test]
    async fn repeated_allocate_with_same_key_allocates_once() {
        let store = MemoryStore::new();
        funded_sponsor(&store, "s1", 100_000).await;
        link_student(&store, "s1", "st1", Utc::now()).await.unwrap();
        let lines = vec![CategoryAmount { category: Category::Transport, amount_cents: 10_000 }];
        let now = Utc::now();

        let first = allocate(&store, "s1", "st1", &lines, Some("alloc-key-1"), now).await.unwrap();
        let second = allocate(&store, "s1", "st1", &lines, Some("alloc-key-1"), now).await.unwrap();
        assert_eq!(first.budgets[0].allocated_total_cents, second.budgets[0].allocated_total_cents);

        let budget = aggregates::load_budget(&store, "st1", "s1", Category::Transport.canonical()).await.unwrap().unwrap();
        assert_eq!(budget.allocated_total_cents, 10_000);
    }
}
