//! Allocation lots: per (student, category) slices of a sponsor's credit,
//! the unit of FIFO consumption by spends and LIFO consumption by reversal.

use uuid::Uuid;

use crate::aggregates::student_pk;
use crate::store::{Item, QueryOpts, StoreAdapter, UpdateCondition, UpdateExpr, WriteOp};

#[derive(Debug, Clone)]
pub struct AllocationLot {
    pub student_id: String,
    pub sk: String,
    pub category: String,
    pub sponsor_id: String,
    pub amount_cents: i64,
    pub remaining_cents: i64,
}

impl AllocationLot {
    fn from_item(student_id: &str, category: &str, item: &Item) -> Self {
        Self {
            student_id: student_id.to_string(),
            sk: item.sk.clone(),
            category: category.to_string(),
            sponsor_id: item.get_str("sponsorId").unwrap_or_default().to_string(),
            amount_cents: item.get_i64("amount_cents").unwrap_or(0),
            remaining_cents: item.get_i64("remaining_cents").unwrap_or(0),
        }
    }
}

fn lot_prefix(category: &str) -> String {
    format!("ALLOT#{category}#")
}

fn lot_sort_key(category: &str, epoch_ms: u64) -> String {
    format!("ALLOT#{category}#{epoch_ms:013}#{}", Uuid::new_v4())
}

pub async fn create_lot<S: StoreAdapter>(
    store: &S,
    student_id: &str,
    sponsor_id: &str,
    category: &str,
    amount_cents: i64,
    epoch_ms: u64,
) -> crate::Result<AllocationLot> {
    let sk = lot_sort_key(category, epoch_ms);
    let item = Item::new(student_pk(student_id), sk.clone())
        .with("sponsorId", sponsor_id)
        .with("amount_cents", amount_cents)
        .with("remaining_cents", amount_cents);
    store.put(item, None).await?;
    Ok(AllocationLot {
        student_id: student_id.to_string(),
        sk,
        category: category.to_string(),
        sponsor_id: sponsor_id.to_string(),
        amount_cents,
        remaining_cents: amount_cents,
    })
}

async fn query_lots<S: StoreAdapter>(
    store: &S,
    student_id: &str,
    category: &str,
    forward: bool,
) -> crate::Result<Vec<AllocationLot>> {
    let page = store
        .query(
            &student_pk(student_id),
            &lot_prefix(category),
            QueryOpts { forward, limit: None, cursor: None },
        )
        .await?;
    Ok(page
        .items
        .iter()
        .map(|i| AllocationLot::from_item(student_id, category, i))
        .collect())
}

/// Ascending by creation time (spend confirmation order).
pub async fn query_lots_fifo<S: StoreAdapter>(
    store: &S,
    student_id: &str,
    category: &str,
) -> crate::Result<Vec<AllocationLot>> {
    query_lots(store, student_id, category, true).await
}

/// Descending by creation time, filtered to one sponsor's remaining lots
/// (reversal order).
pub async fn query_lots_lifo<S: StoreAdapter>(
    store: &S,
    student_id: &str,
    category: &str,
    sponsor_id: &str,
) -> crate::Result<Vec<AllocationLot>> {
    let mut lots = query_lots(store, student_id, category, false).await?;
    lots.retain(|l| l.sponsor_id == sponsor_id && l.remaining_cents > 0);
    Ok(lots)
}

/// Greedily plan consumption against an ordered lot list, taking from each
/// until `amount_cents` is satisfied or lots run out. Does not write
/// anything; callers either stage the result into a transactional batch
/// (confirm) or apply it immediately lot by lot (reversal).
pub fn plan_consumption(lots: &[AllocationLot], amount_cents: i64) -> Vec<(AllocationLot, i64)> {
    let mut remaining = amount_cents;
    let mut plan = Vec::new();
    for lot in lots {
        if remaining <= 0 {
            break;
        }
        if lot.remaining_cents <= 0 {
            continue;
        }
        let take = remaining.min(lot.remaining_cents);
        plan.push((lot.clone(), take));
        remaining -= take;
    }
    plan
}

/// Sum of `take` across a plan, the amount that will actually be consumed,
/// which may be less than requested if lots run dry.
pub fn plan_total(plan: &[(AllocationLot, i64)]) -> i64 {
    plan.iter().map(|(_, take)| take).sum()
}

pub fn decrement_write_op(lot: &AllocationLot, take: i64) -> WriteOp {
    WriteOp::Update {
        pk: student_pk(&lot.student_id),
        sk: lot.sk.clone(),
        expr: vec![UpdateExpr::Incr { field: "remaining_cents".into(), by: -take }],
        condition: Some(UpdateCondition::FieldAtLeast {
            field: "remaining_cents".into(),
            minimum: take,
        }),
    }
}

/// Apply a consumption plan immediately, lot by lot, skipping any lot whose
/// conditional decrement fails (another writer drained it first). Returns
/// the amount actually drained. Used by reversal, which is not staged into
/// a single atomic batch per spec §4.7.
pub async fn apply_plan_best_effort<S: StoreAdapter>(
    store: &S,
    plan: &[(AllocationLot, i64)],
) -> crate::Result<i64> {
    let mut drained = 0i64;
    for (lot, take) in plan {
        let result = store
            .update(
                &student_pk(&lot.student_id),
                &lot.sk,
                vec![UpdateExpr::Incr { field: "remaining_cents".into(), by: -take }],
                Some(UpdateCondition::FieldAtLeast {
                    field: "remaining_cents".into(),
                    minimum: *take,
                }),
            )
            .await;
        match result {
            Ok(_) => drained += take,
            Err(crate::store::StoreError::ConditionFailed { .. }) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(drained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn fifo_order_matches_creation_order() {
        let store = MemoryStore::new();
        create_lot(&store, "st1", "s1", "Food", 10_000, 1_000).await.unwrap();
        create_lot(&store, "st1", "s1", "Food", 20_000, 2_000).await.unwrap();
        create_lot(&store, "st1", "s1", "Food", 30_000, 3_000).await.unwrap();

        let lots = query_lots_fifo(&store, "st1", "Food").await.unwrap();
        let amounts: Vec<i64> = lots.iter().map(|l| l.amount_cents).collect();
        assert_eq!(amounts, vec![10_000, 20_000, 30_000]);
    }

    #[tokio::test]
    async fn lifo_reversal_drains_most_recent_lot_first() {
        let store = MemoryStore::new();
        create_lot(&store, "st1", "s1", "Food", 10_000, 1_000).await.unwrap();
        create_lot(&store, "st1", "s1", "Food", 20_000, 2_000).await.unwrap();
        create_lot(&store, "st1", "s1", "Food", 30_000, 3_000).await.unwrap();

        let lots = query_lots_lifo(&store, "st1", "Food", "s1").await.unwrap();
        let plan = plan_consumption(&lots, 25_000);
        let drained = apply_plan_best_effort(&store, &plan).await.unwrap();
        assert_eq!(drained, 25_000);

        let remaining = query_lots_fifo(&store, "st1", "Food").await.unwrap();
        let by_amount: Vec<(i64, i64)> = remaining
            .iter()
            .map(|l| (l.amount_cents, l.remaining_cents))
            .collect();
        assert_eq!(by_amount, vec![(10_000, 10_000), (20_000, 20_000), (30_000, 5_000)]);
    }

    #[tokio::test]
    async fn fifo_confirm_consumes_oldest_lot_first() {
        let store = MemoryStore::new();
        create_lot(&store, "st1", "s1", "Food", 10_000, 1_000).await.unwrap();
        create_lot(&store, "st1", "s1", "Food", 20_000, 2_000).await.unwrap();

        let lots = query_lots_fifo(&store, "st1", "Food").await.unwrap();
        let plan = plan_consumption(&lots, 15_000);
        assert_eq!(plan_total(&plan), 15_000);
        assert_eq!(plan[0].1, 10_000);
        assert_eq!(plan[1].1, 5_000);
    }
}
