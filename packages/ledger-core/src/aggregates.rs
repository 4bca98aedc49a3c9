//! Denormalized counters kept coherent with the ledger via conditional
//! arithmetic only, never read-modify-write from application memory.

use serde::{Deserialize, Serialize};

use crate::store::{Item, PutCondition, StoreAdapter, UpdateCondition, UpdateExpr};

pub fn sponsor_pk(sponsor_id: &str) -> String {
    format!("SPONSOR#{sponsor_id}")
}

pub fn student_pk(student_id: &str) -> String {
    format!("STUDENT#{student_id}")
}

pub const SPONSOR_AGGREGATE_SK: &str = "AGGREGATE";

pub fn sponsor_student_aggregate_sk(sponsor_id: &str) -> String {
    format!("AGG#SPONSOR#{sponsor_id}")
}

pub fn budget_sk(sponsor_id: &str, category: &str) -> String {
    format!("BUDGET#SPONSOR#{sponsor_id}#CATEGORY#{category}")
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SponsorAggregate {
    pub approved_total_cents: i64,
    pub allocated_total_cents: i64,
    pub available_total_cents: i64,
}

impl SponsorAggregate {
    pub fn from_item(item: &Item) -> Self {
        Self {
            approved_total_cents: item.get_i64("approved_total_cents").unwrap_or(0),
            allocated_total_cents: item.get_i64("allocated_total_cents").unwrap_or(0),
            available_total_cents: item.get_i64("available_total_cents").unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SponsorStudentAggregate {
    pub allocated_total_cents: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Budget {
    pub allocated_total_cents: i64,
    pub used_total_cents: i64,
}

impl Budget {
    pub fn from_item(item: &Item) -> Self {
        Self {
            allocated_total_cents: item.get_i64("allocated_total_cents").unwrap_or(0),
            used_total_cents: item.get_i64("used_total_cents").unwrap_or(0),
        }
    }

    pub fn available(self) -> i64 {
        self.allocated_total_cents - self.used_total_cents
    }
}

/// Seed the sponsor aggregate row with zeroed counters if absent. Best
/// effort: a `ConditionFailed` here just means another writer got there
/// first, which is fine since the row already exists.
pub async fn seed_sponsor_aggregate<S: StoreAdapter>(store: &S, sponsor_id: &str) -> crate::Result<()> {
    let item = Item::new(sponsor_pk(sponsor_id), SPONSOR_AGGREGATE_SK)
        .with("approved_total_cents", 0)
        .with("allocated_total_cents", 0)
        .with("available_total_cents", 0);
    match store.put(item, Some(PutCondition::AttributeNotExists)).await {
        Ok(()) => Ok(()),
        Err(crate::store::StoreError::ConditionFailed { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn load_sponsor_aggregate<S: StoreAdapter>(
    store: &S,
    sponsor_id: &str,
) -> crate::Result<Option<SponsorAggregate>> {
    let item = store.get(&sponsor_pk(sponsor_id), SPONSOR_AGGREGATE_SK).await?;
    Ok(item.map(|i| SponsorAggregate::from_item(&i)))
}

/// Approve credit: `approved_total_cents += amount`, `available_total_cents += amount`.
pub async fn credit_sponsor_approved<S: StoreAdapter>(
    store: &S,
    sponsor_id: &str,
    amount_cents: i64,
) -> crate::Result<SponsorAggregate> {
    let item = store
        .update(
            &sponsor_pk(sponsor_id),
            SPONSOR_AGGREGATE_SK,
            vec![
                UpdateExpr::Incr { field: "approved_total_cents".into(), by: amount_cents },
                UpdateExpr::Incr { field: "available_total_cents".into(), by: amount_cents },
            ],
            None,
        )
        .await?;
    Ok(SponsorAggregate::from_item(&item))
}

/// Allocation: `allocated_total_cents += amount`, `available_total_cents -= amount`.
pub async fn apply_allocation<S: StoreAdapter>(
    store: &S,
    sponsor_id: &str,
    amount_cents: i64,
) -> crate::Result<SponsorAggregate> {
    let item = store
        .update(
            &sponsor_pk(sponsor_id),
            SPONSOR_AGGREGATE_SK,
            vec![
                UpdateExpr::Incr { field: "allocated_total_cents".into(), by: amount_cents },
                UpdateExpr::Incr { field: "available_total_cents".into(), by: -amount_cents },
            ],
            None,
        )
        .await?;
    Ok(SponsorAggregate::from_item(&item))
}

/// Reversal: symmetric undo of [`apply_allocation`] for the amount actually
/// drained from lots, keeping `available = approved - allocated` intact.
pub async fn apply_reversal<S: StoreAdapter>(
    store: &S,
    sponsor_id: &str,
    amount_cents: i64,
) -> crate::Result<SponsorAggregate> {
    apply_allocation(store, sponsor_id, -amount_cents).await
}

pub async fn incr_sponsor_student_aggregate<S: StoreAdapter>(
    store: &S,
    student_id: &str,
    sponsor_id: &str,
    delta_cents: i64,
) -> crate::Result<SponsorStudentAggregate> {
    let item = store
        .update(
            &student_pk(student_id),
            &sponsor_student_aggregate_sk(sponsor_id),
            vec![UpdateExpr::Incr { field: "allocated_total_cents".into(), by: delta_cents }],
            None,
        )
        .await?;
    Ok(SponsorStudentAggregate {
        allocated_total_cents: item.get_i64("allocated_total_cents").unwrap_or(0),
    })
}

/// Extracts the category out of a budget sort key
/// (`BUDGET#SPONSOR#{sponsorId}#CATEGORY#{category}`), since a student's
/// budgets must be scanned by category across every funding sponsor.
fn parse_budget_sk(sk: &str) -> Option<(&str, &str)> {
    let rest = sk.strip_prefix("BUDGET#SPONSOR#")?;
    let (sponsor_id, rest) = rest.split_once("#CATEGORY#")?;
    Some((sponsor_id, rest))
}

/// Sums `allocated - used` across every sponsor's budget row for a student
/// in one category: the availability figure prepare/confirm compute.
pub async fn sum_available_for_category<S: StoreAdapter>(
    store: &S,
    student_id: &str,
    category: &str,
) -> crate::Result<i64> {
    let page = store
        .query(&student_pk(student_id), "BUDGET#", crate::store::QueryOpts::default())
        .await?;
    let total = page
        .items
        .iter()
        .filter(|item| parse_budget_sk(&item.sk).map(|(_, cat)| cat == category).unwrap_or(false))
        .map(|item| Budget::from_item(item).available())
        .sum();
    Ok(total)
}

/// Every `(sponsor_id, Budget)` row for a student in one category, used by
/// refund's optional budget-restoring semantics (spec §9 Open Question).
pub async fn list_budgets_for_category<S: StoreAdapter>(
    store: &S,
    student_id: &str,
    category: &str,
) -> crate::Result<Vec<(String, Budget)>> {
    let page = store
        .query(&student_pk(student_id), "BUDGET#", crate::store::QueryOpts::default())
        .await?;
    Ok(page
        .items
        .iter()
        .filter_map(|item| {
            let (sponsor_id, cat) = parse_budget_sk(&item.sk)?;
            (cat == category).then(|| (sponsor_id.to_string(), Budget::from_item(item)))
        })
        .collect())
}

/// `used_total_cents -= amount`, guarded so it never goes negative.
pub async fn decr_budget_used<S: StoreAdapter>(
    store: &S,
    student_id: &str,
    sponsor_id: &str,
    category: &str,
    amount_cents: i64,
) -> crate::Result<Budget> {
    let item = store
        .update(
            &student_pk(student_id),
            &budget_sk(sponsor_id, category),
            vec![UpdateExpr::Incr { field: "used_total_cents".into(), by: -amount_cents }],
            Some(UpdateCondition::FieldAtLeast {
                field: "used_total_cents".into(),
                minimum: amount_cents,
            }),
        )
        .await?;
    Ok(Budget::from_item(&item))
}

pub async fn load_budget<S: StoreAdapter>(
    store: &S,
    student_id: &str,
    sponsor_id: &str,
    category: &str,
) -> crate::Result<Option<Budget>> {
    let item = store
        .get(&student_pk(student_id), &budget_sk(sponsor_id, category))
        .await?;
    Ok(item.map(|i| Budget::from_item(&i)))
}

/// `allocated_total_cents += amount`, creating the row with zero
/// `used_total_cents` if absent, per spec §4.6 step 5.
pub async fn incr_budget_allocated<S: StoreAdapter>(
    store: &S,
    student_id: &str,
    sponsor_id: &str,
    category: &str,
    amount_cents: i64,
) -> crate::Result<Budget> {
    let item = store
        .update(
            &student_pk(student_id),
            &budget_sk(sponsor_id, category),
            vec![
                UpdateExpr::Incr { field: "allocated_total_cents".into(), by: amount_cents },
                UpdateExpr::Incr { field: "used_total_cents".into(), by: 0 },
            ],
            None,
        )
        .await?;
    Ok(Budget::from_item(&item))
}

/// `used_total_cents += take`, guarded by `allocated_total_cents >= take` (the
/// store can only compare a field against a constant, not against another
/// field). This alone does not bound `used` by `allocated`; callers must
/// first size `take` against the real remaining lot capacity, which is what
/// keeps a racing confirm from over-consuming the budget.
pub async fn incr_budget_used<S: StoreAdapter>(
    store: &S,
    student_id: &str,
    sponsor_id: &str,
    category: &str,
    take_cents: i64,
) -> crate::Result<Budget> {
    let item = store
        .update(
            &student_pk(student_id),
            &budget_sk(sponsor_id, category),
            vec![UpdateExpr::Incr { field: "used_total_cents".into(), by: take_cents }],
            Some(UpdateCondition::FieldAtLeast {
                field: "allocated_total_cents".into(),
                minimum: take_cents,
            }),
        )
        .await?;
    Ok(Budget::from_item(&item))
}
