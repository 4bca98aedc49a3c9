//! Two-phase transaction engine: prepare snapshots availability, confirm
//! atomically consumes lots and records the spend. Splitting the two lets a
//! client confirm an amount it has already shown to the user while the
//! conditional batch at confirm time still guards against over-consumption
//! under contention (spec §4.8).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregates;
use crate::categories::Category;
use crate::error::CoreError;
use crate::idempotency;
use crate::ledger::{self, LedgerEntry, LedgerEntryType};
use crate::lots;
use crate::merchants::{self, MerchantDirectory};
use crate::store::{Item, PutCondition, StoreAdapter, UpdateCondition, UpdateExpr, WriteOp};

fn student_pk(student_id: &str) -> String {
    format!("STUDENT#{student_id}")
}

fn pending_sk(created_at: &DateTime<Utc>, tx_id: &str) -> String {
    format!("TX#PENDING#{}#{tx_id}", created_at.timestamp_millis())
}

fn spend_sk(created_at: &DateTime<Utc>, tx_id: &str) -> String {
    format!("SPEND#{}#{tx_id}", created_at.timestamp_millis())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub tx_id: String,
    pub student_id: String,
    pub merchant_id: Option<String>,
    pub category: Category,
    pub amount_requested_cents: i64,
    pub amount_covered_cents: i64,
    pub amount_shortfall_cents: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendStatus {
    Approved,
    PartialApproved,
    Refunded,
    PartialRefunded,
}

impl SpendStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SpendStatus::Approved => "APPROVED",
            SpendStatus::PartialApproved => "PARTIAL_APPROVED",
            SpendStatus::Refunded => "REFUNDED",
            SpendStatus::PartialRefunded => "PARTIAL_REFUNDED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendRecord {
    pub tx_id: String,
    pub student_id: String,
    pub merchant_id: Option<String>,
    pub category: Category,
    pub amount_cents: i64,
    pub status: SpendStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfirmResult {
    Final(SpendRecord),
    ReconfirmRequired { amount_covered_cents: i64, amount_shortfall_cents: i64 },
}

/// Resolves the effective category strictly: merchant's canonical category
/// if `merchant_id` is given (merchant must exist, be approved and active),
/// otherwise the caller-supplied `category`.
async fn resolve_category(
    directory: &dyn MerchantDirectory,
    merchant_id: Option<&str>,
    category: Option<Category>,
) -> crate::Result<Category> {
    if let Some(mid) = merchant_id {
        let merchant = merchants::resolve_active_merchant(directory, mid).await?;
        Ok(merchant.category)
    } else {
        category.ok_or_else(|| CoreError::BadInput("category is required when merchantId is absent".into()))
    }
}

pub async fn prepare<S: StoreAdapter>(
    store: &S,
    directory: &dyn MerchantDirectory,
    student_id: &str,
    merchant_id: Option<&str>,
    category: Option<Category>,
    amount_requested_cents: i64,
    idempotency_key: Option<&str>,
    now: DateTime<Utc>,
) -> crate::Result<PendingTransaction> {
    let scope = idempotency::scope("PREPARE", &[student_id]);
    if let Some(key) = idempotency_key {
        if let Some(cached) = idempotency::lookup(store, &scope, key, now).await? {
            return serde_json::from_value(cached).map_err(|e| CoreError::Internal(e.to_string()));
        }
    }

    if amount_requested_cents <= 0 {
        return Err(CoreError::BadInput("amount_cents must be > 0".into()));
    }
    let category = resolve_category(directory, merchant_id, category).await?;
    let available = aggregates::sum_available_for_category(store, student_id, category.canonical()).await?;
    let covered = amount_requested_cents.min(available.max(0));
    let shortfall = amount_requested_cents - covered;

    let tx_id = Uuid::new_v4().to_string();
    let item = Item::new(student_pk(student_id), pending_sk(&now, &tx_id))
        .with("status", "PENDING")
        .with("category", category.canonical())
        .with("amount_requested_cents", amount_requested_cents)
        .with("amount_covered_cents", covered)
        .with("amount_shortfall_cents", shortfall);
    let item = match merchant_id {
        Some(m) => item.with("merchantId", m),
        None => item,
    };
    store.put(item, None).await?;

    let pending = PendingTransaction {
        tx_id,
        student_id: student_id.to_string(),
        merchant_id: merchant_id.map(str::to_string),
        category,
        amount_requested_cents,
        amount_covered_cents: covered,
        amount_shortfall_cents: shortfall,
        created_at: now,
    };
    if let Some(key) = idempotency_key {
        let response = serde_json::to_value(&pending).map_err(|e| CoreError::Internal(e.to_string()))?;
        idempotency::record(store, &scope, key, &response, idempotency::DEFAULT_TTL_DAYS, now).await;
    }
    Ok(pending)
}

async fn load_pending<S: StoreAdapter>(
    store: &S,
    student_id: &str,
    tx_id: &str,
    created_at: &DateTime<Utc>,
) -> crate::Result<PendingTransaction> {
    let item = store
        .get(&student_pk(student_id), &pending_sk(created_at, tx_id))
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("pending transaction {tx_id}")))?;
    let category = item
        .get_str("category")
        .and_then(Category::parse)
        .ok_or_else(|| CoreError::Internal("pending transaction missing category".into()))?;
    Ok(PendingTransaction {
        tx_id: tx_id.to_string(),
        student_id: student_id.to_string(),
        merchant_id: item.get_str("merchantId").map(str::to_string),
        category,
        amount_requested_cents: item.get_i64("amount_requested_cents").unwrap_or(0),
        amount_covered_cents: item.get_i64("amount_covered_cents").unwrap_or(0),
        amount_shortfall_cents: item.get_i64("amount_shortfall_cents").unwrap_or(0),
        created_at: *created_at,
    })
}

/// `created_at` is the timestamp embedded in the pending row's sort key,
/// returned by [`prepare`] as `PendingTransaction::created_at`.
pub async fn confirm<S: StoreAdapter>(
    store: &S,
    directory: &dyn MerchantDirectory,
    student_id: &str,
    tx_id: &str,
    created_at: DateTime<Utc>,
    idempotency_key: Option<&str>,
    now: DateTime<Utc>,
) -> crate::Result<ConfirmResult> {
    let scope = idempotency::scope("CONFIRM", &[tx_id]);
    if let Some(key) = idempotency_key {
        if let Some(cached) = idempotency::lookup(store, &scope, key, now).await? {
            return serde_json::from_value(cached).map_err(|e| CoreError::Internal(e.to_string()));
        }
    }

    let pending = load_pending(store, student_id, tx_id, &created_at).await?;

    if let Some(mid) = &pending.merchant_id {
        let merchant = merchants::resolve_active_merchant(directory, mid).await?;
        if merchant.category != pending.category {
            return Err(CoreError::BadInput("merchant category drifted since prepare".into()));
        }
    }

    let available = aggregates::sum_available_for_category(store, student_id, pending.category.canonical()).await?;
    let recomputed_covered = pending.amount_requested_cents.min(available.max(0));
    if recomputed_covered != pending.amount_covered_cents {
        let recomputed_shortfall = pending.amount_requested_cents - recomputed_covered;
        let item = Item::new(student_pk(student_id), pending_sk(&created_at, tx_id))
            .with("status", "PENDING")
            .with("category", pending.category.canonical())
            .with("amount_requested_cents", pending.amount_requested_cents)
            .with("amount_covered_cents", recomputed_covered)
            .with("amount_shortfall_cents", recomputed_shortfall);
        store.put(item, None).await?;
        return Ok(ConfirmResult::ReconfirmRequired {
            amount_covered_cents: recomputed_covered,
            amount_shortfall_cents: recomputed_shortfall,
        });
    }

    let lots_fifo = lots::query_lots_fifo(store, student_id, pending.category.canonical()).await?;
    let plan = lots::plan_consumption(&lots_fifo, pending.amount_covered_cents);

    let mut per_sponsor: BTreeMap<String, i64> = BTreeMap::new();
    let mut ops: Vec<WriteOp> = Vec::new();
    for (lot, take) in &plan {
        ops.push(lots::decrement_write_op(lot, *take));
        *per_sponsor.entry(lot.sponsor_id.clone()).or_insert(0) += take;
    }
    for (sponsor_id, take) in &per_sponsor {
        ops.push(WriteOp::Update {
            pk: student_pk(student_id),
            sk: aggregates::budget_sk(sponsor_id, pending.category.canonical()),
            expr: vec![UpdateExpr::Incr { field: "used_total_cents".into(), by: *take }],
            condition: Some(UpdateCondition::FieldAtLeast {
                field: "allocated_total_cents".into(),
                minimum: *take,
            }),
        });
    }

    let status = if pending.amount_covered_cents == pending.amount_requested_cents {
        SpendStatus::Approved
    } else {
        SpendStatus::PartialApproved
    };
    let spend_item = Item::new(student_pk(student_id), spend_sk(&now, tx_id))
        .with("category", pending.category.canonical())
        .with("amount_cents", pending.amount_covered_cents)
        .with("status", status.as_str());
    let spend_item = match &pending.merchant_id {
        Some(m) => spend_item.with("merchantId", m.clone()),
        None => spend_item,
    };
    ops.push(WriteOp::Put { item: spend_item, condition: None });

    if let Some(merchant_id) = &pending.merchant_id {
        let recent = store
            .get(&format!("MERCHANT#{merchant_id}"), merchants::BUSINESS_INFO_SK)
            .await?
            .and_then(|i| i.get("recentTransactions").cloned())
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        ops.extend(merchants::record_merchant_transaction_ops(
            merchant_id,
            tx_id,
            student_id,
            pending.category,
            pending.amount_covered_cents,
            status.as_str(),
            now,
            &recent,
        ));
    }

    ops.push(WriteOp::Delete { pk: student_pk(student_id), sk: pending_sk(&created_at, tx_id) });

    let response = ConfirmResult::Final(SpendRecord {
        tx_id: tx_id.to_string(),
        student_id: student_id.to_string(),
        merchant_id: pending.merchant_id.clone(),
        category: pending.category,
        amount_cents: pending.amount_covered_cents,
        status,
    });
    if let Some(key) = idempotency_key {
        let cached = serde_json::to_value(&response).map_err(|e| CoreError::Internal(e.to_string()))?;
        let record_item = idempotency::record_item(&scope, key, &cached, idempotency::DEFAULT_TTL_DAYS, now);
        ops.push(WriteOp::Put { item: record_item, condition: Some(PutCondition::AttributeNotExists) });
    }

    match store.transact_write(ops).await {
        Ok(()) => {}
        Err(crate::store::StoreError::ConditionFailed { reason }) => {
            return Err(CoreError::Conflict(format!("transaction confirmation batch cancelled: {reason}")));
        }
        Err(e) => return Err(e.into()),
    }

    let entry = LedgerEntry {
        entry_type: LedgerEntryType::Spend,
        amount_cents: pending.amount_covered_cents,
        category: Some(pending.category.canonical().to_string()),
        sponsor_id: None,
        tx_id: Some(tx_id.to_string()),
        eft_id: None,
    };
    ledger::append_entry(store, &student_pk(student_id), now.timestamp_millis() as u64, &entry, false).await?;

    Ok(response)
}
