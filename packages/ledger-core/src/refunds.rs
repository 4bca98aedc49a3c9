//! Merchant-initiated refunds.
//!
//! The legacy behavior updates the merchant transaction status and the
//! student spend record but does not touch the budget's `used_total_cents`
//! or restore lot `remaining_cents` (a "merchant-side-only reversal").
//! Whether that is intentional or a defect was left unresolved upstream;
//! this crate makes it an explicit choice via [`RefundSemantics`] rather
//! than silently picking one (decision recorded in DESIGN.md).

use chrono::{DateTime, Utc};

use crate::aggregates;
use crate::categories::Category;
use crate::error::CoreError;
use crate::ledger::{self, LedgerEntry, LedgerEntryType};
use crate::merchants;
use crate::store::{Item, QueryOpts, StoreAdapter, UpdateExpr};
use crate::transactions::SpendStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefundSemantics {
    #[default]
    MerchantSideOnly,
    RestoreBudget,
}

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 10;

fn merchant_pk(merchant_id: &str) -> String {
    format!("MERCHANT#{merchant_id}")
}

fn refund_sk(created_at: &DateTime<Utc>, tx_id: &str) -> String {
    format!("REFUND#{}#{tx_id}", created_at.timestamp_millis())
}

struct MerchantTx {
    sk: String,
    created_at_ms: i64,
    student_id: String,
    category: Category,
    amount_cents: i64,
}

/// Locates a merchant's transaction row by `txId` via bounded pagination
/// (up to ten pages of 100), since the store only supports prefix range
/// queries on the sort key and `txId` is the suffix.
async fn find_merchant_tx<S: StoreAdapter>(store: &S, merchant_id: &str, tx_id: &str) -> crate::Result<MerchantTx> {
    let mut cursor = None;
    for _ in 0..MAX_PAGES {
        let page = store
            .query(
                &merchant_pk(merchant_id),
                "TX#",
                QueryOpts { forward: true, limit: Some(PAGE_SIZE), cursor: cursor.clone() },
            )
            .await?;
        if let Some(item) = page.items.iter().find(|i| i.sk.ends_with(&format!("#{tx_id}"))) {
            let created_at_ms = item
                .sk
                .strip_prefix("TX#")
                .and_then(|rest| rest.split('#').next())
                .and_then(|ms| ms.parse().ok())
                .ok_or_else(|| CoreError::Internal("malformed merchant transaction key".into()))?;
            let category = item
                .get_str("category")
                .and_then(Category::parse)
                .ok_or_else(|| CoreError::Internal("merchant transaction missing category".into()))?;
            return Ok(MerchantTx {
                sk: item.sk.clone(),
                created_at_ms,
                student_id: item.get_str("studentId").unwrap_or_default().to_string(),
                category,
                amount_cents: item.get_i64("amount_cents").unwrap_or(0),
            });
        }
        match page.next_cursor {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }
    Err(CoreError::NotFound(format!("merchant transaction {tx_id}")))
}

#[derive(Debug, Clone)]
pub struct RefundResult {
    pub amount_cents: i64,
    pub status: SpendStatus,
}

pub async fn refund_merchant_transaction<S: StoreAdapter>(
    store: &S,
    merchant_id: &str,
    tx_id: &str,
    amount_cents: i64,
    reason: Option<&str>,
    semantics: RefundSemantics,
    now: DateTime<Utc>,
) -> crate::Result<RefundResult> {
    if amount_cents <= 0 {
        return Err(CoreError::BadInput("refund amount_cents must be > 0".into()));
    }
    let tx = find_merchant_tx(store, merchant_id, tx_id).await?;
    if amount_cents > tx.amount_cents {
        return Err(CoreError::BadInput("refund amount exceeds original transaction amount".into()));
    }
    let status = if amount_cents == tx.amount_cents {
        SpendStatus::Refunded
    } else {
        SpendStatus::PartialRefunded
    };

    store
        .update(
            &merchant_pk(merchant_id),
            &tx.sk,
            vec![UpdateExpr::Set { field: "status".into(), value: serde_json::json!(status.as_str()) }],
            None,
        )
        .await?;

    let mut refund_item = Item::new(merchant_pk(merchant_id), refund_sk(&now, tx_id)).with("amount_cents", amount_cents);
    if let Some(r) = reason {
        refund_item = refund_item.with("reason", r);
    }
    store.put(refund_item, None).await?;

    let created_at = DateTime::from_timestamp_millis(tx.created_at_ms).unwrap_or(now);
    let spend_sk = format!("SPEND#{}#{tx_id}", created_at.timestamp_millis());
    store
        .update(
            &format!("STUDENT#{}", tx.student_id),
            &spend_sk,
            vec![UpdateExpr::Set { field: "status".into(), value: serde_json::json!(status.as_str()) }],
            None,
        )
        .await?;

    let entry = LedgerEntry {
        entry_type: LedgerEntryType::Refund,
        amount_cents,
        category: Some(tx.category.canonical().to_string()),
        sponsor_id: None,
        tx_id: Some(tx_id.to_string()),
        eft_id: None,
    };
    ledger::append_entry(
        store,
        &format!("STUDENT#{}", tx.student_id),
        now.timestamp_millis() as u64,
        &entry,
        false,
    )
    .await?;

    merchants::decrement_business_info_best_effort(store, merchant_id, amount_cents).await;

    if semantics == RefundSemantics::RestoreBudget {
        restore_budget_best_effort(store, &tx.student_id, tx.category.canonical(), amount_cents).await;
    }

    Ok(RefundResult { amount_cents, status })
}

/// Greedily decrements `used_total_cents` across whichever sponsor budget
/// rows have room, since the original per-sponsor consumption breakdown for
/// a transaction is not retained after confirm. Best-effort: a failed
/// decrement on one row is skipped rather than failing the refund.
async fn restore_budget_best_effort<S: StoreAdapter>(store: &S, student_id: &str, category: &str, amount_cents: i64) {
    let rows = match aggregates::list_budgets_for_category(store, student_id, category).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(student_id, category, error = %e, "failed to list budgets for refund restoration");
            return;
        }
    };
    let mut remaining = amount_cents;
    for (sponsor_id, budget) in rows {
        if remaining <= 0 {
            break;
        }
        let take = remaining.min(budget.used_total_cents);
        if take <= 0 {
            continue;
        }
        match aggregates::decr_budget_used(store, student_id, &sponsor_id, category, take).await {
            Ok(_) => remaining -= take,
            Err(e) => tracing::warn!(student_id, sponsor_id, category, error = %e, "budget restoration skipped a row"),
        }
    }
}
