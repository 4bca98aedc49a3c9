//! Merchant metadata lookup and merchant-side ledger bookkeeping.
//!
//! Merchant onboarding and QR generation are out of scope for this crate;
//! it receives merchant metadata by id through [`MerchantDirectory`], an
//! injected collaborator rather than a global.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::categories::Category;
use crate::error::CoreError;
use crate::store::{Item, StoreAdapter, UpdateCondition, UpdateExpr, WriteOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerchantStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct Merchant {
    pub id: String,
    pub status: MerchantStatus,
    pub active: bool,
    pub category: Category,
}

impl Merchant {
    pub fn is_usable(&self) -> bool {
        self.status == MerchantStatus::Approved && self.active
    }
}

#[async_trait]
pub trait MerchantDirectory: Send + Sync {
    async fn lookup(&self, merchant_id: &str) -> crate::Result<Option<Merchant>>;
}

/// In-memory merchant directory for tests, registering merchants at
/// construction time via a builder-style `with_merchant`.
#[derive(Default)]
pub struct StaticMerchantDirectory {
    merchants: RwLock<HashMap<String, Merchant>>,
}

impl StaticMerchantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_merchant(self, merchant: Merchant) -> Self {
        self.merchants.write().unwrap().insert(merchant.id.clone(), merchant);
        self
    }
}

#[async_trait]
impl MerchantDirectory for StaticMerchantDirectory {
    async fn lookup(&self, merchant_id: &str) -> crate::Result<Option<Merchant>> {
        Ok(self.merchants.read().unwrap().get(merchant_id).cloned())
    }
}

/// Resolves and validates a merchant for prepare/confirm: must exist, be
/// approved, and active. Category drift between prepare and confirm is a
/// hard error at the confirm call site, not here.
pub async fn resolve_active_merchant(
    directory: &dyn MerchantDirectory,
    merchant_id: &str,
) -> crate::Result<Merchant> {
    let merchant = directory
        .lookup(merchant_id)
        .await?
        .ok_or_else(|| CoreError::BadInput(format!("unknown merchant {merchant_id}")))?;
    if !merchant.is_usable() {
        return Err(CoreError::BadInput(format!("merchant {merchant_id} is not approved and active")));
    }
    Ok(merchant)
}

fn merchant_pk(merchant_id: &str) -> String {
    format!("MERCHANT#{merchant_id}")
}

fn tx_sk(created_at: &DateTime<Utc>, tx_id: &str) -> String {
    format!("TX#{}#{tx_id}", created_at.timestamp_millis())
}

pub const BUSINESS_INFO_SK: &str = "BUSINESS_INFO";
const LAST_FIVE_LIMIT: usize = 5;

/// Builds the write ops recording a confirmed spend against a merchant:
/// the transaction row and the bounded "last five" business-info update.
pub fn record_merchant_transaction_ops(
    merchant_id: &str,
    tx_id: &str,
    student_id: &str,
    category: Category,
    amount_cents: i64,
    status: &str,
    created_at: DateTime<Utc>,
    recent: &[serde_json::Value],
) -> Vec<WriteOp> {
    let tx_item = Item::new(merchant_pk(merchant_id), tx_sk(&created_at, tx_id))
        .with("studentId", student_id)
        .with("category", category.canonical())
        .with("amount_cents", amount_cents)
        .with("status", status);

    let mut last_five: Vec<serde_json::Value> = recent.to_vec();
    last_five.push(json!({
        "txId": tx_id,
        "studentId": student_id,
        "category": category.canonical(),
        "amount_cents": amount_cents,
    }));
    if last_five.len() > LAST_FIVE_LIMIT {
        let overflow = last_five.len() - LAST_FIVE_LIMIT;
        last_five.drain(0..overflow);
    }

    let business_info_update = WriteOp::Update {
        pk: merchant_pk(merchant_id),
        sk: BUSINESS_INFO_SK.into(),
        expr: vec![
            UpdateExpr::Incr { field: "withdrawableBalance".into(), by: amount_cents },
            UpdateExpr::Incr { field: "totalReceived".into(), by: amount_cents },
            UpdateExpr::Incr { field: "totalTransactions".into(), by: 1 },
            UpdateExpr::Set { field: "recentTransactions".into(), value: json!(last_five) },
        ],
        condition: None,
    };

    vec![WriteOp::Put { item: tx_item, condition: None }, business_info_update]
}

/// Best-effort decrement of merchant business-info aggregates on refund.
/// Failures are logged, not propagated, per spec §4.9.
pub async fn decrement_business_info_best_effort<S: StoreAdapter>(store: &S, merchant_id: &str, amount_cents: i64) {
    let result = store
        .update(
            &merchant_pk(merchant_id),
            BUSINESS_INFO_SK,
            vec![
                UpdateExpr::Incr { field: "withdrawableBalance".into(), by: -amount_cents },
                UpdateExpr::Incr { field: "totalReceived".into(), by: -amount_cents },
            ],
            Some(UpdateCondition::FieldAtLeast {
                field: "withdrawableBalance".into(),
                minimum: amount_cents,
            }),
        )
        .await;
    if let Err(e) = result {
        tracing::warn!(merchant_id, error = %e, "best-effort business-info decrement failed");
    }
}

pub fn merchant_tx_pk(merchant_id: &str) -> String {
    merchant_pk(merchant_id)
}

pub fn merchant_tx_prefix() -> &'static str {
    "TX#"
}
