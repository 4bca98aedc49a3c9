//! EFT deposit lifecycle: a sponsor's claim that a bank transfer has
//! arrived, spendable only after admin approval. States: `new -> allocated
//! | rejected`, both terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::aggregates::{self, SponsorAggregate};
use crate::error::CoreError;
use crate::idempotency;
use crate::ledger::{self, LedgerEntry, LedgerEntryType};
use crate::store::memory::with_gsi;
use crate::store::{Item, PutCondition, StoreAdapter, UpdateCondition, UpdateExpr, WriteOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EftStatus {
    New,
    Allocated,
    Rejected,
}

impl EftStatus {
    fn as_str(self) -> &'static str {
        match self {
            EftStatus::New => "new",
            EftStatus::Allocated => "allocated",
            EftStatus::Rejected => "rejected",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(EftStatus::New),
            "allocated" => Some(EftStatus::Allocated),
            "rejected" => Some(EftStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EftDeposit {
    pub id: String,
    pub sponsor_id: String,
    pub reference: String,
    pub amount_cents: i64,
    pub created_at: DateTime<Utc>,
    pub status: EftStatus,
    pub approved_amount_cents: Option<i64>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_reason: Option<String>,
}

impl EftDeposit {
    fn from_item(sponsor_id: &str, item: &Item) -> crate::Result<Self> {
        let id = item
            .get_str("id")
            .ok_or_else(|| CoreError::Internal("EFT notification missing id".into()))?
            .to_string();
        let reference = item.get_str("reference").unwrap_or_default().to_string();
        let status = item
            .get_str("status")
            .and_then(EftStatus::parse)
            .ok_or_else(|| CoreError::Internal("EFT notification missing status".into()))?;
        Ok(Self {
            id,
            sponsor_id: sponsor_id.to_string(),
            reference,
            amount_cents: item.get_i64("amount_cents").unwrap_or(0),
            created_at: item
                .get_str("created_at")
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(Utc::now),
            status,
            approved_amount_cents: item.get_i64("approved_amount_cents"),
            approved_by: item.get_str("approved_by").map(str::to_string),
            approved_at: item.get_str("approved_at").and_then(|s| s.parse().ok()),
            rejected_reason: item.get_str("rejected_reason").map(str::to_string),
        })
    }
}

fn sponsor_pk(sponsor_id: &str) -> String {
    format!("SPONSOR#{sponsor_id}")
}

fn notify_sk(created_at: &DateTime<Utc>, id: &str) -> String {
    format!("EFT_NOTIFY#{}#{id}", created_at.timestamp_millis())
}

fn admin_mirror_sk(status: EftStatus, created_at: &DateTime<Utc>, id: &str) -> String {
    format!("STATUS#{}#{}#{id}", status.as_str(), created_at.timestamp_millis())
}

fn gsi1_sk(status: EftStatus, created_at: &DateTime<Utc>) -> String {
    format!("EFT#{}#{}", status.as_str(), created_at.timestamp_millis())
}

/// `KUDU-{last4(sponsorId).upper}-{rand4.upper}{lastEpoch4}`.
pub fn generate_reference(sponsor_id: &str, epoch_ms: u64) -> String {
    let last4: String = sponsor_id
        .chars()
        .rev()
        .take(4)
        .collect::<String>()
        .chars()
        .rev()
        .collect::<String>()
        .to_uppercase();
    let rand4: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(4)
        .collect::<String>()
        .to_uppercase();
    let last_epoch4 = format!("{:04}", epoch_ms % 10_000);
    format!("KUDU-{last4}-{rand4}{last_epoch4}")
}

/// Submit an EFT notification: writes the sponsor-partition notification,
/// the id lookup, and the admin mirror in one batch.
pub async fn submit<S: StoreAdapter>(
    store: &S,
    sponsor_id: &str,
    amount_cents: i64,
    reference: Option<String>,
    idempotency_key: Option<&str>,
    now: DateTime<Utc>,
) -> crate::Result<EftDeposit> {
    let scope = idempotency::scope("EFT_SUBMIT", &[sponsor_id]);
    if let Some(key) = idempotency_key {
        if let Some(cached) = idempotency::lookup(store, &scope, key, now).await? {
            return serde_json::from_value(cached).map_err(|e| CoreError::Internal(e.to_string()));
        }
    }

    if amount_cents <= 0 {
        return Err(CoreError::BadInput("amount_cents must be > 0".into()));
    }
    let id = Uuid::new_v4().to_string();
    let reference = reference.unwrap_or_else(|| generate_reference(sponsor_id, now.timestamp_millis() as u64));

    let notification = with_gsi(
        Item::new(sponsor_pk(sponsor_id), notify_sk(&now, &id))
            .with("id", id.clone())
            .with("reference", reference.clone())
            .with("amount_cents", amount_cents)
            .with("status", EftStatus::New.as_str())
            .with("created_at", now.to_rfc3339()),
        "GSI1",
        sponsor_pk(sponsor_id),
        gsi1_sk(EftStatus::New, &now),
    );
    let id_lookup = Item::new("EFT#ID", id.clone())
        .with("sponsorId", sponsor_id)
        .with("createdAt", now.to_rfc3339());
    let admin_mirror = Item::new("EFT#ALL", admin_mirror_sk(EftStatus::New, &now, &id))
        .with("id", id.clone())
        .with("sponsorId", sponsor_id)
        .with("reference", reference.clone())
        .with("amount_cents", amount_cents)
        .with("status", EftStatus::New.as_str())
        .with("created_at", now.to_rfc3339());

    let deposit = EftDeposit {
        id,
        sponsor_id: sponsor_id.to_string(),
        reference,
        amount_cents,
        created_at: now,
        status: EftStatus::New,
        approved_amount_cents: None,
        approved_by: None,
        approved_at: None,
        rejected_reason: None,
    };

    let mut ops = vec![
        WriteOp::Put { item: notification, condition: None },
        WriteOp::Put { item: id_lookup, condition: None },
        WriteOp::Put { item: admin_mirror, condition: None },
    ];
    if let Some(key) = idempotency_key {
        let cached = serde_json::to_value(&deposit).map_err(|e| CoreError::Internal(e.to_string()))?;
        let record_item = idempotency::record_item(&scope, key, &cached, idempotency::DEFAULT_TTL_DAYS, now);
        ops.push(WriteOp::Put { item: record_item, condition: Some(PutCondition::AttributeNotExists) });
    }
    store.transact_write(ops).await?;

    Ok(deposit)
}

async fn resolve<S: StoreAdapter>(store: &S, eft_id: &str) -> crate::Result<(String, DateTime<Utc>)> {
    let lookup = store
        .get("EFT#ID", eft_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("eft {eft_id}")))?;
    let sponsor_id = lookup
        .get_str("sponsorId")
        .ok_or_else(|| CoreError::Internal("eft id lookup missing sponsorId".into()))?
        .to_string();
    let created_at = lookup
        .get_str("createdAt")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CoreError::Internal("eft id lookup missing createdAt".into()))?;
    Ok((sponsor_id, created_at))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EftApproveResult {
    Approved(SponsorAggregate),
    AlreadyTerminal(EftStatus),
}

/// Clamps `approved_amount_cents` to `min(approved, amount_cents)`.
pub async fn approve<S: StoreAdapter>(
    store: &S,
    eft_id: &str,
    approved_amount_cents: i64,
    approved_by: &str,
    idempotency_key: Option<&str>,
    now: DateTime<Utc>,
) -> crate::Result<EftApproveResult> {
    let scope = idempotency::scope("ADMIN_APPROVE", &[eft_id]);
    if let Some(key) = idempotency_key {
        if let Some(cached) = idempotency::lookup(store, &scope, key, now).await? {
            return serde_json::from_value(cached).map_err(|e| CoreError::Internal(e.to_string()));
        }
    }

    let (sponsor_id, created_at) = resolve(store, eft_id).await?;
    let notify_sk = notify_sk(&created_at, eft_id);
    let notification = store
        .get(&sponsor_pk(&sponsor_id), &notify_sk)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("eft {eft_id}")))?;
    let deposit = EftDeposit::from_item(&sponsor_id, &notification)?;
    if deposit.status != EftStatus::New {
        return Ok(EftApproveResult::AlreadyTerminal(deposit.status));
    }
    let approved = approved_amount_cents.min(deposit.amount_cents);

    let updated_notification = WriteOp::Update {
        pk: sponsor_pk(&sponsor_id),
        sk: notify_sk.clone(),
        expr: vec![
            UpdateExpr::Set { field: "status".into(), value: json!(EftStatus::Allocated.as_str()) },
            UpdateExpr::Set { field: "approved_amount_cents".into(), value: json!(approved) },
            UpdateExpr::Set { field: "approved_by".into(), value: json!(approved_by) },
            UpdateExpr::Set { field: "approved_at".into(), value: json!(now.to_rfc3339()) },
            UpdateExpr::Set { field: "gsi1_sk".into(), value: json!(gsi1_sk(EftStatus::Allocated, &created_at)) },
        ],
        condition: Some(UpdateCondition::FieldEquals {
            field: "status".into(),
            value: json!(EftStatus::New.as_str()),
        }),
    };
    let delete_old_mirror = WriteOp::Delete {
        pk: "EFT#ALL".into(),
        sk: admin_mirror_sk(EftStatus::New, &created_at, eft_id),
    };
    let put_new_mirror = WriteOp::Put {
        item: Item::new("EFT#ALL", admin_mirror_sk(EftStatus::Allocated, &created_at, eft_id))
            .with("id", eft_id)
            .with("sponsorId", sponsor_id.clone())
            .with("reference", deposit.reference.clone())
            .with("amount_cents", deposit.amount_cents)
            .with("status", EftStatus::Allocated.as_str())
            .with("created_at", created_at.to_rfc3339()),
        condition: None,
    };

    let mut ops = vec![updated_notification, delete_old_mirror, put_new_mirror];
    if let Some(key) = idempotency_key {
        let current_agg = aggregates::load_sponsor_aggregate(store, &sponsor_id).await?.unwrap_or_default();
        let predicted = EftApproveResult::Approved(SponsorAggregate {
            approved_total_cents: current_agg.approved_total_cents + approved,
            allocated_total_cents: current_agg.allocated_total_cents,
            available_total_cents: current_agg.available_total_cents + approved,
        });
        let cached = serde_json::to_value(&predicted).map_err(|e| CoreError::Internal(e.to_string()))?;
        let record_item = idempotency::record_item(&scope, key, &cached, idempotency::DEFAULT_TTL_DAYS, now);
        ops.push(WriteOp::Put { item: record_item, condition: Some(PutCondition::AttributeNotExists) });
    }

    match store.transact_write(ops).await {
        Ok(()) => {}
        Err(crate::store::StoreError::ConditionFailed { .. }) => {
            let current = store
                .get(&sponsor_pk(&sponsor_id), &notify_sk)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("eft {eft_id}")))?;
            let current = EftDeposit::from_item(&sponsor_id, &current)?;
            return Err(match current.status {
                EftStatus::Allocated => CoreError::Conflict("EFT already approved".into()),
                EftStatus::Rejected => CoreError::Conflict("EFT already rejected".into()),
                EftStatus::New => CoreError::Conflict("EFT approval conflict".into()),
            });
        }
        Err(e) => return Err(e.into()),
    }

    let entry = LedgerEntry {
        entry_type: LedgerEntryType::DepositApproved,
        amount_cents: approved,
        category: None,
        sponsor_id: Some(sponsor_id.clone()),
        tx_id: None,
        eft_id: Some(eft_id.to_string()),
    };
    ledger::append_entry(store, &sponsor_pk(&sponsor_id), now.timestamp_millis() as u64, &entry, true).await?;
    aggregates::seed_sponsor_aggregate(store, &sponsor_id).await?;
    let balance = aggregates::credit_sponsor_approved(store, &sponsor_id, approved).await?;

    Ok(EftApproveResult::Approved(balance))
}

pub async fn reject<S: StoreAdapter>(
    store: &S,
    eft_id: &str,
    reason: &str,
    idempotency_key: Option<&str>,
    now: DateTime<Utc>,
) -> crate::Result<EftApproveResult> {
    let scope = idempotency::scope("ADMIN_REJECT", &[eft_id]);
    if let Some(key) = idempotency_key {
        if let Some(cached) = idempotency::lookup(store, &scope, key, now).await? {
            return serde_json::from_value(cached).map_err(|e| CoreError::Internal(e.to_string()));
        }
    }

    let (sponsor_id, created_at) = resolve(store, eft_id).await?;
    let notify_sk = notify_sk(&created_at, eft_id);
    let notification = store
        .get(&sponsor_pk(&sponsor_id), &notify_sk)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("eft {eft_id}")))?;
    let deposit = EftDeposit::from_item(&sponsor_id, &notification)?;
    if deposit.status != EftStatus::New {
        return Ok(EftApproveResult::AlreadyTerminal(deposit.status));
    }

    let updated_notification = WriteOp::Update {
        pk: sponsor_pk(&sponsor_id),
        sk: notify_sk.clone(),
        expr: vec![
            UpdateExpr::Set { field: "status".into(), value: json!(EftStatus::Rejected.as_str()) },
            UpdateExpr::Set { field: "rejected_reason".into(), value: json!(reason) },
            UpdateExpr::Set { field: "gsi1_sk".into(), value: json!(gsi1_sk(EftStatus::Rejected, &created_at)) },
        ],
        condition: Some(UpdateCondition::FieldEquals {
            field: "status".into(),
            value: json!(EftStatus::New.as_str()),
        }),
    };
    let delete_old_mirror = WriteOp::Delete {
        pk: "EFT#ALL".into(),
        sk: admin_mirror_sk(EftStatus::New, &created_at, eft_id),
    };
    let put_new_mirror = WriteOp::Put {
        item: Item::new("EFT#ALL", admin_mirror_sk(EftStatus::Rejected, &created_at, eft_id))
            .with("id", eft_id)
            .with("sponsorId", sponsor_id.clone())
            .with("reference", deposit.reference.clone())
            .with("amount_cents", deposit.amount_cents)
            .with("status", EftStatus::Rejected.as_str())
            .with("created_at", created_at.to_rfc3339()),
        condition: None,
    };

    let mut ops = vec![updated_notification, delete_old_mirror, put_new_mirror];
    if let Some(key) = idempotency_key {
        let response = EftApproveResult::AlreadyTerminal(EftStatus::Rejected);
        let cached = serde_json::to_value(&response).map_err(|e| CoreError::Internal(e.to_string()))?;
        let record_item = idempotency::record_item(&scope, key, &cached, idempotency::DEFAULT_TTL_DAYS, now);
        ops.push(WriteOp::Put { item: record_item, condition: Some(PutCondition::AttributeNotExists) });
    }

    match store.transact_write(ops).await {
        Ok(()) => {}
        Err(crate::store::StoreError::ConditionFailed { .. }) => {
            let current = store
                .get(&sponsor_pk(&sponsor_id), &notify_sk)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("eft {eft_id}")))?;
            let current = EftDeposit::from_item(&sponsor_id, &current)?;
            return Err(match current.status {
                EftStatus::Allocated => CoreError::Conflict("EFT already approved".into()),
                EftStatus::Rejected => CoreError::Conflict("EFT already rejected".into()),
                EftStatus::New => CoreError::Conflict("EFT rejection conflict".into()),
            });
        }
        Err(e) => return Err(e.into()),
    }

    let entry = LedgerEntry {
        entry_type: LedgerEntryType::DepositRejected,
        amount_cents: deposit.amount_cents,
        category: None,
        sponsor_id: Some(sponsor_id.clone()),
        tx_id: None,
        eft_id: Some(eft_id.to_string()),
    };
    ledger::append_entry(store, &sponsor_pk(&sponsor_id), now.timestamp_millis() as u64, &entry, false).await?;

    Ok(EftApproveResult::AlreadyTerminal(EftStatus::Rejected))
}

/// Effective sponsor balance: `aggregate.available_total_cents`, falling
/// back to a ledger-derived approved total when the aggregate is missing or
/// zero, per spec §4.4's Balance derivation rule.
pub async fn effective_balance<S: StoreAdapter>(store: &S, sponsor_id: &str) -> crate::Result<i64> {
    let agg = aggregates::load_sponsor_aggregate(store, sponsor_id).await?;
    match agg {
        Some(a) if a.approved_total_cents != 0 || a.available_total_cents != 0 => Ok(a.available_total_cents),
        Some(a) => {
            let approved = ledger::reconstruct_approved_total(store, &sponsor_pk(sponsor_id)).await?;
            Ok(approved - a.allocated_total_cents)
        }
        None => {
            let approved = ledger::reconstruct_approved_total(store, &sponsor_pk(sponsor_id)).await?;
            Ok(approved)
        }
    }
}
