//! In-memory [`StoreAdapter`] backed by `dashmap`, for tests and examples.
//!
//! Secondary indexes are modeled as two extra attributes every indexed item
//! carries (`gsi1_pk`/`gsi1_sk`, `gsi2_pk`/`gsi2_sk`), the same "project the
//! index key onto the item" idiom a real document store uses. `GSI1` can be
//! toggled off via [`MemoryStore::without_gsi1`] to exercise the fallback
//! query path when the index isn't available.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    IndexAvailability, Item, Page, PutCondition, QueryOpts, StoreAdapter, StoreError, StoreResult,
    UpdateCondition, UpdateExpr, WriteOp, too_many_ops,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gsi1Mode {
    Available,
    Fallback,
}

pub struct MemoryStore {
    items: DashMap<(String, String), Item>,
    /// Serializes `transact_write` so a batch observes a consistent
    /// snapshot and applies as a single all-or-nothing unit.
    txn_lock: Arc<Mutex<()>>,
    gsi1_mode: Gsi1Mode,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            txn_lock: Arc::new(Mutex::new(())),
            gsi1_mode: Gsi1Mode::Available,
        }
    }

    /// Build a store that reports `GSI1` as unavailable, to exercise the
    /// primary-partition-query fallback path.
    pub fn without_gsi1() -> Self {
        Self {
            gsi1_mode: Gsi1Mode::Fallback,
            ..Self::new()
        }
    }

    fn check_put_condition(&self, item: &Item, condition: &Option<PutCondition>) -> StoreResult<()> {
        let existing = self.items.get(&(item.pk.clone(), item.sk.clone()));
        match condition {
            None => Ok(()),
            Some(PutCondition::AttributeNotExists) => {
                if existing.is_some() {
                    Err(StoreError::ConditionFailed {
                        reason: "attribute_not_exists failed: item already exists".into(),
                    })
                } else {
                    Ok(())
                }
            }
            Some(PutCondition::FieldEquals { field, value }) => match existing {
                Some(e) if e.get(field) == Some(value) => Ok(()),
                _ => Err(StoreError::ConditionFailed {
                    reason: format!("field {field} did not equal expected value"),
                }),
            },
        }
    }

    fn check_update_condition(
        &self,
        existing: Option<&Item>,
        condition: &Option<UpdateCondition>,
    ) -> StoreResult<()> {
        match condition {
            None => Ok(()),
            Some(UpdateCondition::Exists) => existing.map(|_| ()).ok_or_else(|| {
                StoreError::ConditionFailed {
                    reason: "item does not exist".into(),
                }
            }),
            Some(UpdateCondition::FieldEquals { field, value }) => match existing {
                Some(e) if e.get(field) == Some(value) => Ok(()),
                _ => Err(StoreError::ConditionFailed {
                    reason: format!("field {field} did not equal expected value"),
                }),
            },
            Some(UpdateCondition::FieldAtLeast { field, minimum }) => match existing.and_then(|e| e.get_i64(field)) {
                Some(v) if v >= *minimum => Ok(()),
                _ => Err(StoreError::ConditionFailed {
                    reason: format!("field {field} below required minimum {minimum}"),
                }),
            },
        }
    }

    fn apply_update(&self, existing: Option<Item>, pk: &str, sk: &str, expr: &[UpdateExpr]) -> Item {
        let mut item = existing.unwrap_or_else(|| Item::new(pk, sk));
        for e in expr {
            match e {
                UpdateExpr::Incr { field, by } => {
                    let cur = item.get_i64(field).unwrap_or(0);
                    item.attrs.insert(field.clone(), Value::from(cur + by));
                }
                UpdateExpr::Set { field, value } => {
                    item.attrs.insert(field.clone(), value.clone());
                }
            }
        }
        item
    }

    fn matching_prefix(sk: &str, prefix: &str) -> bool {
        sk.starts_with(prefix)
    }

    fn page_from(mut matched: Vec<Item>, opts: &QueryOpts) -> Page {
        matched.sort_by(|a, b| a.sk.cmp(&b.sk));
        if !opts.forward {
            matched.reverse();
        }
        let start = opts
            .cursor
            .as_ref()
            .and_then(|c| matched.iter().position(|it| it.sk == *c).map(|p| p + 1))
            .unwrap_or(0);
        let remaining = &matched[start.min(matched.len())..];
        let limit = opts.limit.unwrap_or(remaining.len());
        let items: Vec<Item> = remaining.iter().take(limit).cloned().collect();
        let next_cursor = if remaining.len() > limit {
            items.last().map(|it| it.sk.clone())
        } else {
            None
        };
        Page { items, next_cursor }
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn get(&self, pk: &str, sk: &str) -> StoreResult<Option<Item>> {
        Ok(self.items.get(&(pk.to_string(), sk.to_string())).map(|r| r.clone()))
    }

    async fn put(&self, item: Item, condition: Option<PutCondition>) -> StoreResult<()> {
        let _guard = self.txn_lock.lock().await;
        self.check_put_condition(&item, &condition)?;
        self.items.insert((item.pk.clone(), item.sk.clone()), item);
        Ok(())
    }

    async fn update(
        &self,
        pk: &str,
        sk: &str,
        expr: Vec<UpdateExpr>,
        condition: Option<UpdateCondition>,
    ) -> StoreResult<Item> {
        let _guard = self.txn_lock.lock().await;
        let key = (pk.to_string(), sk.to_string());
        let existing = self.items.get(&key).map(|r| r.clone());
        self.check_update_condition(existing.as_ref(), &condition)?;
        let updated = self.apply_update(existing, pk, sk, &expr);
        self.items.insert(key, updated.clone());
        Ok(updated)
    }

    async fn query(&self, pk: &str, sk_prefix: &str, opts: QueryOpts) -> StoreResult<Page> {
        let matched: Vec<Item> = self
            .items
            .iter()
            .filter(|e| e.key().0 == pk && Self::matching_prefix(&e.key().1, sk_prefix))
            .map(|e| e.value().clone())
            .collect();
        Ok(Self::page_from(matched, &opts))
    }

    async fn query_index(
        &self,
        index: &str,
        pk: &str,
        sk_prefix: &str,
        opts: QueryOpts,
    ) -> StoreResult<Page> {
        if index == "GSI1" && self.gsi1_mode == Gsi1Mode::Fallback {
            // Degrade to a primary-partition query with in-process filtering,
            // matching spec §4.1's required fallback behavior.
            tracing::warn!("GSI1 unavailable, falling back to primary-partition scan");
            let matched: Vec<Item> = self
                .items
                .iter()
                .filter(|e| e.key().0 == pk)
                .map(|e| e.value().clone())
                .filter(|it| {
                    it.get_str("gsi1_sk")
                        .map(|s| Self::matching_prefix(s, sk_prefix))
                        .unwrap_or(false)
                })
                .collect();
            return Ok(Self::page_from(matched, &opts));
        }

        let (pk_field, sk_field) = match index {
            "GSI1" => ("gsi1_pk", "gsi1_sk"),
            "GSI2" => ("gsi2_pk", "gsi2_sk"),
            other => {
                return Err(StoreError::Internal(format!("unknown index {other}")));
            }
        };

        let matched: Vec<Item> = self
            .items
            .iter()
            .map(|e| e.value().clone())
            .filter(|it| {
                it.get_str(pk_field) == Some(pk)
                    && it
                        .get_str(sk_field)
                        .map(|s| Self::matching_prefix(s, sk_prefix))
                        .unwrap_or(false)
            })
            .collect();
        Ok(Self::page_from(matched, &opts))
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        too_many_ops(&ops)?;
        let _guard = self.txn_lock.lock().await;

        // Pre-check every condition against the current snapshot before
        // mutating anything, so the batch is genuinely all-or-nothing.
        for op in &ops {
            match op {
                WriteOp::Put { item, condition } => self.check_put_condition(item, condition)?,
                WriteOp::Update { pk, sk, condition, .. } => {
                    let existing = self.items.get(&(pk.clone(), sk.clone())).map(|r| r.clone());
                    self.check_update_condition(existing.as_ref(), condition)?;
                }
                WriteOp::Delete { .. } => {}
            }
        }

        for op in ops {
            match op {
                WriteOp::Put { item, .. } => {
                    self.items.insert((item.pk.clone(), item.sk.clone()), item);
                }
                WriteOp::Update { pk, sk, expr, .. } => {
                    let key = (pk.clone(), sk.clone());
                    let existing = self.items.get(&key).map(|r| r.clone());
                    let updated = self.apply_update(existing, &pk, &sk, &expr);
                    self.items.insert(key, updated);
                }
                WriteOp::Delete { pk, sk } => {
                    self.items.remove(&(pk, sk));
                }
            }
        }
        Ok(())
    }

    fn index_availability(&self, index: &str) -> IndexAvailability {
        match (index, self.gsi1_mode) {
            ("GSI1", Gsi1Mode::Fallback) => IndexAvailability::Fallback,
            _ => IndexAvailability::Available,
        }
    }
}

/// Convenience for building index-projected items in the domain modules.
pub fn with_gsi(mut item: Item, index: &str, pk: impl Into<String>, sk: impl Into<String>) -> Item {
    let (pk_field, sk_field) = match index {
        "GSI1" => ("gsi1_pk", "gsi1_sk"),
        "GSI2" => ("gsi2_pk", "gsi2_sk"),
        _ => unreachable!("unknown index"),
    };
    item.attrs.insert(pk_field.to_string(), Value::from(pk.into()));
    item.attrs.insert(sk_field.to_string(), Value::from(sk.into()));
    item
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = MemoryStore::new();
        let item = Item::new("SPONSOR#1", "AGGREGATE").with("approved_total_cents", 100);
        store.put(item.clone(), None).await.unwrap();
        let got = store.get("SPONSOR#1", "AGGREGATE").await.unwrap().unwrap();
        assert_eq!(got.get_i64("approved_total_cents"), Some(100));
    }

    #[tokio::test]
    async fn conditional_put_rejects_existing() {
        let store = MemoryStore::new();
        let item = Item::new("SPONSOR#1", "AGGREGATE");
        store
            .put(item.clone(), Some(PutCondition::AttributeNotExists))
            .await
            .unwrap();
        let err = store
            .put(item, Some(PutCondition::AttributeNotExists))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));
    }

    #[tokio::test]
    async fn conditional_update_guards_minimum() {
        let store = MemoryStore::new();
        store
            .update(
                "STUDENT#1",
                "ALLOT#Food#0000000000001#lot1",
                vec![UpdateExpr::Set {
                    field: "remaining_cents".into(),
                    value: Value::from(500),
                }],
                None,
            )
            .await
            .unwrap();

        let err = store
            .update(
                "STUDENT#1",
                "ALLOT#Food#0000000000001#lot1",
                vec![UpdateExpr::Incr {
                    field: "remaining_cents".into(),
                    by: -600,
                }],
                Some(UpdateCondition::FieldAtLeast {
                    field: "remaining_cents".into(),
                    minimum: 600,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));
    }

    #[tokio::test]
    async fn transact_write_is_all_or_nothing() {
        let store = MemoryStore::new();
        store
            .put(Item::new("SPONSOR#1", "AGGREGATE"), Some(PutCondition::AttributeNotExists))
            .await
            .unwrap();

        let ops = vec![
            WriteOp::Update {
                pk: "SPONSOR#1".into(),
                sk: "AGGREGATE".into(),
                expr: vec![UpdateExpr::Incr {
                    field: "approved_total_cents".into(),
                    by: 100,
                }],
                condition: None,
            },
            WriteOp::Put {
                item: Item::new("SPONSOR#1", "AGGREGATE"),
                condition: Some(PutCondition::AttributeNotExists),
            },
        ];
        let err = store.transact_write(ops).await.unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));

        // The failed batch must not have applied the increment either.
        let item = store.get("SPONSOR#1", "AGGREGATE").await.unwrap().unwrap();
        assert_eq!(item.get_i64("approved_total_cents"), None);
    }

    #[tokio::test]
    async fn gsi1_fallback_filters_in_process() {
        let store = MemoryStore::without_gsi1();
        let item = with_gsi(
            Item::new("SPONSOR#1", "EFT_NOTIFY#0000000000001#eft1"),
            "GSI1",
            "SPONSOR#1",
            "EFT#new#0000000000001",
        );
        store.put(item, None).await.unwrap();

        let page = store
            .query_index("GSI1", "SPONSOR#1", "EFT#new", QueryOpts::default())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(store.index_availability("GSI1"), IndexAvailability::Fallback);
    }
}
