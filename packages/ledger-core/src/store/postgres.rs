//! Postgres-backed [`StoreAdapter`].
//!
//! A single table models the whole document store:
//!
//! ```sql
//! CREATE TABLE ledger_items (
//!     pk        TEXT NOT NULL,
//!     sk        TEXT NOT NULL,
//!     doc       JSONB NOT NULL,
//!     gsi1_pk   TEXT,
//!     gsi1_sk   TEXT,
//!     gsi2_pk   TEXT,
//!     gsi2_sk   TEXT,
//!     PRIMARY KEY (pk, sk)
//! );
//! CREATE INDEX ledger_items_gsi1 ON ledger_items (gsi1_pk, gsi1_sk);
//! CREATE INDEX ledger_items_gsi2 ON ledger_items (gsi2_pk, gsi2_sk);
//! ```
//!
//! `new` builds the pool and probes for the `GSI1` index up front so a
//! missing index degrades query paths at startup rather than per-request.

use std::collections::BTreeMap;

use async_trait::async_trait;
use deadpool_postgres::{GenericClient, Manager, ManagerConfig, Pool, RecyclingMethod};
use serde_json::Value;
use tokio_postgres::{NoTls, Row};
use tracing::{info, warn};

use super::{
    IndexAvailability, Item, Page, PutCondition, QueryOpts, StoreAdapter, StoreError, StoreResult,
    UpdateCondition, UpdateExpr, WriteOp, too_many_ops,
};

pub struct PostgresStore {
    pool: Pool,
    gsi1_available: bool,
}

impl PostgresStore {
    /// Connect, verify the table is reachable, and probe both secondary
    /// indexes. `GSI2` absence is fatal; `GSI1` absence logs a warning and
    /// the adapter degrades to a primary-partition query.
    pub async fn connect(database_url: &str, max_connections: usize) -> anyhow::Result<Self> {
        info!("connecting to ledger store at {database_url}");

        let config = database_url.parse::<tokio_postgres::Config>()?;
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(config, NoTls, mgr_config);
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build connection pool: {e}"))?;

        let client = pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;

        let gsi2_ok = client
            .query_opt(
                "SELECT indexname FROM pg_indexes WHERE tablename = 'ledger_items' AND indexname = 'ledger_items_gsi2'",
                &[],
            )
            .await?
            .is_some();
        if !gsi2_ok {
            anyhow::bail!("required index ledger_items_gsi2 (GSI2) is missing");
        }

        let gsi1_ok = client
            .query_opt(
                "SELECT indexname FROM pg_indexes WHERE tablename = 'ledger_items' AND indexname = 'ledger_items_gsi1'",
                &[],
            )
            .await?
            .is_some();
        if !gsi1_ok {
            warn!("GSI1 (ledger_items_gsi1) missing, degrading to primary-partition scan for sponsor EFT-by-status queries");
        }

        info!("ledger store ready");
        Ok(Self {
            pool,
            gsi1_available: gsi1_ok,
        })
    }

    fn row_to_item(row: &Row) -> StoreResult<Item> {
        let pk: String = row.try_get("pk").map_err(to_internal)?;
        let sk: String = row.try_get("sk").map_err(to_internal)?;
        let doc: Value = row.try_get("doc").map_err(to_internal)?;
        let attrs: BTreeMap<String, Value> = match doc {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        Ok(Item { pk, sk, attrs })
    }

    fn doc_of(item: &Item) -> Value {
        Value::Object(item.attrs.clone().into_iter().collect())
    }
}

fn to_internal(e: tokio_postgres::Error) -> StoreError {
    StoreError::Internal(e.to_string())
}

fn to_transient(e: deadpool_postgres::PoolError) -> StoreError {
    StoreError::Transient(e.to_string())
}

fn index_columns(index: &str) -> StoreResult<(&'static str, &'static str)> {
    match index {
        "GSI1" => Ok(("gsi1_pk", "gsi1_sk")),
        "GSI2" => Ok(("gsi2_pk", "gsi2_sk")),
        other => Err(StoreError::Internal(format!("unknown index {other}"))),
    }
}

#[async_trait]
impl StoreAdapter for PostgresStore {
    async fn get(&self, pk: &str, sk: &str) -> StoreResult<Option<Item>> {
        let client = self.pool.get().await.map_err(to_transient)?;
        let row = client
            .query_opt("SELECT pk, sk, doc FROM ledger_items WHERE pk = $1 AND sk = $2", &[&pk, &sk])
            .await
            .map_err(to_internal)?;
        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn put(&self, item: Item, condition: Option<PutCondition>) -> StoreResult<()> {
        let client = self.pool.get().await.map_err(to_transient)?;
        let doc = Self::doc_of(&item);

        let rows = match condition {
            None => {
                client
                    .execute(
                        "INSERT INTO ledger_items (pk, sk, doc, gsi1_pk, gsi1_sk, gsi2_pk, gsi2_sk)
                         VALUES ($1, $2, $3, $4, $5, $6, $7)
                         ON CONFLICT (pk, sk) DO UPDATE SET doc = EXCLUDED.doc,
                            gsi1_pk = EXCLUDED.gsi1_pk, gsi1_sk = EXCLUDED.gsi1_sk,
                            gsi2_pk = EXCLUDED.gsi2_pk, gsi2_sk = EXCLUDED.gsi2_sk",
                        &[
                            &item.pk,
                            &item.sk,
                            &doc,
                            &item.get_str("gsi1_pk"),
                            &item.get_str("gsi1_sk"),
                            &item.get_str("gsi2_pk"),
                            &item.get_str("gsi2_sk"),
                        ],
                    )
                    .await
                    .map_err(to_internal)?
            }
            Some(PutCondition::AttributeNotExists) => client
                .execute(
                    "INSERT INTO ledger_items (pk, sk, doc, gsi1_pk, gsi1_sk, gsi2_pk, gsi2_sk)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     ON CONFLICT (pk, sk) DO NOTHING",
                    &[
                        &item.pk,
                        &item.sk,
                        &doc,
                        &item.get_str("gsi1_pk"),
                        &item.get_str("gsi1_sk"),
                        &item.get_str("gsi2_pk"),
                        &item.get_str("gsi2_sk"),
                    ],
                )
                .await
                .map_err(to_internal)?,
            Some(PutCondition::FieldEquals { field, value }) => client
                .execute(
                    "UPDATE ledger_items SET doc = $3 WHERE pk = $1 AND sk = $2 AND doc->>$4 = $5",
                    &[&item.pk, &item.sk, &doc, &field, &value.to_string()],
                )
                .await
                .map_err(to_internal)?,
        };

        if rows == 0 {
            return Err(StoreError::ConditionFailed {
                reason: "put condition did not match".into(),
            });
        }
        Ok(())
    }

    async fn update(
        &self,
        pk: &str,
        sk: &str,
        expr: Vec<UpdateExpr>,
        condition: Option<UpdateCondition>,
    ) -> StoreResult<Item> {
        let mut client = self.pool.get().await.map_err(to_transient)?;
        let txn = client.transaction().await.map_err(to_internal)?;

        let existing = txn
            .query_opt("SELECT pk, sk, doc FROM ledger_items WHERE pk = $1 AND sk = $2 FOR UPDATE", &[&pk, &sk])
            .await
            .map_err(to_internal)?
            .as_ref()
            .map(Self::row_to_item)
            .transpose()?;

        check_update_condition(existing.as_ref(), &condition)?;

        let mut item = existing.unwrap_or_else(|| Item::new(pk, sk));
        for e in &expr {
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

        let doc = Self::doc_of(&item);
        txn.execute(
            "INSERT INTO ledger_items (pk, sk, doc) VALUES ($1, $2, $3)
             ON CONFLICT (pk, sk) DO UPDATE SET doc = EXCLUDED.doc",
            &[&pk, &sk, &doc],
        )
        .await
        .map_err(to_internal)?;

        txn.commit().await.map_err(to_internal)?;
        Ok(item)
    }

    async fn query(&self, pk: &str, sk_prefix: &str, opts: QueryOpts) -> StoreResult<Page> {
        let client = self.pool.get().await.map_err(to_transient)?;
        let limit = opts.limit.unwrap_or(1000) as i64;
        let order = if opts.forward { "ASC" } else { "DESC" };
        let rows = client
            .query(
                &format!(
                    "SELECT pk, sk, doc FROM ledger_items WHERE pk = $1 AND sk LIKE $2 ORDER BY sk {order} LIMIT $3"
                ),
                &[&pk, &format!("{sk_prefix}%"), &limit],
            )
            .await
            .map_err(to_internal)?;
        let items = rows.iter().map(Self::row_to_item).collect::<StoreResult<Vec<_>>>()?;
        Ok(Page {
            next_cursor: items.last().map(|i| i.sk.clone()),
            items,
        })
    }

    async fn query_index(
        &self,
        index: &str,
        pk: &str,
        sk_prefix: &str,
        opts: QueryOpts,
    ) -> StoreResult<Page> {
        if index == "GSI1" && !self.gsi1_available {
            warn!("GSI1 unavailable, falling back to primary-partition scan");
            return self.query(pk, sk_prefix, opts).await;
        }
        let (pk_col, sk_col) = index_columns(index)?;
        let client = self.pool.get().await.map_err(to_transient)?;
        let limit = opts.limit.unwrap_or(1000) as i64;
        let order = if opts.forward { "ASC" } else { "DESC" };
        let rows = client
            .query(
                &format!(
                    "SELECT pk, sk, doc FROM ledger_items WHERE {pk_col} = $1 AND {sk_col} LIKE $2 ORDER BY {sk_col} {order} LIMIT $3"
                ),
                &[&pk, &format!("{sk_prefix}%"), &limit],
            )
            .await
            .map_err(to_internal)?;
        let items = rows.iter().map(Self::row_to_item).collect::<StoreResult<Vec<_>>>()?;
        Ok(Page {
            next_cursor: items.last().map(|i| i.sk.clone()),
            items,
        })
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        too_many_ops(&ops)?;
        let mut client = self.pool.get().await.map_err(to_transient)?;
        let txn = client.transaction().await.map_err(to_internal)?;

        for op in ops {
            let is_delete = matches!(&op, WriteOp::Delete { .. });
            let rows_affected = match op {
                WriteOp::Put { item, condition } => {
                    let doc = Self::doc_of(&item);
                    match condition {
                        Some(PutCondition::AttributeNotExists) => {
                            txn.execute(
                                "INSERT INTO ledger_items (pk, sk, doc, gsi1_pk, gsi1_sk, gsi2_pk, gsi2_sk)
                                 VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (pk, sk) DO NOTHING",
                                &[
                                    &item.pk,
                                    &item.sk,
                                    &doc,
                                    &item.get_str("gsi1_pk"),
                                    &item.get_str("gsi1_sk"),
                                    &item.get_str("gsi2_pk"),
                                    &item.get_str("gsi2_sk"),
                                ],
                            )
                            .await
                        }
                        Some(PutCondition::FieldEquals { field, value }) => {
                            txn.execute(
                                "UPDATE ledger_items SET doc = $3 WHERE pk = $1 AND sk = $2 AND doc->>$4 = $5",
                                &[&item.pk, &item.sk, &doc, &field, &value.to_string()],
                            )
                            .await
                        }
                        None => txn
                            .execute(
                                "INSERT INTO ledger_items (pk, sk, doc, gsi1_pk, gsi1_sk, gsi2_pk, gsi2_sk)
                                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                                 ON CONFLICT (pk, sk) DO UPDATE SET doc = EXCLUDED.doc",
                                &[
                                    &item.pk,
                                    &item.sk,
                                    &doc,
                                    &item.get_str("gsi1_pk"),
                                    &item.get_str("gsi1_sk"),
                                    &item.get_str("gsi2_pk"),
                                    &item.get_str("gsi2_sk"),
                                ],
                            )
                            .await,
                    }
                    .map_err(to_internal)?
                }
                WriteOp::Update { pk, sk, expr, condition } => {
                    let existing = txn
                        .query_opt("SELECT pk, sk, doc FROM ledger_items WHERE pk = $1 AND sk = $2 FOR UPDATE", &[&pk, &sk])
                        .await
                        .map_err(to_internal)?
                        .as_ref()
                        .map(Self::row_to_item)
                        .transpose()?;

                    if check_update_condition(existing.as_ref(), &condition).is_err() {
                        0
                    } else {
                        let mut item = existing.unwrap_or_else(|| Item::new(&pk, &sk));
                        for e in &expr {
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
                        let doc = Self::doc_of(&item);
                        txn.execute(
                            "INSERT INTO ledger_items (pk, sk, doc) VALUES ($1, $2, $3)
                             ON CONFLICT (pk, sk) DO UPDATE SET doc = EXCLUDED.doc",
                            &[&pk, &sk, &doc],
                        )
                        .await
                        .map_err(to_internal)?
                    }
                }
                WriteOp::Delete { pk, sk } => txn
                    .execute("DELETE FROM ledger_items WHERE pk = $1 AND sk = $2", &[&pk, &sk])
                    .await
                    .map_err(to_internal)?,
            };

            if rows_affected == 0 && !is_delete {
                // Any single Put/Update condition failure cancels the whole batch.
                // Delete carries no condition (§4.1), so deleting an absent row
                // is not a failure, matching the memory store.
                drop(txn);
                return Err(StoreError::ConditionFailed {
                    reason: "transact_write operation condition failed, batch cancelled".into(),
                });
            }
        }

        txn.commit().await.map_err(to_internal)?;
        Ok(())
    }

    fn index_availability(&self, index: &str) -> IndexAvailability {
        match index {
            "GSI1" if !self.gsi1_available => IndexAvailability::Fallback,
            _ => IndexAvailability::Available,
        }
    }
}

fn check_update_condition(existing: Option<&Item>, condition: &Option<UpdateCondition>) -> StoreResult<()> {
    match condition {
        None => Ok(()),
        Some(UpdateCondition::Exists) => existing.map(|_| ()).ok_or_else(|| StoreError::ConditionFailed {
            reason: "item does not exist".into(),
        }),
        Some(UpdateCondition::FieldEquals { field, value }) => match existing {
            Some(e) if e.get(field) == Some(value) => Ok(()),
            _ => Err(StoreError::ConditionFailed {
                reason: format!("field {field} did not equal expected value"),
            }),
        },
        Some(UpdateCondition::FieldAtLeast { field, minimum }) => {
            match existing.and_then(|e| e.get_i64(field)) {
                Some(v) if v >= *minimum => Ok(()),
                _ => Err(StoreError::ConditionFailed {
                    reason: format!("field {field} below required minimum {minimum}"),
                }),
            }
        }
    }
}
