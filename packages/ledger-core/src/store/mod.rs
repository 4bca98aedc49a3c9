//! Store Adapter: abstracts the document store the core is built on.
//!
//! The persistence store is a single key-value/document table keyed by a
//! composite `(pk, sk)`, supporting conditional puts, conditional arithmetic
//! updates, range queries on the sort key, secondary-index queries, and
//! bounded multi-item transactional writes (at most 25 operations, all or
//! nothing). Two implementations ship with this crate: [`memory::MemoryStore`]
//! (used by this crate's own tests, no external service required) and
//! [`postgres::PostgresStore`] (a real backend over a single Postgres table).

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// A stored document: the raw attribute map plus its key.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub pk: String,
    pub sk: String,
    pub attrs: BTreeMap<String, Value>,
}

impl Item {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.attrs.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(|v| v.as_str())
    }
}

/// Condition attached to a `Put`: either the item must not already exist, or
/// an existing field must hold an expected value.
#[derive(Debug, Clone)]
pub enum PutCondition {
    AttributeNotExists,
    FieldEquals { field: String, value: Value },
}

/// Arithmetic/field update expressions applied by [`StoreAdapter::update`].
/// These are the only way aggregates and lots are ever mutated, never a
/// read-modify-write from application memory.
#[derive(Debug, Clone)]
pub enum UpdateExpr {
    /// `field = if_not_exists(field, 0) + by` (by may be negative).
    Incr { field: String, by: i64 },
    /// Set a field to a literal value, creating the item if absent.
    Set { field: String, value: Value },
}

/// Condition attached to an [`StoreAdapter::update`] call.
#[derive(Debug, Clone)]
pub enum UpdateCondition {
    /// `field = expected`
    FieldEquals { field: String, value: Value },
    /// `field >= minimum`, used for the lot/budget decrement guard.
    FieldAtLeast { field: String, minimum: i64 },
    /// The item must already exist.
    Exists,
}

/// A single operation inside a [`StoreAdapter::transact_write`] batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put {
        item: Item,
        condition: Option<PutCondition>,
    },
    Update {
        pk: String,
        sk: String,
        expr: Vec<UpdateExpr>,
        condition: Option<UpdateCondition>,
    },
    Delete {
        pk: String,
        sk: String,
    },
}

/// Options controlling a range [`StoreAdapter::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    pub forward: bool,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

/// A page of query results plus an opaque cursor for the next page, if any.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Item>,
    pub next_cursor: Option<String>,
}

/// Failure taxonomy surfaced by the store. Not-found is never an error;
/// `get`/`query` return empty results instead.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("condition failed: {reason}")]
    ConditionFailed { reason: String },
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("internal store error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Whether a secondary index is available, or whether the adapter must
/// degrade to a primary-partition query with in-process filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexAvailability {
    Available,
    Fallback,
}

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    async fn get(&self, pk: &str, sk: &str) -> StoreResult<Option<Item>>;

    async fn put(&self, item: Item, condition: Option<PutCondition>) -> StoreResult<()>;

    /// Apply one or more update expressions atomically against a single
    /// item, gated by an optional condition, and return the resulting item.
    async fn update(
        &self,
        pk: &str,
        sk: &str,
        expr: Vec<UpdateExpr>,
        condition: Option<UpdateCondition>,
    ) -> StoreResult<Item>;

    async fn query(&self, pk: &str, sk_prefix: &str, opts: QueryOpts) -> StoreResult<Page>;

    /// Query a secondary index. Returns [`IndexAvailability::Fallback`]
    /// results identically shaped to a native index query; callers do not
    /// need to know which path served the request.
    async fn query_index(
        &self,
        index: &str,
        pk: &str,
        sk_prefix: &str,
        opts: QueryOpts,
    ) -> StoreResult<Page>;

    /// Apply every operation in `ops` atomically: if any condition fails,
    /// none of the writes are applied. Bounded to 25 operations.
    async fn transact_write(&self, ops: Vec<WriteOp>) -> StoreResult<()>;

    /// Whether the named secondary index is backed by a real index or the
    /// primary-partition fallback. Checked once at startup.
    fn index_availability(&self, index: &str) -> IndexAvailability;
}

pub(crate) fn too_many_ops(ops: &[WriteOp]) -> StoreResult<()> {
    if ops.len() > 25 {
        return Err(StoreError::Internal(format!(
            "transact_write accepts at most 25 operations, got {}",
            ops.len()
        )));
    }
    Ok(())
}
