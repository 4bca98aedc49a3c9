//! Idempotency cache: durable `(scope, key) -> cached response` mapping.
//!
//! Consulted at the start of every mutating operation; written on success.
//! This is not a lock: concurrent first-time invocations of the same
//! `(scope, key)` may both proceed, and the conditional writes elsewhere in
//! the store (lots, aggregates, EFT status) ensure only one actually
//! succeeds. The loser surfaces as a `Conflict` to its caller.
//!
//! TTL expiry is judged against the caller-supplied `now`, the same explicit
//! timestamp every mutating operation in this crate already threads through,
//! rather than an injected clock type.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::store::{Item, PutCondition, StoreAdapter, StoreResult};

const PARTITION_PREFIX: &str = "IDEMPOTENCY#";
pub const DEFAULT_TTL_DAYS: i64 = 14;

/// Deterministic scope string derived from operation identity.
pub fn scope(op: &str, parts: &[&str]) -> String {
    let mut s = op.to_string();
    for p in parts {
        s.push('#');
        s.push_str(p);
    }
    s
}

/// Returns the cached response for `(scope, key)` if a live (unexpired)
/// record exists.
pub async fn lookup<S: StoreAdapter>(store: &S, scope: &str, key: &str, now: DateTime<Utc>) -> StoreResult<Option<Value>> {
    let pk = format!("{PARTITION_PREFIX}{scope}");
    let Some(item) = store.get(&pk, key).await? else {
        return Ok(None);
    };
    let expires_at = item.get_i64("expires_at").unwrap_or(0);
    if expires_at <= now.timestamp() {
        return Ok(None);
    }
    Ok(item.get("response").cloned())
}

/// Build the idempotency record as a plain [`Item`] so transactional flows
/// can fold it into their own `transact_write` batch.
pub fn record_item(scope: &str, key: &str, response: &Value, ttl_days: i64, now: DateTime<Utc>) -> Item {
    let pk = format!("{PARTITION_PREFIX}{scope}");
    let expires_at = now.timestamp() + ttl_days * 86_400;
    Item::new(pk, key)
        .with("response", response.clone())
        .with("expires_at", expires_at)
}

/// Best-effort Put for flows that do not already perform a transactional
/// write. Logs a warning on failure rather than propagating it.
pub async fn record<S: StoreAdapter>(store: &S, scope: &str, key: &str, response: &Value, ttl_days: i64, now: DateTime<Utc>) {
    let item = record_item(scope, key, response, ttl_days, now);
    if let Err(e) = store.put(item, Some(PutCondition::AttributeNotExists)).await {
        tracing::warn!(scope, key, error = %e, "failed to record idempotency response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn replays_cached_response_within_ttl() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let response = serde_json::json!({"ok": true});

        record(&store, "ALLOCATE#s1#st1", "key-1", &response, 14, now).await;
        let hit = lookup(&store, "ALLOCATE#s1#st1", "key-1", now).await.unwrap();
        assert_eq!(hit, Some(response));
    }

    #[tokio::test]
    async fn expired_record_is_not_replayed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let response = serde_json::json!({"ok": true});

        record(&store, "ALLOCATE#s1#st1", "key-1", &response, 1, now).await;
        let later = now + chrono::Duration::days(2);

        let hit = lookup(&store, "ALLOCATE#s1#st1", "key-1", later).await.unwrap();
        assert_eq!(hit, None);
    }
}
