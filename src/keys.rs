//! KeyProvider (C5, §4.5): per-group key rotation, status/failure tracking,
//! and the bulk DB-to-cache bootstrap. This is the component the invariants
//! in §3 are written against.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::PgPool;

use crate::db::{self, ApiKeyRow};
use crate::error::{AppError, AppResult};
use crate::store::Store;

const KEYPOOL_INITIALIZED: &str = "keypool:initialized";
const KEYPOOL_LOADING: &str = "keypool:loading";
const LOADING_LEASE_SECS: u64 = 600;
const LOAD_BATCH_SIZE: usize = 1000;

fn key_hash(key_id: i64) -> String {
    format!("key:{key_id}")
}

fn active_list(group_id: i64) -> String {
    format!("group:{group_id}:active_keys")
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: i64,
    pub key_string: String,
    pub status: String,
    pub failure_count: i32,
    pub group_id: i64,
}

impl ApiKey {
    fn from_hash(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            id: fields.get("id")?.parse().ok()?,
            key_string: fields.get("key_string")?.clone(),
            status: fields.get("status")?.clone(),
            failure_count: fields.get("failure_count")?.parse().ok()?,
            group_id: fields.get("group_id")?.parse().ok()?,
        })
    }

    fn hash_fields(row: &ApiKeyRow) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), row.id.to_string());
        fields.insert("key_string".to_string(), row.key_value.clone());
        fields.insert("status".to_string(), row.status.clone());
        fields.insert("failure_count".to_string(), row.failure_count.to_string());
        fields.insert("group_id".to_string(), row.group_id.to_string());
        fields.insert("created_at".to_string(), row.created_at.to_rfc3339());
        fields
    }
}

pub struct KeyProvider {
    db: PgPool,
    store: Arc<dyn Store>,
}

impl KeyProvider {
    pub fn new(db: PgPool, store: Arc<dyn Store>) -> Self {
        Self { db, store }
    }

    /// Rotate-pop the active list and reconstruct the key from its HASH.
    /// Must not mutate `status` or `failure_count` (§4.5).
    pub async fn select_key(&self, group_id: i64) -> AppResult<ApiKey> {
        let Some(key_id_str) = self.store.rotate(&active_list(group_id)).await.map_err(store_err)? else {
            return Err(AppError::NotFound(format!("no active keys for group {group_id}")));
        };
        let key_id: i64 = key_id_str
            .parse()
            .map_err(|_| AppError::Internal(format!("corrupt active-list entry {key_id_str}")))?;

        let fields = self
            .store
            .hget_all(&key_hash(key_id))
            .await
            .map_err(store_err)?
            .ok_or_else(|| AppError::Internal(format!("active key {key_id} missing its HASH")))?;

        ApiKey::from_hash(&fields).ok_or_else(|| AppError::Internal(format!("corrupt key HASH for {key_id}")))
    }

    /// Fire-and-forget from the proxy's critical path (§4.7); callers should
    /// invoke this through the bounded worker pool, not inline.
    pub async fn update_status(&self, key_id: i64, group_id: i64, success: bool, blacklist_threshold: i32) -> AppResult<()> {
        if success {
            self.report_success(key_id, group_id).await
        } else {
            self.report_failure(key_id, group_id, blacklist_threshold).await
        }
    }

    /// `KeyRevoked` (§7): the upstream told us the key itself is dead, so the
    /// failure counter jumps by the full `blacklist_threshold` in one step
    /// instead of the ordinary +1, guaranteeing immediate invalidation.
    pub async fn revoke_key(&self, key_id: i64, group_id: i64, blacklist_threshold: i32) -> AppResult<()> {
        let current = self.store.hget_all(&key_hash(key_id)).await.map_err(store_err)?;
        if let Some(fields) = &current {
            if fields.get("status").map(String::as_str) == Some(db::keys::STATUS_INVALID) {
                return Ok(());
            }
        }

        let mut tx = self.db.begin().await?;
        let Some(row) = db::keys::lock_row(&mut tx, key_id).await? else {
            tx.rollback().await.ok();
            return Ok(());
        };
        if row.status == db::keys::STATUS_INVALID {
            tx.rollback().await.ok();
            return Ok(());
        }

        let new_failures = row.failure_count + blacklist_threshold.max(1);
        db::keys::set_status_and_failures(&mut tx, key_id, db::keys::STATUS_INVALID, new_failures).await?;
        tx.commit().await?;

        let mut fields = HashMap::new();
        fields.insert("status".to_string(), db::keys::STATUS_INVALID.to_string());
        fields.insert("failure_count".to_string(), new_failures.to_string());
        self.store.hset(&key_hash(key_id), fields).await.map_err(store_err)?;
        self.store.lrem(&active_list(group_id), 0, &key_id.to_string()).await.map_err(store_err)?;
        Ok(())
    }

    async fn report_success(&self, key_id: i64, group_id: i64) -> AppResult<()> {
        let current = self.store.hget_all(&key_hash(key_id)).await.map_err(store_err)?;
        if let Some(fields) = &current {
            let failure_count: i32 = fields.get("failure_count").and_then(|v| v.parse().ok()).unwrap_or(0);
            let status = fields.get("status").map(String::as_str).unwrap_or("");
            if failure_count == 0 && status == db::keys::STATUS_ACTIVE {
                return Ok(());
            }
        }

        let mut tx = self.db.begin().await?;
        let Some(row) = db::keys::lock_row(&mut tx, key_id).await? else {
            tx.rollback().await.ok();
            return Ok(());
        };
        let was_invalid = row.status == db::keys::STATUS_INVALID;
        db::keys::set_status_and_failures(&mut tx, key_id, db::keys::STATUS_ACTIVE, 0).await?;
        tx.commit().await?;

        let mut fields = HashMap::new();
        fields.insert("status".to_string(), db::keys::STATUS_ACTIVE.to_string());
        fields.insert("failure_count".to_string(), "0".to_string());
        self.store.hset(&key_hash(key_id), fields).await.map_err(store_err)?;

        if was_invalid {
            let list = active_list(group_id);
            self.store.lrem(&list, 0, &key_id.to_string()).await.map_err(store_err)?;
            self.store.lpush(&list, vec![key_id.to_string()]).await.map_err(store_err)?;
            crate::logger::info("keys", &format!("key {key_id} recovered in group {group_id}"));
        }
        Ok(())
    }

    async fn report_failure(&self, key_id: i64, group_id: i64, blacklist_threshold: i32) -> AppResult<()> {
        let current = self.store.hget_all(&key_hash(key_id)).await.map_err(store_err)?;
        if let Some(fields) = &current {
            if fields.get("status").map(String::as_str) == Some(db::keys::STATUS_INVALID) {
                return Ok(());
            }
        }

        let mut tx = self.db.begin().await?;
        let Some(row) = db::keys::lock_row(&mut tx, key_id).await? else {
            tx.rollback().await.ok();
            return Ok(());
        };
        if row.status == db::keys::STATUS_INVALID {
            tx.rollback().await.ok();
            return Ok(());
        }

        let new_failures = row.failure_count + 1;
        let goes_invalid = new_failures >= blacklist_threshold;
        let new_status = if goes_invalid { db::keys::STATUS_INVALID } else { db::keys::STATUS_ACTIVE };
        db::keys::set_status_and_failures(&mut tx, key_id, new_status, new_failures).await?;
        tx.commit().await?;

        self.store
            .hincr_by(&key_hash(key_id), "failure_count", 1)
            .await
            .map_err(store_err)?;

        if goes_invalid {
            let mut fields = HashMap::new();
            fields.insert("status".to_string(), db::keys::STATUS_INVALID.to_string());
            self.store.hset(&key_hash(key_id), fields).await.map_err(store_err)?;
            self.store.lrem(&active_list(group_id), 0, &key_id.to_string()).await.map_err(store_err)?;
        }
        Ok(())
    }

    /// First-time bootstrap (§4.5). Master-only in multi-node deployments;
    /// callers gate that externally.
    pub async fn load_keys_from_db(&self) -> AppResult<()> {
        if self.store.exists(KEYPOOL_INITIALIZED).await.map_err(store_err)? {
            return Ok(());
        }
        if !self
            .store
            .set_nx(KEYPOOL_LOADING, "1", Duration::from_secs(LOADING_LEASE_SECS))
            .await
            .map_err(store_err)?
        {
            crate::logger::debug("keys", "another node is already loading the key pool");
            return Ok(());
        }

        let all = db::keys::list_all(&self.db).await?;
        let mut active_by_group: HashMap<i64, Vec<String>> = HashMap::new();

        for batch in all.chunks(LOAD_BATCH_SIZE) {
            match self.store.pipeline() {
                Some(mut pipe) => {
                    for row in batch {
                        pipe.hset(&key_hash(row.id), ApiKey::hash_fields(row));
                        if row.status == db::keys::STATUS_ACTIVE {
                            active_by_group.entry(row.group_id).or_default().push(row.id.to_string());
                        }
                    }
                    pipe.execute().await.map_err(store_err)?;
                }
                None => {
                    for row in batch {
                        self.store.hset(&key_hash(row.id), ApiKey::hash_fields(row)).await.map_err(store_err)?;
                        if row.status == db::keys::STATUS_ACTIVE {
                            active_by_group.entry(row.group_id).or_default().push(row.id.to_string());
                        }
                    }
                }
            }
        }

        for (group_id, mut ids) in active_by_group {
            let list = active_list(group_id);
            self.store.delete(&list).await.map_err(store_err)?;
            // Preserve ascending id order in the rebuilt list: LPush reverses,
            // so push the reverse of the desired order.
            ids.reverse();
            self.store.lpush(&list, ids).await.map_err(store_err)?;
        }

        self.store.set(KEYPOOL_INITIALIZED, "1", None).await.map_err(store_err)?;
        self.store.delete(KEYPOOL_LOADING).await.map_err(store_err)?;
        crate::logger::info("keys", &format!("bootstrapped {} keys into the pool", all.len()));
        Ok(())
    }

    pub async fn add_keys(&self, group_id: i64, values: Vec<String>) -> AppResult<Vec<ApiKeyRow>> {
        let inserted = db::keys::insert_many(&self.db, group_id, &values).await?;
        for row in &inserted {
            self.store.hset(&key_hash(row.id), ApiKey::hash_fields(row)).await.map_err(store_err)?;
            self.store.lrem(&active_list(group_id), 0, &row.id.to_string()).await.map_err(store_err)?;
            self.store.lpush(&active_list(group_id), vec![row.id.to_string()]).await.map_err(store_err)?;
        }
        Ok(inserted)
    }

    pub async fn remove_keys(&self, group_id: i64, key_ids: Vec<i64>) -> AppResult<Vec<ApiKeyRow>> {
        let deleted = db::keys::delete_many(&self.db, group_id, &key_ids).await?;
        for row in &deleted {
            self.store.lrem(&active_list(group_id), 0, &row.id.to_string()).await.map_err(store_err)?;
            self.store.delete(&key_hash(row.id)).await.map_err(store_err)?;
        }
        Ok(deleted)
    }

    /// `key_ids = None` restores every invalid key in the group. Idempotent:
    /// restoring an already-active key is a no-op (§8 property 6).
    pub async fn restore_keys(&self, group_id: i64, key_ids: Option<Vec<i64>>) -> AppResult<Vec<ApiKeyRow>> {
        let restored = db::keys::restore(&self.db, group_id, key_ids.as_deref()).await?;
        for row in &restored {
            let mut fields = HashMap::new();
            fields.insert("status".to_string(), db::keys::STATUS_ACTIVE.to_string());
            fields.insert("failure_count".to_string(), "0".to_string());
            self.store.hset(&key_hash(row.id), fields).await.map_err(store_err)?;
            self.store.lrem(&active_list(group_id), 0, &row.id.to_string()).await.map_err(store_err)?;
            self.store.lpush(&active_list(group_id), vec![row.id.to_string()]).await.map_err(store_err)?;
        }
        Ok(restored)
    }

    pub async fn remove_invalid_keys(&self, group_id: i64) -> AppResult<Vec<ApiKeyRow>> {
        let removed = db::keys::remove_invalid(&self.db, group_id).await?;
        for row in &removed {
            self.store.delete(&key_hash(row.id)).await.map_err(store_err)?;
        }
        Ok(removed)
    }

    /// Used when a group is deleted; DB cascade is handled by the caller.
    pub async fn remove_keys_from_store(&self, group_id: i64, key_ids: &[i64]) -> AppResult<()> {
        self.store.delete(&active_list(group_id)).await.map_err(store_err)?;
        for id in key_ids {
            self.store.delete(&key_hash(*id)).await.map_err(store_err)?;
        }
        Ok(())
    }
}

fn store_err(err: crate::store::StoreError) -> AppError {
    AppError::Store(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::local_store::LocalStore;

    fn sample_row(id: i64, group_id: i64, status: &str) -> ApiKeyRow {
        ApiKeyRow {
            id,
            group_id,
            key_value: format!("sk-{id}"),
            status: status.to_string(),
            failure_count: 0,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn select_key_does_not_mutate_status_or_failures() {
        let store: Arc<dyn Store> = Arc::new(LocalStore::new());
        let row = sample_row(1, 10, db::keys::STATUS_ACTIVE);
        store.hset(&key_hash(1), ApiKey::hash_fields(&row)).await.unwrap();
        store.lpush(&active_list(10), vec!["1".to_string()]).await.unwrap();

        let provider = KeyProvider::new(make_unconnected_pool(), store.clone());
        let key = provider.select_key(10).await.unwrap();
        assert_eq!(key.id, 1);
        assert_eq!(key.failure_count, 0);
        assert_eq!(key.status, db::keys::STATUS_ACTIVE);
    }

    #[tokio::test]
    async fn select_key_on_empty_group_is_not_found() {
        let store: Arc<dyn Store> = Arc::new(LocalStore::new());
        let provider = KeyProvider::new(make_unconnected_pool(), store);
        let err = provider.select_key(999).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    // sqlx::PgPool has no meaningful "disconnected but constructible" value;
    // these two tests only exercise store-side behavior that never reaches
    // the DB, so a lazily-connecting pool (never polled) is sufficient.
    fn make_unconnected_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool construction never touches the network")
    }
}
