//! Process-local Store fallback, used when `REDIS_DSN` is unset (single-node
//! deployments). Backed by `dashmap` for the concurrent keyspace and
//! `tokio::sync::mpsc` per-subscriber queues for pub-sub (§4.1).
//!
//! Correctness here matters more than raw speed: every invariant in §3 must
//! hold exactly as it would against the distributed backend, since this is
//! what the crate's own tests run against.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{Pipeline, PubSubMessage, Store, StoreError, StoreResult, Subscription};

const SUBSCRIBER_QUEUE_DEPTH: usize = 64;
const SUBSCRIBER_SEND_TIMEOUT: Duration = Duration::from_secs(1);

enum Slot {
    Scalar(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|t| Instant::now() >= t).unwrap_or(false)
    }
}

/// The actual keyspace + subscriber registry, held behind an `Arc` so a
/// `Pipeline` built from a `LocalStore` can apply its buffered writes
/// directly against the same maps on `execute`.
struct Inner {
    data: DashMap<String, Entry>,
    subscribers: DashMap<String, Vec<mpsc::Sender<PubSubMessage>>>,
}

impl Inner {
    fn get_live(&self, key: &str) -> Option<dashmap::mapref::one::Ref<'_, String, Entry>> {
        match self.data.get(key) {
            Some(entry) if entry.is_expired() => {
                drop(entry);
                self.data.remove(key);
                None
            }
            other => other,
        }
    }

    fn apply_hset(&self, key: &str, fields: HashMap<String, String>) -> StoreResult<()> {
        match self.data.entry(key.to_string()) {
            DashEntry::Occupied(mut occ) if !occ.get().is_expired() => match &mut occ.get_mut().slot {
                Slot::Hash(h) => {
                    h.extend(fields);
                    Ok(())
                }
                _ => Err(StoreError::WrongType { key: key.to_string() }),
            },
            _ => {
                self.data.insert(key.to_string(), Entry { slot: Slot::Hash(fields), expires_at: None });
                Ok(())
            }
        }
    }

    fn apply_lpush(&self, key: &str, values: Vec<String>) -> StoreResult<()> {
        match self.data.entry(key.to_string()) {
            DashEntry::Occupied(mut occ) if !occ.get().is_expired() => match &mut occ.get_mut().slot {
                Slot::List(list) => {
                    for v in values {
                        list.push_front(v);
                    }
                    Ok(())
                }
                _ => Err(StoreError::WrongType { key: key.to_string() }),
            },
            _ => {
                let mut list = VecDeque::new();
                for v in values {
                    list.push_front(v);
                }
                self.data.insert(key.to_string(), Entry { slot: Slot::List(list), expires_at: None });
                Ok(())
            }
        }
    }
}

pub struct LocalStore(Arc<Inner>);

impl LocalStore {
    pub fn new() -> Self {
        Self(Arc::new(Inner { data: DashMap::new(), subscribers: DashMap::new() }))
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.0.data.insert(
            key.to_string(),
            Entry { slot: Slot::Scalar(value.to_string()), expires_at: ttl.map(|d| Instant::now() + d) },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match self.0.get_live(key) {
            None => Ok(None),
            Some(entry) => match &entry.slot {
                Slot::Scalar(v) => Ok(Some(v.clone())),
                _ => Err(StoreError::WrongType { key: key.to_string() }),
            },
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.0.data.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.0.get_live(key).is_some())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        match self.0.data.entry(key.to_string()) {
            DashEntry::Occupied(mut occ) if occ.get().is_expired() => {
                occ.insert(Entry { slot: Slot::Scalar(value.to_string()), expires_at: Some(Instant::now() + ttl) });
                Ok(true)
            }
            DashEntry::Occupied(_) => Ok(false),
            DashEntry::Vacant(vac) => {
                vac.insert(Entry { slot: Slot::Scalar(value.to_string()), expires_at: Some(Instant::now() + ttl) });
                Ok(true)
            }
        }
    }

    async fn hset(&self, key: &str, fields: HashMap<String, String>) -> StoreResult<()> {
        self.0.apply_hset(key, fields)
    }

    async fn hget_all(&self, key: &str) -> StoreResult<Option<HashMap<String, String>>> {
        match self.0.get_live(key) {
            None => Ok(None),
            Some(entry) => match &entry.slot {
                Slot::Hash(h) => Ok(Some(h.clone())),
                _ => Err(StoreError::WrongType { key: key.to_string() }),
            },
        }
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        match self.0.data.entry(key.to_string()) {
            DashEntry::Occupied(mut occ) if !occ.get().is_expired() => match &mut occ.get_mut().slot {
                Slot::Hash(h) => {
                    let current: i64 = h.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
                    let next = current + delta;
                    h.insert(field.to_string(), next.to_string());
                    Ok(next)
                }
                _ => Err(StoreError::WrongType { key: key.to_string() }),
            },
            _ => {
                let mut h = HashMap::new();
                h.insert(field.to_string(), delta.to_string());
                self.0.data.insert(key.to_string(), Entry { slot: Slot::Hash(h), expires_at: None });
                Ok(delta)
            }
        }
    }

    async fn lpush(&self, key: &str, values: Vec<String>) -> StoreResult<()> {
        self.0.apply_lpush(key, values)
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> StoreResult<i64> {
        let Some(mut entry) = self.0.data.get_mut(key) else { return Ok(0) };
        match &mut entry.slot {
            Slot::List(list) => {
                let mut removed = 0i64;
                let limit = if count <= 0 { usize::MAX } else { count as usize };
                list.retain(|v| {
                    if removed as usize >= limit || v != value {
                        true
                    } else {
                        removed += 1;
                        false
                    }
                });
                Ok(removed)
            }
            _ => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn rotate(&self, key: &str) -> StoreResult<Option<String>> {
        let Some(mut entry) = self.0.data.get_mut(key) else { return Ok(None) };
        match &mut entry.slot {
            Slot::List(list) => {
                let Some(value) = list.pop_back() else { return Ok(None) };
                list.push_front(value.clone());
                Ok(Some(value))
            }
            _ => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn lrange_all(&self, key: &str) -> StoreResult<Vec<String>> {
        match self.0.get_live(key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.slot {
                Slot::List(list) => Ok(list.iter().cloned().collect()),
                _ => Err(StoreError::WrongType { key: key.to_string() }),
            },
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let Some(subs) = self.0.subscribers.get(channel) else { return Ok(()) };
        let message = PubSubMessage { channel: channel.to_string(), payload: payload.to_string() };
        for sub in subs.iter() {
            // Best-effort, bounded: block up to 1s then drop (§4.1).
            let _ = tokio::time::timeout(SUBSCRIBER_SEND_TIMEOUT, sub.send(message.clone())).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        self.0.subscribers.entry(channel.to_string()).or_default().push(tx);
        Ok(Subscription::new(rx))
    }

    fn pipeline(&self) -> Option<Box<dyn Pipeline>> {
        Some(Box::new(LocalPipeline { inner: self.0.clone(), ops: Vec::new() }))
    }

    fn eval(&self) -> Option<&dyn super::Eval> {
        None
    }

    fn is_local(&self) -> bool {
        true
    }
}

enum PipelineOp {
    HSet(String, HashMap<String, String>),
    LPush(String, Vec<String>),
}

struct LocalPipeline {
    inner: Arc<Inner>,
    ops: Vec<PipelineOp>,
}

#[async_trait]
impl Pipeline for LocalPipeline {
    fn hset(&mut self, key: &str, fields: HashMap<String, String>) {
        self.ops.push(PipelineOp::HSet(key.to_string(), fields));
    }

    fn lpush(&mut self, key: &str, values: Vec<String>) {
        self.ops.push(PipelineOp::LPush(key.to_string(), values));
    }

    async fn execute(self: Box<Self>) -> StoreResult<()> {
        for op in self.ops {
            match op {
                PipelineOp::HSet(key, fields) => self.inner.apply_hset(&key, fields)?,
                PipelineOp::LPush(key, values) => self.inner.apply_lpush(&key, values)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rotate_is_a_permutation() {
        let store = LocalStore::new();
        store.lpush("g:active", vec!["k3".into(), "k2".into(), "k1".into()]).await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(store.rotate("g:active").await.unwrap().unwrap());
        }
        assert_eq!(seen, vec!["k1", "k2", "k3"]);
        // the cycle repeats
        assert_eq!(store.rotate("g:active").await.unwrap(), Some("k1".to_string()));
    }

    #[tokio::test]
    async fn lrem_zero_removes_all_duplicates() {
        let store = LocalStore::new();
        store.lpush("g:active", vec!["k1".into()]).await.unwrap();
        store.lpush("g:active", vec!["k1".into()]).await.unwrap();
        let removed = store.lrem("g:active", 0, "k1").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.lrange_all("g:active").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn set_nx_only_wins_once() {
        let store = LocalStore::new();
        assert!(store.set_nx("lock", "node-a", Duration::from_secs(30)).await.unwrap());
        assert!(!store.set_nx("lock", "node-b", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn pipeline_applies_on_execute() {
        let store = LocalStore::new();
        let mut pipe = store.pipeline().unwrap();
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), "active".to_string());
        pipe.hset("key:1", fields);
        pipe.lpush("g:1:active_keys", vec!["1".to_string()]);
        pipe.execute().await.unwrap();

        assert_eq!(store.hget_all("key:1").await.unwrap().unwrap().get("status").unwrap(), "active");
        assert_eq!(store.lrange_all("g:1:active_keys").await.unwrap(), vec!["1".to_string()]);
    }
}
