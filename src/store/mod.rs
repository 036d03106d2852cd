//! The shared Store abstraction (C1, §4.1): scalar/HASH/LIST/pub-sub
//! primitives with two backends — `redis_store` (distributed) and
//! `local_store` (process-local fallback) — sharing one trait so callers
//! never branch on concrete backend identity (§9).

pub mod local_store;
pub mod redis_store;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("value at {key} has the wrong shape for this operation")]
    WrongType { key: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A message delivered to a `Subscription`: the channel it arrived on and
/// its raw payload (most subscribers in this crate ignore the payload and
/// just reload from the DB on receipt, per §9's at-most-once policy).
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// A live subscription to one or more channels. `Close` is idempotent:
/// dropping it, or calling `close`, both stop delivery.
pub struct Subscription {
    rx: mpsc::Receiver<PubSubMessage>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<PubSubMessage>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Optional capability: batched HSet/LPush for the bulk-load fast path
/// (`KeyProvider::load_keys_from_db`, §4.5).
#[async_trait]
pub trait Pipeline: Send {
    fn hset(&mut self, key: &str, fields: HashMap<String, String>);
    fn lpush(&mut self, key: &str, values: Vec<String>);
    async fn execute(self: Box<Self>) -> StoreResult<()>;
}

/// Optional capability: compare-and-swap scripting, used by leader-election
/// renew/release (§4.9).
#[async_trait]
pub trait Eval: Send + Sync {
    async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> StoreResult<Option<String>>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn delete(&self, key: &str) -> StoreResult<bool>;
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Atomic create-if-absent; returns whether the caller won the race.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn hset(&self, key: &str, fields: HashMap<String, String>) -> StoreResult<()>;
    async fn hget_all(&self, key: &str) -> StoreResult<Option<HashMap<String, String>>>;
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    async fn lpush(&self, key: &str, values: Vec<String>) -> StoreResult<()>;
    /// `count = 0` removes every occurrence; returns the number removed.
    async fn lrem(&self, key: &str, count: i64, value: &str) -> StoreResult<i64>;
    /// Atomic "take rightmost, prepend to left"; `None` when the list is empty.
    async fn rotate(&self, key: &str) -> StoreResult<Option<String>>;
    async fn lrange_all(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    fn pipeline(&self) -> Option<Box<dyn Pipeline>>;
    fn eval(&self) -> Option<&dyn Eval>;

    fn is_local(&self) -> bool;
    fn is_distributed(&self) -> bool {
        !self.is_local()
    }
}
