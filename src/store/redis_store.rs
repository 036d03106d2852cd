//! Distributed `Store` backend over Redis (§4.1, §4.9). Backs multi-node
//! deployments: the keyspace, pub-sub fanout, and the CAS primitives used by
//! leader election all live in the one Redis instance every node shares.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use tokio::sync::mpsc;

use super::{Eval, Pipeline, PubSubMessage, Store, StoreError, StoreResult, Subscription};

const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

pub struct RedisStore {
    pool: Pool,
    /// A dedicated multiplexed connection for pub-sub, since subscriptions
    /// can't share a connection with regular commands.
    client: redis::Client,
}

impl RedisStore {
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let cfg = PoolConfig::from_url(dsn);
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
        // Fail fast if the DSN is unreachable rather than only discovering it
        // on the first request.
        let mut conn = pool.get().await?;
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;

        let client = redis::Client::open(dsn)?;
        Ok(Self { pool, client })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn.get(key).await?)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        Ok(conn.exists(key).await?)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn hset(&self, key: &str, fields: HashMap<String, String>) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        let _: () = conn.hset_multiple(key, &pairs).await?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> StoreResult<Option<HashMap<String, String>>> {
        let mut conn = self.pool.get().await?;
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.pool.get().await?;
        Ok(conn.hincr(key, field, delta).await?)
    }

    async fn lpush(&self, key: &str, values: Vec<String>) -> StoreResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        let _: () = conn.lpush(key, values).await?;
        Ok(())
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> StoreResult<i64> {
        let mut conn = self.pool.get().await?;
        Ok(conn.lrem(key, count as isize, value).await?)
    }

    async fn rotate(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(key)
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn lrange_all(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn.lrange(key, 0, -1).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let channel = channel.to_string();
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let delivered = PubSubMessage { channel: channel.clone(), payload };
                if tx.send(delivered).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    fn pipeline(&self) -> Option<Box<dyn Pipeline>> {
        Some(Box::new(RedisPipeline { pool: self.pool.clone(), pipe: redis::pipe() }))
    }

    fn eval(&self) -> Option<&dyn Eval> {
        Some(self)
    }

    fn is_local(&self) -> bool {
        false
    }
}

#[async_trait]
impl Eval for RedisStore {
    async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> StoreResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        let mut invocation = redis::Script::new(script).prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        Ok(invocation.invoke_async(&mut conn).await?)
    }
}

struct RedisPipeline {
    pool: Pool,
    pipe: redis::Pipeline,
}

#[async_trait]
impl Pipeline for RedisPipeline {
    fn hset(&mut self, key: &str, fields: HashMap<String, String>) {
        if fields.is_empty() {
            return;
        }
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        self.pipe.hset_multiple(key, &pairs).ignore();
    }

    fn lpush(&mut self, key: &str, values: Vec<String>) {
        if values.is_empty() {
            return;
        }
        self.pipe.lpush(key, values).ignore();
    }

    async fn execute(self: Box<Self>) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = self.pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
