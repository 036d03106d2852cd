//! Leader election (C9, §4.9): a distributed lock for master-role assignment
//! plus a one-time bootstrap coordination lock, active only when the Store
//! is the distributed (Redis) backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::state::ShutdownToken;
use crate::store::Store;

const LEADER_KEY: &str = "cluster:leader";
const LEADER_TTL: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);

const INIT_KEY: &str = "cluster:initializing";
const INIT_TTL: Duration = Duration::from_secs(300);
const INIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Compare-and-set renewal: only extends the TTL if we still hold the lock.
const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("EXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Compare-and-delete release: only clears the lock if we still hold it.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct Leader {
    store: Arc<dyn Store>,
    node_id: String,
    is_leader: AtomicBool,
    /// `IS_SLAVE=true` (§4.9, glossary "Master/Leader"): this node never
    /// holds the master role, regardless of what the store election would
    /// otherwise decide.
    is_slave: bool,
}

impl Leader {
    /// In single-node mode (`store.is_local()`), leadership is unconditionally
    /// true and the renewal task is never spawned (§4.9, T4). `is_slave`
    /// overrides both: a slave node never leads, even on a local store.
    pub fn new(store: Arc<dyn Store>, is_slave: bool) -> Arc<Self> {
        let is_local = store.is_local();
        Arc::new(Self {
            store,
            node_id: Uuid::new_v4().to_string(),
            is_leader: AtomicBool::new(is_local && !is_slave),
            is_slave,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Spawns the acquire/renew loop. A no-op if the store is local or this
    /// node is fixed as a slave.
    pub fn spawn_renewal_task(self: &Arc<Self>, shutdown: ShutdownToken) {
        if self.store.is_local() || self.is_slave {
            return;
        }
        let leader = self.clone();
        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    return;
                }

                if leader.is_leader() {
                    leader.renew_or_relinquish().await;
                } else {
                    leader.try_acquire().await;
                }

                tokio::select! {
                    _ = tokio::time::sleep(RENEW_INTERVAL) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    async fn try_acquire(&self) {
        if self.is_slave {
            return;
        }
        match self.store.set_nx(LEADER_KEY, &self.node_id, LEADER_TTL).await {
            Ok(true) => {
                self.is_leader.store(true, Ordering::SeqCst);
                crate::logger::info("leader", &format!("node {} acquired leadership", self.node_id));
            }
            Ok(false) => {}
            Err(err) => crate::logger::warn("leader", &format!("acquire attempt failed: {err}")),
        }
    }

    async fn renew_or_relinquish(&self) {
        let Some(eval) = self.store.eval() else {
            // No Eval capability; nothing safe to do but hold the flag until
            // the next acquire cycle naturally re-evaluates it.
            return;
        };

        let result = eval
            .eval(
                RENEW_SCRIPT,
                &[LEADER_KEY.to_string()],
                &[self.node_id.clone(), LEADER_TTL.as_secs().to_string()],
            )
            .await;

        match result {
            Ok(Some(v)) if v != "0" => {}
            Ok(_) => {
                self.is_leader.store(false, Ordering::SeqCst);
                crate::logger::warn("leader", &format!("node {} lost leadership on renewal", self.node_id));
            }
            Err(err) => crate::logger::warn("leader", &format!("renewal failed: {err}")),
        }
    }

    /// Best-effort release on graceful shutdown so another node doesn't wait
    /// out the full TTL.
    pub async fn release(&self) {
        if !self.is_leader() || self.store.is_local() {
            return;
        }
        if let Some(eval) = self.store.eval() {
            let _ = eval
                .eval(RELEASE_SCRIPT, &[LEADER_KEY.to_string()], &[self.node_id.clone()])
                .await;
        }
        self.is_leader.store(false, Ordering::SeqCst);
    }

    /// Acquires `cluster:initializing`, runs `work`, then releases it
    /// (§4.9). Returns immediately if the store is local (no coordination
    /// needed for a single process).
    pub async fn with_init_lock<F, Fut>(&self, work: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        if self.store.is_local() {
            return work().await;
        }

        if self.store.set_nx(INIT_KEY, &self.node_id, INIT_TTL).await? {
            let result = work().await;
            let _ = self.store.delete(INIT_KEY).await;
            return result;
        }

        self.wait_for_initialization_complete().await
    }

    /// Followers poll every 2s until the init lock clears, bounded by
    /// TTL + 1 minute (§4.9).
    async fn wait_for_initialization_complete(&self) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + INIT_TTL + Duration::from_secs(60);
        loop {
            if !self.store.exists(INIT_KEY).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("timed out waiting for cluster initialization to complete");
            }
            tokio::time::sleep(INIT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::local_store::LocalStore;

    #[test]
    fn local_store_is_leader_unconditionally() {
        let store: Arc<dyn Store> = Arc::new(LocalStore::new());
        let leader = Leader::new(store, false);
        assert!(leader.is_leader());
    }

    #[test]
    fn is_slave_never_leads_even_on_local_store() {
        let store: Arc<dyn Store> = Arc::new(LocalStore::new());
        let leader = Leader::new(store, true);
        assert!(!leader.is_leader());
    }
}
