//! Bounded worker pool (§9) for off-hot-path work: `KeyProvider::update_status`
//! calls and request-log writes (§4.7, §4.11). Bounded rather than spawning
//! an unbounded task per call, which would be a latent overload risk.
//!
//! Jobs are hashed onto a fixed number of lanes by `(group_id, key_id)` so
//! updates to the same key serialize locally, reducing DB row-lock
//! contention without changing correctness — `KeyProvider` itself is still
//! safe under arbitrary interleaving.

use std::sync::Arc;

use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() -> futures_util::future::BoxFuture<'static, ()> + Send>;

struct Lane {
    tx: mpsc::Sender<Job>,
}

pub struct WorkerPool {
    lanes: Vec<Lane>,
}

impl WorkerPool {
    /// `lanes` independent bounded queues, each drained by its own task.
    /// `depth` bounds per-lane backlog; on saturation a submission is
    /// dropped and logged (§4.7's "bounded means... the update is dropped").
    pub fn new(lanes: usize, depth: usize) -> Arc<Self> {
        let lanes = lanes.max(1);
        let mut built = Vec::with_capacity(lanes);
        for _ in 0..lanes {
            let (tx, mut rx) = mpsc::channel::<Job>(depth);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job().await;
                }
            });
            built.push(Lane { tx });
        }
        Arc::new(Self { lanes: built })
    }

    /// Submits `fut` on the lane selected by `hash_key`. Returns `false` if
    /// the lane's queue was full (submission dropped).
    pub fn submit<F>(&self, hash_key: i64, fut: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let lane = &self.lanes[(hash_key.unsigned_abs() as usize) % self.lanes.len()];
        let job: Job = Box::new(move || Box::pin(fut));
        match lane.tx.try_send(job) {
            Ok(()) => true,
            Err(_) => {
                crate::logger::warn("worker_pool", "lane saturated; dropping background job");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn submitted_jobs_run() {
        let pool = WorkerPool::new(4, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let counter = counter.clone();
            pool.submit(i, async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn same_key_lands_on_same_lane() {
        let pool = WorkerPool::new(4, 16);
        let lane_a = (5i64).unsigned_abs() as usize % pool.lanes.len();
        let lane_b = (5i64).unsigned_abs() as usize % pool.lanes.len();
        assert_eq!(lane_a, lane_b);
    }
}
