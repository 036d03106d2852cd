//! Request log store (C11, §4.11): thin service wrapper over `db::request_logs`
//! plus the master-only retention sweep task.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::db::request_logs::{self, LogFilter, NewRequestLog, RequestLogRow};
use crate::error::AppResult;
use crate::leader::Leader;
use crate::state::ShutdownToken;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct RequestLogStore {
    db: PgPool,
}

impl RequestLogStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn record(&self, entry: NewRequestLog) -> AppResult<()> {
        request_logs::record(&self.db, entry).await?;
        Ok(())
    }

    pub async fn query(&self, filter: &LogFilter) -> AppResult<Vec<RequestLogRow>> {
        Ok(request_logs::query(&self.db, filter).await?)
    }
}

/// Master-only periodic deletion of rows past `request_log_retention_days`
/// (§4.11). Runs on an hourly tick; the retention window itself comes from
/// the live settings snapshot so an admin change to the setting takes effect
/// without restart.
pub fn spawn_retention_sweep(
    db: PgPool,
    settings: Arc<crate::settings::SettingsManager>,
    leader: Arc<Leader>,
    shutdown: ShutdownToken,
) {
    tokio::spawn(async move {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            if !leader.is_leader() {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => { continue; }
                    _ = shutdown.cancelled() => return,
                }
            }
            let retention_days = settings.get_int("request_log_retention_days", 7).max(1);
            let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
            match request_logs::delete_older_than(&db, cutoff).await {
                Ok(deleted) if deleted > 0 => {
                    crate::logger::info("request_log", &format!("retention sweep deleted {deleted} rows"));
                }
                Ok(_) => {}
                Err(err) => crate::logger::error("request_log", &format!("retention sweep failed: {err}")),
            }

            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    });
}
