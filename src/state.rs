//! Shared application state handed to every axum handler and background task.
//!
//! Grouping these `Arc`s in one `Clone`-able struct lets every handler and
//! background task reach the full manager set through a single extractor.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::watch;

use crate::channels::ChannelFactory;
use crate::config::AppConfig;
use crate::groups::GroupManager;
use crate::http_client::ClientManager;
use crate::keys::KeyProvider;
use crate::leader::Leader;
use crate::request_log::RequestLogStore;
use crate::settings::SettingsManager;
use crate::store::Store;
use crate::worker_pool::WorkerPool;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub db: PgPool,
    pub store: Arc<dyn Store>,
    pub http_clients: Arc<ClientManager>,
    pub settings: Arc<SettingsManager>,
    pub groups: Arc<GroupManager>,
    pub channels: Arc<ChannelFactory>,
    pub keys: Arc<KeyProvider>,
    pub request_logs: Arc<RequestLogStore>,
    pub leader: Arc<Leader>,
    pub workers: Arc<WorkerPool>,
}

/// Process-wide stop signal observed by every background task (cron
/// validator, retention sweep, leader renewal, pub-sub listeners).
#[derive(Clone)]
pub struct ShutdownToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called. Safe to await repeatedly and
    /// concurrently from multiple background tasks; `watch` remembers the
    /// latest value so this can never miss a cancellation.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}
