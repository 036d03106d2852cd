//! Cron validator (C8, §4.8): master-only periodic revalidation of keys
//! marked invalid.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::db;
use crate::state::{AppState, ShutdownToken};

const TICK_INTERVAL: Duration = Duration::from_secs(300);

pub fn spawn(state: AppState, shutdown: ShutdownToken) {
    tokio::spawn(async move {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            if state.leader.is_leader() {
                if let Err(err) = run_once(&state, &shutdown).await {
                    crate::logger::error("cron", &format!("validator pass failed: {err}"));
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    });
}

async fn run_once(state: &AppState, shutdown: &ShutdownToken) -> anyhow::Result<()> {
    let interval_minutes = state.settings.get_int("key_validation_interval_minutes", 60);
    let concurrency = state.settings.get_int("key_validation_concurrency", 10).max(1) as usize;
    let timeout_secs = state.settings.get_int("key_validation_timeout_seconds", 20).max(1) as u64;
    let blacklist_threshold = state.settings.get_int("blacklist_threshold", 3) as i32;

    for group in state.groups.list_all() {
        let due = match group.last_validated_at {
            None => true,
            Some(last) => Utc::now() - last >= chrono::Duration::minutes(interval_minutes),
        };
        if !due {
            continue;
        }

        let invalid_keys = match db::keys::list_invalid_by_group(&state.db, group.id).await {
            Ok(keys) => keys,
            Err(err) => {
                crate::logger::error("cron", &format!("failed to load invalid keys for group {}: {err}", group.id));
                continue;
            }
        };

        if invalid_keys.is_empty() {
            let _ = db::groups::touch_last_validated(&state.db, group.id, Utc::now()).await;
            continue;
        }

        let Ok((channel, base)) = state.channels.get(&group) else {
            crate::logger::warn("cron", &format!("no channel for group {} ({})", group.id, group.channel_type));
            continue;
        };

        let (tx, mut rx) = mpsc::channel(invalid_keys.len().max(1));
        for key in invalid_keys {
            let _ = tx.send(key).await;
        }
        drop(tx);

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let rx = rx.clone();
            let channel = channel.clone();
            let base = base.clone();
            let keys = state.keys.clone();
            let client = base.normal_client.clone();
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        return;
                    }
                    let key = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(key) = key else { return };

                    let validation = tokio::time::timeout(
                        Duration::from_secs(timeout_secs),
                        channel.validate_key(&client, &base, &key.key_value),
                    )
                    .await;

                    let (ok, _message) = match validation {
                        Ok(result) => result,
                        Err(_) => (false, Some("validation timed out".to_string())),
                    };

                    if let Err(err) = keys.update_status(key.id, key.group_id, ok, blacklist_threshold).await {
                        crate::logger::warn("cron", &format!("update_status failed for key {}: {err}", key.id));
                    }
                }
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }

        if let Err(err) = db::groups::touch_last_validated(&state.db, group.id, Utc::now()).await {
            crate::logger::error("cron", &format!("failed to update last_validated_at for group {}: {err}", group.id));
        }
    }

    Ok(())
}
