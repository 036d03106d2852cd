//! Multi-tenant reverse proxy and key-pool manager for upstream chat-completion
//! APIs (OpenAI-compatible, Gemini, Anthropic).
//!
//! `run` wires up configuration, the database pool, the shared store, every
//! manager, and the HTTP listener, then blocks until a shutdown signal is
//! observed. See `server::app` for the route table.

pub mod admin;
pub mod channels;
pub mod config;
pub mod cron;
pub mod db;
pub mod error;
pub mod groups;
pub mod http_client;
pub mod keys;
pub mod leader;
pub mod logger;
pub mod proxy;
pub mod request_log;
pub mod server;
pub mod settings;
pub mod state;
pub mod store;
pub mod worker_pool;

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;

use crate::settings::CHANNEL_SETTINGS_UPDATED;
use crate::state::{AppState, ShutdownToken};
use crate::worker_pool::WorkerPool;

const WORKER_POOL_LANES: usize = 16;
const WORKER_POOL_LANE_DEPTH: usize = 256;

/// Builds every manager and background task and serves until shutdown.
pub async fn run(cfg: config::AppConfig) -> anyhow::Result<()> {
    logger::init(&cfg)?;
    logger::info("app", "starting relay-gateway");

    std::panic::set_hook(Box::new(|panic_info| {
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        logger::error("panic", &format!("panic: {message} at {location}"));
    }));

    let db_pool = db::connect(&cfg).await?;
    db::migrations::run(&db_pool).await?;

    let store: Arc<dyn store::Store> = if let Some(redis_dsn) = cfg.redis_dsn.clone() {
        Arc::new(store::redis_store::RedisStore::connect(&redis_dsn).await?)
    } else {
        Arc::new(store::local_store::LocalStore::new())
    };

    let http_clients = Arc::new(http_client::ClientManager::new());
    let settings_mgr = Arc::new(settings::SettingsManager::new(db_pool.clone(), store.clone()));
    let group_mgr = Arc::new(groups::GroupManager::new(db_pool.clone(), settings_mgr.clone()));
    let channel_factory = Arc::new(channels::ChannelFactory::new(http_clients.clone()));
    let key_provider = Arc::new(keys::KeyProvider::new(db_pool.clone(), store.clone()));
    let request_logs = Arc::new(request_log::RequestLogStore::new(db_pool.clone()));
    let leader = leader::Leader::new(store.clone(), cfg.is_slave);
    let workers = WorkerPool::new(WORKER_POOL_LANES, WORKER_POOL_LANE_DEPTH);

    let shutdown = ShutdownToken::new();
    leader.spawn_renewal_task(shutdown.clone());

    // Settings + group-cache + key-pool bootstrap must run once per cluster,
    // not once per node (§4.9 "cluster:initializing"). On a single local
    // store this lock is a no-op and every node just runs it directly.
    {
        let settings_mgr = settings_mgr.clone();
        let group_mgr = group_mgr.clone();
        let key_provider = key_provider.clone();
        let cfg_for_init = cfg.clone();
        leader
            .with_init_lock(move || async move {
                settings_mgr.ensure_initialized(&cfg_for_init).await?;
                group_mgr.initialize().await?;
                key_provider.load_keys_from_db().await?;
                Ok(())
            })
            .await?;
    }

    let state = AppState {
        cfg: Arc::new(cfg.clone()),
        db: db_pool,
        store: store.clone(),
        http_clients,
        settings: settings_mgr,
        groups: group_mgr,
        channels: channel_factory,
        keys: key_provider,
        request_logs,
        leader,
        workers,
    };

    spawn_settings_reload_listener(state.clone(), shutdown.clone());
    spawn_group_reload_listener(state.clone(), shutdown.clone());

    cron::spawn(state.clone(), shutdown.clone());
    request_log::spawn_retention_sweep(state.db.clone(), state.settings.clone(), state.leader.clone(), shutdown.clone());

    let app = server::app(state.clone());
    let addr = format!("{}:{}", state.cfg.host, state.cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    logger::info("app", &format!("listening on {addr}"));

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                wait_for_shutdown_signal().await;
                shutdown.cancel();
            }
        })
        .await?;

    state.leader.release().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    logger::info("app", "shutdown complete");
    Ok(())
}

/// Reloads the settings snapshot (and every group's `effective_config`) on
/// `settings:updated` (§6.3). At-most-once delivery: a dropped notification
/// self-heals on the next write that does arrive, or the next restart.
fn spawn_settings_reload_listener(state: AppState, shutdown: ShutdownToken) {
    tokio::spawn(async move {
        let mut sub = match state.store.subscribe(CHANNEL_SETTINGS_UPDATED).await {
            Ok(sub) => sub,
            Err(err) => {
                logger::warn("app", &format!("failed to subscribe to settings:updated: {err}"));
                return;
            }
        };
        loop {
            tokio::select! {
                msg = sub.recv() => {
                    match msg {
                        Some(_) => {
                            if let Err(err) = state.settings.reload_from_db().await {
                                logger::warn("app", &format!("settings reload failed: {err}"));
                                continue;
                            }
                            state.groups.recompute_effective_configs();
                        }
                        None => return,
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    });
}

/// Subscribes to the per-group update/delete channels for every group known
/// at startup, plus the fixed `group:created` channel for groups that don't
/// exist yet: the store has no wildcard subscription, so a follower can't
/// listen on `group:updated:{id}` for an id it has never seen. `group:created`
/// closes that gap by carrying the new id as its payload.
fn spawn_group_reload_listener(state: AppState, shutdown: ShutdownToken) {
    for group in state.groups.list_all() {
        spawn_single_group_listener(state.clone(), shutdown.clone(), group.id);
    }

    tokio::spawn(async move {
        let mut sub = match state.store.subscribe(groups::CHANNEL_GROUP_CREATED).await {
            Ok(sub) => sub,
            Err(err) => {
                logger::warn("app", &format!("failed to subscribe to group:created: {err}"));
                return;
            }
        };
        loop {
            tokio::select! {
                msg = sub.recv() => {
                    match msg {
                        Some(msg) => {
                            let Ok(group_id) = msg.payload.parse::<i64>() else { continue };
                            if let Err(err) = state.groups.reload_group(group_id).await {
                                logger::warn("app", &format!("new group {group_id} reload failed: {err}"));
                                continue;
                            }
                            spawn_single_group_listener(state.clone(), shutdown.clone(), group_id);
                        }
                        None => return,
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    });
}

fn spawn_single_group_listener(state: AppState, shutdown: ShutdownToken, group_id: i64) {
    tokio::spawn(async move {
        let updated_channel = format!("group:updated:{group_id}");
        let deleted_channel = format!("group:deleted:{group_id}");

        let mut updated = match state.store.subscribe(&updated_channel).await {
            Ok(sub) => sub,
            Err(err) => {
                logger::warn("app", &format!("failed to subscribe to {updated_channel}: {err}"));
                return;
            }
        };
        let mut deleted = match state.store.subscribe(&deleted_channel).await {
            Ok(sub) => sub,
            Err(err) => {
                logger::warn("app", &format!("failed to subscribe to {deleted_channel}: {err}"));
                return;
            }
        };

        loop {
            tokio::select! {
                msg = updated.recv() => {
                    match msg {
                        Some(_) => {
                            if let Err(err) = state.groups.reload_group(group_id).await {
                                logger::warn("app", &format!("group {group_id} reload failed: {err}"));
                            } else {
                                state.channels.purge(group_id);
                            }
                        }
                        None => return,
                    }
                }
                msg = deleted.recv() => {
                    match msg {
                        Some(_) => {
                            state.groups.purge_group(group_id);
                            state.channels.purge(group_id);
                            return;
                        }
                        None => return,
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    });
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    logger::info("app", "shutdown signal received");
}
