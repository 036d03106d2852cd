//! Relational persistence: `groups`, `api_keys`, `system_settings`,
//! `request_logs`, `group_hourly_stats` (§6.4). Reached through `DATABASE_DSN`.
//!
//! Row types here are the DB-shape counterparts of the domain types in
//! `groups`/`keys`/`settings`/`request_log`; those modules own validation and
//! cache synchronization, this module owns SQL only.

pub mod groups;
pub mod keys;
pub mod migrations;
pub mod request_logs;
pub mod settings;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::AppConfig;

pub async fn connect(cfg: &AppConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&cfg.database_dsn)
        .await?;
    Ok(pool)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupRow {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub channel_type: String,
    pub sort: i32,
    pub test_model: String,
    pub validation_endpoint: Option<String>,
    /// JSON array of `{url, weight}`.
    pub upstreams: serde_json::Value,
    /// Sparse per-group override map.
    pub config: serde_json::Value,
    pub proxy_keys: String,
    /// JSON object merged into outbound request bodies.
    pub param_overrides: serde_json::Value,
    pub last_validated_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub id: i64,
    pub group_id: i64,
    pub key_value: String,
    pub status: String,
    pub failure_count: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SystemSettingRow {
    pub key: String,
    pub value: String,
}
