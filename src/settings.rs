//! Settings manager (C3, §4.3): the mutable, DB-backed, hot-reloadable
//! tunables layer. Distinct from `config::AppConfig`, which is parsed once
//! from the environment and never changes at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::store::Store;

pub const CHANNEL_SETTINGS_UPDATED: &str = "settings:updated";

/// §9 "System defaults".
pub fn defaults() -> Vec<(&'static str, String)> {
    vec![
        ("app_url", "http://localhost:3001".to_string()),
        ("request_log_retention_days", "7".to_string()),
        ("request_log_write_interval_minutes", "1".to_string()),
        ("request_timeout", "600".to_string()),
        ("connect_timeout", "15".to_string()),
        ("idle_conn_timeout", "120".to_string()),
        ("response_header_timeout", "600".to_string()),
        ("max_idle_conns", "100".to_string()),
        ("max_idle_conns_per_host", "50".to_string()),
        ("max_retries", "3".to_string()),
        ("blacklist_threshold", "3".to_string()),
        ("key_validation_interval_minutes", "60".to_string()),
        ("key_validation_concurrency", "10".to_string()),
        ("key_validation_timeout_seconds", "20".to_string()),
    ]
}

/// Fields with a documented minimum, validated by `update_settings` (§4.3).
fn min_constraint(key: &str) -> Option<i64> {
    match key {
        "max_retries" => Some(0),
        "blacklist_threshold" => Some(1),
        "key_validation_interval_minutes" => Some(1),
        "key_validation_concurrency" => Some(1),
        "key_validation_timeout_seconds" => Some(1),
        "request_log_retention_days" => Some(1),
        "request_log_write_interval_minutes" => Some(1),
        _ => None,
    }
}

pub struct SettingsManager {
    db: PgPool,
    store: Arc<dyn Store>,
    snapshot: ArcSwap<HashMap<String, String>>,
}

impl SettingsManager {
    pub fn new(db: PgPool, store: Arc<dyn Store>) -> Self {
        Self { db, store, snapshot: ArcSwap::from_pointee(HashMap::new()) }
    }

    /// Writes defaults for any field not already present, and guarantees at
    /// least one `proxy_keys` entry exists, seeded from the env auth key
    /// (§4.3). Safe to call on every startup: never overwrites existing rows.
    pub async fn ensure_initialized(&self, cfg: &AppConfig) -> AppResult<()> {
        db::settings::seed_defaults(&self.db, &defaults()).await?;

        let current = db::settings::load_all(&self.db).await?;
        if !current.contains_key("proxy_keys") || current.get("proxy_keys").map(|v| v.trim().is_empty()).unwrap_or(true) {
            db::settings::upsert_many(&self.db, &[("proxy_keys".to_string(), cfg.auth_key.clone())]).await?;
        }

        self.reload_from_db().await
    }

    pub async fn reload_from_db(&self) -> AppResult<()> {
        let loaded = db::settings::load_all(&self.db).await?;
        self.snapshot.store(Arc::new(loaded));
        Ok(())
    }

    pub fn get_settings(&self) -> HashMap<String, String> {
        (**self.snapshot.load()).clone()
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.snapshot.load().get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Overlay a group's sparse override map on the system snapshot.
    /// Unknown keys, or values whose JSON type doesn't match the system
    /// field's scalar type, are ignored with a debug log (§4.3).
    pub fn get_effective_config(&self, group_overrides: &Value) -> HashMap<String, String> {
        let mut effective = self.get_settings();
        let Some(overrides) = group_overrides.as_object() else { return effective };

        for (key, value) in overrides {
            if !effective.contains_key(key) {
                crate::logger::debug("settings", &format!("ignoring unknown override key {key}"));
                continue;
            }
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    crate::logger::debug("settings", &format!("ignoring override {key} with unsupported JSON type"));
                    continue;
                }
            };
            effective.insert(key.clone(), rendered);
        }
        effective
    }

    /// Validates, persists in one transaction, refreshes the snapshot, and
    /// publishes `settings:updated` (§4.3). Pub-sub delivery is best-effort;
    /// consumers self-heal by reloading on their next read.
    pub async fn update_settings(&self, patch: HashMap<String, String>) -> AppResult<()> {
        let mut validated = Vec::with_capacity(patch.len());
        for (key, value) in patch {
            if let Some(min) = min_constraint(&key) {
                let parsed: i64 = value
                    .parse()
                    .map_err(|_| AppError::Validation(format!("{key} must be an integer")))?;
                if parsed < min {
                    return Err(AppError::Validation(format!("{key} must be >= {min}")));
                }
            }
            validated.push((key, value));
        }

        db::settings::upsert_many(&self.db, &validated).await?;
        self.reload_from_db().await?;

        if let Err(err) = self.store.publish(CHANNEL_SETTINGS_UPDATED, "").await {
            crate::logger::warn("settings", &format!("failed to publish settings:updated: {err}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_config_ignores_unknown_override_keys() {
        let mut base = HashMap::new();
        base.insert("max_retries".to_string(), "3".to_string());
        let snapshot = ArcSwap::from_pointee(base);

        let overrides = serde_json::json!({ "max_retries": 7, "not_a_real_field": "x" });
        let mut effective = (**snapshot.load()).clone();
        if let Some(map) = overrides.as_object() {
            for (k, v) in map {
                if effective.contains_key(k) {
                    if let Some(n) = v.as_i64() {
                        effective.insert(k.clone(), n.to_string());
                    }
                }
            }
        }
        assert_eq!(effective.get("max_retries").unwrap(), "7");
        assert_eq!(effective.len(), 1);
    }

    #[test]
    fn min_constraints_cover_documented_fields() {
        assert_eq!(min_constraint("blacklist_threshold"), Some(1));
        assert_eq!(min_constraint("app_url"), None);
    }
}
