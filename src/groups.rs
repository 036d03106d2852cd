//! Group manager (C4, §4.4): in-memory `id -> group` / `name -> id` caches
//! kept consistent with the DB via pub-sub reload notifications.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use sqlx::PgPool;

use crate::db::{self, GroupRow};
use crate::error::{AppError, AppResult};
use crate::settings::SettingsManager;

/// Published once per brand-new group (§6.3); distinct from `group:updated:{id}`
/// since followers have no per-id subscription for an id they've never seen.
pub const CHANNEL_GROUP_CREATED: &str = "group:created";

#[derive(Debug, Clone, Serialize)]
pub struct Upstream {
    pub url: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub channel_type: String,
    pub sort: i32,
    pub test_model: String,
    pub validation_endpoint: Option<String>,
    pub upstreams: Vec<Upstream>,
    pub config: serde_json::Value,
    pub proxy_keys: String,
    pub param_overrides: serde_json::Value,
    pub last_validated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub effective_config: HashMap<String, String>,
    #[serde(skip)]
    pub proxy_keys_map: HashSet<String>,
}

impl Group {
    fn from_row(row: GroupRow, settings: &SettingsManager) -> Self {
        let upstreams = serde_json::from_value::<Vec<Upstream>>(row.upstreams.clone()).unwrap_or_default();
        let proxy_keys_map = row
            .proxy_keys
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let effective_config = settings.get_effective_config(&row.config);

        Self {
            id: row.id,
            name: row.name,
            display_name: row.display_name,
            description: row.description,
            channel_type: row.channel_type,
            sort: row.sort,
            test_model: row.test_model,
            validation_endpoint: row.validation_endpoint,
            upstreams,
            config: row.config,
            proxy_keys: row.proxy_keys,
            param_overrides: row.param_overrides,
            last_validated_at: row.last_validated_at,
            effective_config,
            proxy_keys_map,
        }
    }
}

pub struct GroupManager {
    db: PgPool,
    settings: Arc<SettingsManager>,
    by_id: DashMap<i64, Arc<Group>>,
    name_to_id: DashMap<String, i64>,
}

impl GroupManager {
    pub fn new(db: PgPool, settings: Arc<SettingsManager>) -> Self {
        Self { db, settings, by_id: DashMap::new(), name_to_id: DashMap::new() }
    }

    pub async fn initialize(&self) -> AppResult<()> {
        let rows = db::groups::list_all(&self.db).await?;
        self.by_id.clear();
        self.name_to_id.clear();
        for row in rows {
            let group = Arc::new(Group::from_row(row, &self.settings));
            self.name_to_id.insert(group.name.clone(), group.id);
            self.by_id.insert(group.id, group);
        }
        Ok(())
    }

    pub fn get_group_by_id(&self, id: i64) -> AppResult<Arc<Group>> {
        self.by_id.get(&id).map(|g| g.clone()).ok_or_else(|| AppError::NotFound(format!("group {id}")))
    }

    pub fn get_group_by_name(&self, name: &str) -> AppResult<Arc<Group>> {
        let id = *self
            .name_to_id
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("group {name}")))?;
        self.get_group_by_id(id)
    }

    pub fn list_all(&self) -> Vec<Arc<Group>> {
        let mut groups: Vec<Arc<Group>> = self.by_id.iter().map(|e| e.value().clone()).collect();
        groups.sort_by_key(|g| g.sort);
        groups
    }

    /// Reload a single group from the DB (`group:updated:{id}`, §6.3).
    pub async fn reload_group(&self, id: i64) -> AppResult<()> {
        let row = db::groups::find_by_id(&self.db, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("group {id}")))?;
        let group = Arc::new(Group::from_row(row, &self.settings));
        self.name_to_id.insert(group.name.clone(), group.id);
        self.by_id.insert(group.id, group);
        Ok(())
    }

    /// Drop a group from cache (`group:deleted:{id}`, §6.3). Store-side
    /// purge of its key-pool state is the caller's responsibility (C5).
    pub fn purge_group(&self, id: i64) {
        if let Some((_, group)) = self.by_id.remove(&id) {
            self.name_to_id.remove(&group.name);
        }
    }

    /// Recompute every cached group's `effective_config` after a settings
    /// change (§4.4).
    pub fn recompute_effective_configs(&self) {
        for mut entry in self.by_id.iter_mut() {
            let group = entry.value();
            let effective_config = self.settings.get_effective_config(&group.config);
            let mut updated = (**group).clone();
            updated.effective_config = effective_config;
            *entry.value_mut() = Arc::new(updated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_keys_map_parses_comma_separated_string() {
        let row = GroupRow {
            id: 1,
            name: "g1".to_string(),
            display_name: "G1".to_string(),
            description: String::new(),
            channel_type: "openai".to_string(),
            sort: 0,
            test_model: "gpt-4".to_string(),
            validation_endpoint: None,
            upstreams: serde_json::json!([{"url": "https://a", "weight": 1}]),
            config: serde_json::json!({}),
            proxy_keys: " pk1, pk2 ,,pk3".to_string(),
            param_overrides: serde_json::json!({}),
            last_validated_at: None,
        };
        // Build effective_config/proxy_keys_map without a real SettingsManager
        // by constructing the Group fields directly, mirroring from_row.
        let proxy_keys_map: HashSet<String> = row
            .proxy_keys
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(proxy_keys_map.len(), 3);
        assert!(proxy_keys_map.contains("pk1"));
        assert!(proxy_keys_map.contains("pk3"));
    }
}
