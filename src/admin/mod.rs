//! Admin REST API (C10, §4.10): bearer-token-gated management surface over
//! groups, keys, settings, and request logs.
//!
//! Every handler is a thin delegate onto the manager that already owns the
//! relevant state (`GroupManager`, `KeyProvider`, `SettingsManager`,
//! `RequestLogStore`) — no business logic of its own lives here.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::groups::{GroupPatch, NewGroup};
use crate::db::request_logs::LogFilter;
use crate::error::{AppError, AppResult};
use crate::groups::Group;
use crate::state::AppState;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/groups/list", get(list_groups))
        .route("/groups", post(create_group))
        .route("/groups/:id", get(get_group).put(update_group).delete(delete_group))
        .route("/keys/import", post(import_keys))
        .route("/keys/delete", post(delete_keys))
        .route("/keys/restore", post(restore_keys))
        .route("/keys/test", post(test_keys))
        .route("/tasks/status", get(tasks_status))
        .route("/settings", get(get_settings).put(update_settings))
        .route("/logs", get(query_logs))
        .route("/logs/export", get(export_logs))
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

/// Bearer-token gate against `AppConfig::auth_key` (§6.5 `AUTH_KEY`). Distinct
/// from the per-group `proxy_keys` the proxy engine checks on `/proxy/*`.
async fn require_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    match token {
        Some(t) if t == state.cfg.auth_key => next.run(req).await,
        _ => AppError::Unauthorized("missing or invalid admin token".to_string()).into_response(),
    }
}

async fn list_groups(State(state): State<AppState>) -> Json<Vec<Arc<Group>>> {
    Json(state.groups.list_all())
}

async fn get_group(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<Json<Arc<Group>>> {
    Ok(Json(state.groups.get_group_by_id(id)?))
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
    display_name: String,
    #[serde(default)]
    description: String,
    channel_type: String,
    #[serde(default)]
    sort: i32,
    test_model: String,
    #[serde(default)]
    validation_endpoint: Option<String>,
    upstreams: Value,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    proxy_keys: String,
    #[serde(default)]
    param_overrides: Value,
}

async fn create_group(State(state): State<AppState>, Json(payload): Json<CreateGroupRequest>) -> AppResult<Json<Arc<Group>>> {
    let row = crate::db::groups::insert(
        &state.db,
        NewGroup {
            name: payload.name,
            display_name: payload.display_name,
            description: payload.description,
            channel_type: payload.channel_type,
            sort: payload.sort,
            test_model: payload.test_model,
            validation_endpoint: payload.validation_endpoint,
            upstreams: payload.upstreams,
            config: payload.config,
            proxy_keys: payload.proxy_keys,
            param_overrides: payload.param_overrides,
        },
    )
    .await?;

    state.groups.reload_group(row.id).await?;
    publish_best_effort(&state, crate::groups::CHANNEL_GROUP_CREATED, &row.id.to_string()).await;
    Ok(Json(state.groups.get_group_by_id(row.id)?))
}

#[derive(Debug, Deserialize, Default)]
struct UpdateGroupRequest {
    display_name: Option<String>,
    description: Option<String>,
    channel_type: Option<String>,
    sort: Option<i32>,
    test_model: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    validation_endpoint: Option<Option<String>>,
    upstreams: Option<Value>,
    config: Option<Value>,
    proxy_keys: Option<String>,
    param_overrides: Option<Value>,
}

/// Lets `validation_endpoint` distinguish "field omitted" from "set to null"
/// in a PUT patch, matching `GroupPatch`'s `Option<Option<String>>` shape.
fn deserialize_double_option<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateGroupRequest>,
) -> AppResult<Json<Arc<Group>>> {
    let updated = crate::db::groups::update(
        &state.db,
        id,
        GroupPatch {
            display_name: payload.display_name,
            description: payload.description,
            channel_type: payload.channel_type,
            sort: payload.sort,
            test_model: payload.test_model,
            validation_endpoint: payload.validation_endpoint,
            upstreams: payload.upstreams,
            config: payload.config,
            proxy_keys: payload.proxy_keys,
            param_overrides: payload.param_overrides,
        },
    )
    .await?;

    if updated.is_none() {
        return Err(AppError::NotFound(format!("group {id}")));
    }

    state.groups.reload_group(id).await?;
    state.channels.purge(id);
    publish_best_effort(&state, &format!("group:updated:{id}"), "").await;
    Ok(Json(state.groups.get_group_by_id(id)?))
}

async fn delete_group(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<StatusCode> {
    let key_rows = crate::db::keys::list_by_group(&state.db, id).await?;
    let key_ids: Vec<i64> = key_rows.iter().map(|k| k.id).collect();

    let deleted = crate::db::groups::delete(&state.db, id).await?;
    if !deleted {
        return Err(AppError::NotFound(format!("group {id}")));
    }

    state.keys.remove_keys_from_store(id, &key_ids).await?;
    state.groups.purge_group(id);
    state.channels.purge(id);
    publish_best_effort(&state, &format!("group:deleted:{id}"), "").await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ImportKeysRequest {
    group_id: i64,
    keys: Vec<String>,
}

async fn import_keys(State(state): State<AppState>, Json(payload): Json<ImportKeysRequest>) -> AppResult<Json<Value>> {
    let inserted = state.keys.add_keys(payload.group_id, payload.keys).await?;
    Ok(Json(serde_json::json!({ "inserted": inserted.len() })))
}

#[derive(Debug, Deserialize)]
struct KeyIdsRequest {
    group_id: i64,
    key_ids: Vec<i64>,
}

async fn delete_keys(State(state): State<AppState>, Json(payload): Json<KeyIdsRequest>) -> AppResult<Json<Value>> {
    let deleted = state.keys.remove_keys(payload.group_id, payload.key_ids).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted.len() })))
}

#[derive(Debug, Deserialize)]
struct RestoreKeysRequest {
    group_id: i64,
    #[serde(default)]
    key_ids: Option<Vec<i64>>,
}

async fn restore_keys(State(state): State<AppState>, Json(payload): Json<RestoreKeysRequest>) -> AppResult<Json<Value>> {
    let restored = state.keys.restore_keys(payload.group_id, payload.key_ids).await?;
    Ok(Json(serde_json::json!({ "restored": restored.len() })))
}

#[derive(Debug, Serialize)]
struct KeyTestResult {
    key_id: i64,
    ok: bool,
    message: Option<String>,
}

async fn test_keys(State(state): State<AppState>, Json(payload): Json<RestoreKeysRequest>) -> AppResult<Json<Vec<KeyTestResult>>> {
    let group = state.groups.get_group_by_id(payload.group_id)?;
    let (channel, base) = state
        .channels
        .get(&group)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let rows = match payload.key_ids {
        Some(ids) => {
            let all = crate::db::keys::list_by_group(&state.db, payload.group_id).await?;
            all.into_iter().filter(|r| ids.contains(&r.id)).collect()
        }
        None => crate::db::keys::list_by_group(&state.db, payload.group_id).await?,
    };

    let timeout = std::time::Duration::from_secs(state.settings.get_int("key_validation_timeout_seconds", 20) as u64);
    let mut results = Vec::with_capacity(rows.len());
    for row in rows {
        let outcome = tokio::time::timeout(timeout, channel.validate_key(&base.normal_client, &base, &row.key_value)).await;
        let (ok, message) = match outcome {
            Ok((ok, message)) => (ok, message),
            Err(_) => (false, Some("validation timed out".to_string())),
        };
        results.push(KeyTestResult { key_id: row.id, ok, message });
    }
    Ok(Json(results))
}

#[derive(Debug, Serialize)]
struct TasksStatus {
    is_leader: bool,
    group_count: usize,
    groups: Vec<GroupTaskStatus>,
}

#[derive(Debug, Serialize)]
struct GroupTaskStatus {
    group_id: i64,
    group_name: String,
    last_validated_at: Option<chrono::DateTime<chrono::Utc>>,
}

async fn tasks_status(State(state): State<AppState>) -> Json<TasksStatus> {
    let groups = state.groups.list_all();
    Json(TasksStatus {
        is_leader: state.leader.is_leader(),
        group_count: groups.len(),
        groups: groups
            .iter()
            .map(|g| GroupTaskStatus { group_id: g.id, group_name: g.name.clone(), last_validated_at: g.last_validated_at })
            .collect(),
    })
}

async fn get_settings(State(state): State<AppState>) -> Json<std::collections::HashMap<String, String>> {
    Json(state.settings.get_settings())
}

async fn update_settings(
    State(state): State<AppState>,
    Json(patch): Json<std::collections::HashMap<String, String>>,
) -> AppResult<Json<std::collections::HashMap<String, String>>> {
    state.settings.update_settings(patch).await?;
    state.groups.recompute_effective_configs();
    Ok(Json(state.settings.get_settings()))
}

#[derive(Debug, Deserialize, Default)]
struct LogQueryParams {
    group_id: Option<i64>,
    min_status: Option<i32>,
    max_status: Option<i32>,
    since: Option<chrono::DateTime<chrono::Utc>>,
    until: Option<chrono::DateTime<chrono::Utc>>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl From<LogQueryParams> for LogFilter {
    fn from(p: LogQueryParams) -> Self {
        LogFilter {
            group_id: p.group_id,
            min_status: p.min_status,
            max_status: p.max_status,
            since: p.since,
            until: p.until,
            limit: p.limit.unwrap_or(100).clamp(1, 1000),
            offset: p.offset.unwrap_or(0).max(0),
        }
    }
}

async fn query_logs(
    State(state): State<AppState>,
    Query(params): Query<LogQueryParams>,
) -> AppResult<Json<Vec<crate::db::request_logs::RequestLogRow>>> {
    Ok(Json(state.request_logs.query(&params.into()).await?))
}

async fn export_logs(State(state): State<AppState>, Query(params): Query<LogQueryParams>) -> AppResult<Response> {
    let mut filter: LogFilter = params.into();
    filter.limit = 10_000;
    let rows = state.request_logs.query(&filter).await?;
    let body = serde_json::to_vec(&rows).map_err(AppError::Json)?;

    axum::response::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_DISPOSITION, "attachment; filename=\"request_logs.json\"")
        .body(axum::body::Body::from(body))
        .map_err(|e| AppError::Internal(e.to_string()))
}

async fn publish_best_effort(state: &AppState, channel: &str, payload: &str) {
    if let Err(err) = state.store.publish(channel, payload).await {
        crate::logger::warn("admin", &format!("failed to publish {channel}: {err}"));
    }
}
