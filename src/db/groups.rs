//! SQL for the `groups` table.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use super::GroupRow;

pub async fn list_all(pool: &PgPool) -> sqlx::Result<Vec<GroupRow>> {
    sqlx::query_as::<_, GroupRow>("SELECT * FROM groups ORDER BY sort ASC, id ASC")
        .fetch_all(pool)
        .await
}

pub async fn find_by_id(pool: &PgPool, id: i64) -> sqlx::Result<Option<GroupRow>> {
    sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub struct NewGroup {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub channel_type: String,
    pub sort: i32,
    pub test_model: String,
    pub validation_endpoint: Option<String>,
    pub upstreams: Value,
    pub config: Value,
    pub proxy_keys: String,
    pub param_overrides: Value,
}

pub async fn insert(pool: &PgPool, g: NewGroup) -> sqlx::Result<GroupRow> {
    sqlx::query_as::<_, GroupRow>(
        r#"
        INSERT INTO groups
            (name, display_name, description, channel_type, sort, test_model,
             validation_endpoint, upstreams, config, proxy_keys, param_overrides)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING *
        "#,
    )
    .bind(g.name)
    .bind(g.display_name)
    .bind(g.description)
    .bind(g.channel_type)
    .bind(g.sort)
    .bind(g.test_model)
    .bind(g.validation_endpoint)
    .bind(g.upstreams)
    .bind(g.config)
    .bind(g.proxy_keys)
    .bind(g.param_overrides)
    .fetch_one(pool)
    .await
}

pub struct GroupPatch {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub channel_type: Option<String>,
    pub sort: Option<i32>,
    pub test_model: Option<String>,
    pub validation_endpoint: Option<Option<String>>,
    pub upstreams: Option<Value>,
    pub config: Option<Value>,
    pub proxy_keys: Option<String>,
    pub param_overrides: Option<Value>,
}

pub async fn update(pool: &PgPool, id: i64, patch: GroupPatch) -> sqlx::Result<Option<GroupRow>> {
    let current = match find_by_id(pool, id).await? {
        Some(g) => g,
        None => return Ok(None),
    };
    let row = sqlx::query_as::<_, GroupRow>(
        r#"
        UPDATE groups SET
            display_name = $1, description = $2, channel_type = $3, sort = $4,
            test_model = $5, validation_endpoint = $6, upstreams = $7,
            config = $8, proxy_keys = $9, param_overrides = $10
        WHERE id = $11
        RETURNING *
        "#,
    )
    .bind(patch.display_name.unwrap_or(current.display_name))
    .bind(patch.description.unwrap_or(current.description))
    .bind(patch.channel_type.unwrap_or(current.channel_type))
    .bind(patch.sort.unwrap_or(current.sort))
    .bind(patch.test_model.unwrap_or(current.test_model))
    .bind(patch.validation_endpoint.unwrap_or(current.validation_endpoint))
    .bind(patch.upstreams.unwrap_or(current.upstreams))
    .bind(patch.config.unwrap_or(current.config))
    .bind(patch.proxy_keys.unwrap_or(current.proxy_keys))
    .bind(patch.param_overrides.unwrap_or(current.param_overrides))
    .bind(id)
    .fetch_one(pool)
    .await?;
    Ok(Some(row))
}

pub async fn delete(pool: &PgPool, id: i64) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM groups WHERE id = $1").bind(id).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

pub async fn touch_last_validated(pool: &PgPool, id: i64, at: DateTime<Utc>) -> sqlx::Result<()> {
    sqlx::query("UPDATE groups SET last_validated_at = $1 WHERE id = $2")
        .bind(at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
