//! SQL for `request_logs` and `group_hourly_stats` (§4.11, C11).

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct RequestLogRow {
    pub id: i64,
    pub group_id: Option<i64>,
    pub group_name: Option<String>,
    pub key_id: Option<i64>,
    pub is_stream: bool,
    pub status_code: i32,
    pub model: Option<String>,
    pub duration_ms: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct NewRequestLog {
    pub group_id: Option<i64>,
    pub group_name: Option<String>,
    pub key_id: Option<i64>,
    pub is_stream: bool,
    pub status_code: i32,
    pub model: Option<String>,
    pub duration_ms: i32,
    pub error_message: Option<String>,
}

/// Inserts the log row and upserts its `group_hourly_stats` bucket in one
/// transaction, as required by §4.11.
pub async fn record(pool: &PgPool, entry: NewRequestLog) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO request_logs
            (group_id, group_name, key_id, is_stream, status_code, model, duration_ms, error_message)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.group_id)
    .bind(&entry.group_name)
    .bind(entry.key_id)
    .bind(entry.is_stream)
    .bind(entry.status_code)
    .bind(&entry.model)
    .bind(entry.duration_ms)
    .bind(&entry.error_message)
    .execute(&mut *tx)
    .await?;

    if let Some(group_id) = entry.group_id {
        let success = entry.status_code < 400;
        sqlx::query(
            r#"
            INSERT INTO group_hourly_stats (group_id, hour, request_count, success_count, failure_count)
            VALUES ($1, date_trunc('hour', now()), 1, $2, $3)
            ON CONFLICT (group_id, hour) DO UPDATE SET
                request_count = group_hourly_stats.request_count + 1,
                success_count = group_hourly_stats.success_count + $2,
                failure_count = group_hourly_stats.failure_count + $3
            "#,
        )
        .bind(group_id)
        .bind(if success { 1i64 } else { 0 })
        .bind(if success { 0i64 } else { 1 })
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

#[derive(Debug, Default)]
pub struct LogFilter {
    pub group_id: Option<i64>,
    pub min_status: Option<i32>,
    pub max_status: Option<i32>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn query(pool: &PgPool, filter: &LogFilter) -> sqlx::Result<Vec<RequestLogRow>> {
    let mut qb = sqlx::QueryBuilder::new("SELECT * FROM request_logs WHERE 1=1");
    if let Some(group_id) = filter.group_id {
        qb.push(" AND group_id = ").push_bind(group_id);
    }
    if let Some(min) = filter.min_status {
        qb.push(" AND status_code >= ").push_bind(min);
    }
    if let Some(max) = filter.max_status {
        qb.push(" AND status_code <= ").push_bind(max);
    }
    if let Some(since) = filter.since {
        qb.push(" AND created_at >= ").push_bind(since);
    }
    if let Some(until) = filter.until {
        qb.push(" AND created_at <= ").push_bind(until);
    }
    qb.push(" ORDER BY created_at DESC LIMIT ").push_bind(filter.limit);
    qb.push(" OFFSET ").push_bind(filter.offset);

    qb.build_query_as::<RequestLogRow>().fetch_all(pool).await
}

pub async fn delete_older_than(pool: &PgPool, cutoff: DateTime<Utc>) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM request_logs WHERE created_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn count(pool: &PgPool) -> sqlx::Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS c FROM request_logs").fetch_one(pool).await?;
    row.try_get("c")
}
