//! SQL for the `api_keys` table, including the row-locked transactions that
//! back `KeyProvider::update_status` (§4.5).

use sqlx::{PgPool, Postgres, Transaction};

use super::ApiKeyRow;

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_INVALID: &str = "invalid";

pub async fn list_by_group(pool: &PgPool, group_id: i64) -> sqlx::Result<Vec<ApiKeyRow>> {
    sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM api_keys WHERE group_id = $1 ORDER BY id ASC")
        .bind(group_id)
        .fetch_all(pool)
        .await
}

pub async fn list_active_by_group(pool: &PgPool, group_id: i64) -> sqlx::Result<Vec<ApiKeyRow>> {
    sqlx::query_as::<_, ApiKeyRow>(
        "SELECT * FROM api_keys WHERE group_id = $1 AND status = $2 ORDER BY id ASC",
    )
    .bind(group_id)
    .bind(STATUS_ACTIVE)
    .fetch_all(pool)
    .await
}

pub async fn list_invalid_by_group(pool: &PgPool, group_id: i64) -> sqlx::Result<Vec<ApiKeyRow>> {
    sqlx::query_as::<_, ApiKeyRow>(
        "SELECT * FROM api_keys WHERE group_id = $1 AND status = $2 ORDER BY id ASC",
    )
    .bind(group_id)
    .bind(STATUS_INVALID)
    .fetch_all(pool)
    .await
}

pub async fn list_all(pool: &PgPool) -> sqlx::Result<Vec<ApiKeyRow>> {
    sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM api_keys ORDER BY id ASC")
        .fetch_all(pool)
        .await
}

/// `SELECT ... FOR UPDATE` inside the caller's transaction — the row lock
/// that serializes concurrent `UpdateStatus` calls on the same key (§4.5, §5).
pub async fn lock_row(tx: &mut Transaction<'_, Postgres>, key_id: i64) -> sqlx::Result<Option<ApiKeyRow>> {
    sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM api_keys WHERE id = $1 FOR UPDATE")
        .bind(key_id)
        .fetch_optional(&mut **tx)
        .await
}

pub async fn set_status_and_failures(
    tx: &mut Transaction<'_, Postgres>,
    key_id: i64,
    status: &str,
    failure_count: i32,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE api_keys SET status = $1, failure_count = $2 WHERE id = $3")
        .bind(status)
        .bind(failure_count)
        .bind(key_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Deduplicates on `(group_id, key_value)` via `ON CONFLICT DO NOTHING`,
/// returning only the rows actually inserted.
pub async fn insert_many(
    pool: &PgPool,
    group_id: i64,
    values: &[String],
) -> sqlx::Result<Vec<ApiKeyRow>> {
    let mut tx = pool.begin().await?;
    let mut inserted = Vec::with_capacity(values.len());
    for value in values {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            r#"
            INSERT INTO api_keys (group_id, key_value, status, failure_count)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (group_id, key_value) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(group_id)
        .bind(value)
        .bind(STATUS_ACTIVE)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = row {
            inserted.push(row);
        }
    }
    tx.commit().await?;
    Ok(inserted)
}

pub async fn delete_many(pool: &PgPool, group_id: i64, key_ids: &[i64]) -> sqlx::Result<Vec<ApiKeyRow>> {
    let mut tx = pool.begin().await?;
    let mut deleted = Vec::with_capacity(key_ids.len());
    for id in key_ids {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            "DELETE FROM api_keys WHERE id = $1 AND group_id = $2 RETURNING *",
        )
        .bind(id)
        .bind(group_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = row {
            deleted.push(row);
        }
    }
    tx.commit().await?;
    Ok(deleted)
}

pub async fn delete_all_for_group(pool: &PgPool, group_id: i64) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM api_keys WHERE group_id = $1")
        .bind(group_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Restores every invalid key in a group (or a specified subset) to
/// `active, failure_count = 0`, returning the rows that changed.
pub async fn restore(pool: &PgPool, group_id: i64, key_ids: Option<&[i64]>) -> sqlx::Result<Vec<ApiKeyRow>> {
    let mut tx = pool.begin().await?;
    let rows = match key_ids {
        None => {
            sqlx::query_as::<_, ApiKeyRow>(
                r#"
                UPDATE api_keys SET status = $1, failure_count = 0
                WHERE group_id = $2 AND status = $3
                RETURNING *
                "#,
            )
            .bind(STATUS_ACTIVE)
            .bind(group_id)
            .bind(STATUS_INVALID)
            .fetch_all(&mut *tx)
            .await?
        }
        Some(ids) => {
            let mut changed = Vec::with_capacity(ids.len());
            for id in ids {
                let row = sqlx::query_as::<_, ApiKeyRow>(
                    r#"
                    UPDATE api_keys SET status = $1, failure_count = 0
                    WHERE id = $2 AND group_id = $3 AND status = $4
                    RETURNING *
                    "#,
                )
                .bind(STATUS_ACTIVE)
                .bind(id)
                .bind(group_id)
                .bind(STATUS_INVALID)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(row) = row {
                    changed.push(row);
                }
            }
            changed
        }
    };
    tx.commit().await?;
    Ok(rows)
}

pub async fn remove_invalid(pool: &PgPool, group_id: i64) -> sqlx::Result<Vec<ApiKeyRow>> {
    sqlx::query_as::<_, ApiKeyRow>(
        "DELETE FROM api_keys WHERE group_id = $1 AND status = $2 RETURNING *",
    )
    .bind(group_id)
    .bind(STATUS_INVALID)
    .fetch_all(pool)
    .await
}
