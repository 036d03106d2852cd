//! SQL for the flat `system_settings` key/value table.

use sqlx::PgPool;
use std::collections::HashMap;

use super::SystemSettingRow;

pub async fn load_all(pool: &PgPool) -> sqlx::Result<HashMap<String, String>> {
    let rows = sqlx::query_as::<_, SystemSettingRow>("SELECT key, value FROM system_settings")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|r| (r.key, r.value)).collect())
}

/// Inserts a default for every field not already present; never overwrites
/// an existing row (§4.3 `EnsureSettingsInitialized`).
pub async fn seed_defaults(pool: &PgPool, defaults: &[(&str, String)]) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;
    for (key, value) in defaults {
        sqlx::query(
            "INSERT INTO system_settings (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
        )
        .bind(*key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn upsert_many(pool: &PgPool, patch: &[(String, String)]) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;
    for (key, value) in patch {
        sqlx::query(
            r#"
            INSERT INTO system_settings (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}
