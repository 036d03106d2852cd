//! Schema bootstrap, run once at startup before any manager reads the DB.
//!
//! Kept as plain idempotent DDL (`CREATE TABLE IF NOT EXISTS`) rather than a
//! numbered migration chain: the schema is small and stable, and this avoids
//! pulling in a separate migration-runner crate for five tables.

use sqlx::PgPool;

pub async fn run(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS groups (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            channel_type TEXT NOT NULL,
            sort INTEGER NOT NULL DEFAULT 0,
            test_model TEXT NOT NULL DEFAULT '',
            validation_endpoint TEXT,
            upstreams JSONB NOT NULL DEFAULT '[]',
            config JSONB NOT NULL DEFAULT '{}',
            proxy_keys TEXT NOT NULL DEFAULT '',
            param_overrides JSONB NOT NULL DEFAULT '{}',
            last_validated_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_keys (
            id BIGSERIAL PRIMARY KEY,
            group_id BIGINT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            key_value TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            failure_count INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (group_id, key_value)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_group_status ON api_keys(group_id, status)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS system_settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_logs (
            id BIGSERIAL PRIMARY KEY,
            group_id BIGINT,
            group_name TEXT,
            key_id BIGINT,
            is_stream BOOLEAN NOT NULL DEFAULT false,
            status_code INTEGER NOT NULL,
            model TEXT,
            duration_ms INTEGER NOT NULL,
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_logs_created_at ON request_logs(created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_logs_group ON request_logs(group_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS group_hourly_stats (
            group_id BIGINT NOT NULL,
            hour TIMESTAMPTZ NOT NULL,
            request_count BIGINT NOT NULL DEFAULT 0,
            success_count BIGINT NOT NULL DEFAULT 0,
            failure_count BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (group_id, hour)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
