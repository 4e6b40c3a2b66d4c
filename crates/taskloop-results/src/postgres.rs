use crate::{ResultBackend, TtlSeconds};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use taskloop_contracts::{ProgressEntry, ResultEntry, TaskError};
use uuid::Uuid;

/// Relational result backend: one table keyed by `task_id`, with a JSONB
/// column for the tagged result and timestamp columns for TTL sweeps
/// (§4.2). `expires_at` is advisory; nothing deletes on read unless
/// `keep=false`, matching the KV backend's read-and-delete semantics.
pub struct PostgresResultBackend {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    task_id: Uuid,
    entry: sqlx::types::Json<ResultEntry>,
    #[allow(dead_code)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    #[allow(dead_code)]
    task_id: Uuid,
    entry: sqlx::types::Json<ProgressEntry>,
}

impl PostgresResultBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, TaskError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| TaskError::tracker_unavailable(format!("postgres connect failed: {e}")))?;
        Ok(Self { pool })
    }

    /// Creates `task_results`/`task_progress` if absent. The corpus this
    /// was grounded on has no migration tooling checked in; DDL is issued
    /// directly the way `sqlx` examples without a `migrations/` directory
    /// typically bootstrap a fresh database.
    pub async fn ensure_schema(&self) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_results (
                task_id UUID PRIMARY KEY,
                entry JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                expires_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Internal(e.into()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_progress (
                task_id UUID PRIMARY KEY,
                entry JSONB NOT NULL,
                expires_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Internal(e.into()))?;

        Ok(())
    }
}

#[async_trait]
impl ResultBackend for PostgresResultBackend {
    async fn set_result(&self, task_id: Uuid, entry: ResultEntry, ttl: TtlSeconds) -> Result<(), TaskError> {
        let expires_at = ttl.map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        sqlx::query(
            r#"
            INSERT INTO task_results (task_id, entry, recorded_at, expires_at)
            VALUES ($1, $2, now(), $3)
            ON CONFLICT (task_id) DO UPDATE SET entry = $2, recorded_at = now(), expires_at = $3
            "#,
        )
        .bind(task_id)
        .bind(sqlx::types::Json(&entry))
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Internal(e.into()))?;
        Ok(())
    }

    async fn get_result(&self, task_id: Uuid, keep: bool) -> Result<ResultEntry, TaskError> {
        let row = sqlx::query_as::<_, ResultRow>(
            "SELECT task_id, entry, expires_at FROM task_results WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TaskError::Internal(e.into()))?
        .ok_or(TaskError::ResultMissing(task_id))?;

        if !keep {
            sqlx::query("DELETE FROM task_results WHERE task_id = $1")
                .bind(task_id)
                .execute(&self.pool)
                .await
                .map_err(|e| TaskError::Internal(e.into()))?;
        }

        Ok(row.entry.0)
    }

    async fn is_ready(&self, task_id: Uuid) -> Result<bool, TaskError> {
        let exists: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM task_results WHERE task_id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| TaskError::Internal(e.into()))?;
        Ok(exists.is_some())
    }

    async fn set_progress(&self, task_id: Uuid, entry: ProgressEntry, ttl: TtlSeconds) -> Result<(), TaskError> {
        let expires_at = ttl.map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        sqlx::query(
            r#"
            INSERT INTO task_progress (task_id, entry, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (task_id) DO UPDATE SET entry = $2, expires_at = $3
            "#,
        )
        .bind(task_id)
        .bind(sqlx::types::Json(&entry))
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Internal(e.into()))?;
        Ok(())
    }

    async fn get_progress(&self, task_id: Uuid) -> Result<Option<ProgressEntry>, TaskError> {
        let row = sqlx::query_as::<_, ProgressRow>(
            "SELECT task_id, entry FROM task_progress WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TaskError::Internal(e.into()))?;
        Ok(row.map(|r| r.entry.0))
    }
}
