use crate::{ExecutionTracker, TaskStartEvent};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{PgPool, QueryBuilder, Row};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use taskloop_contracts::{ExecutionRecord, HistoryFilters, TaskStats, TaskStatus};
use uuid::Uuid;

/// Relational tracker: one row per attempt in `task_executions`, composite
/// indexes per §4.3 so history/stats queries don't degrade to sequential
/// scans under load.
pub struct PostgresTracker {
    pool: PgPool,
    connected: Arc<AtomicBool>,
}

impl PostgresTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, connected: Arc::new(AtomicBool::new(true)) }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Creates `task_executions` if absent, with the composite indexes the
    /// history/stats queries below rely on. No migration tooling is used;
    /// see `PostgresResultBackend::ensure_schema` for the same convention.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_executions (
                task_id UUID PRIMARY KEY,
                task_name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                duration_ms BIGINT,
                worker_id TEXT,
                queue_name TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,
                return_value JSONB,
                error_type TEXT,
                error_message TEXT,
                error_traceback TEXT,
                task_args JSONB,
                task_kwargs JSONB,
                labels JSONB,
                progress JSONB
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (name, ddl) in [
            ("task_executions_status_created_idx", "CREATE INDEX IF NOT EXISTS task_executions_status_created_idx ON task_executions (status, created_at DESC)"),
            ("task_executions_name_status_idx", "CREATE INDEX IF NOT EXISTS task_executions_name_status_idx ON task_executions (task_name, status)"),
            ("task_executions_worker_status_idx", "CREATE INDEX IF NOT EXISTS task_executions_worker_status_idx ON task_executions (worker_id, status)"),
            ("task_executions_created_idx", "CREATE INDEX IF NOT EXISTS task_executions_created_idx ON task_executions (created_at DESC)"),
        ] {
            sqlx::query(ddl).execute(&self.pool).await.map_err(|e| {
                anyhow::anyhow!("failed to create index {name}: {e}")
            })?;
        }

        Ok(())
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<ExecutionRecord, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = status_str
        .parse::<TaskStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e))))?;
    Ok(ExecutionRecord {
        task_id: row.try_get("task_id")?,
        task_name: row.try_get("task_name")?,
        status,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
        worker_id: row.try_get("worker_id")?,
        queue_name: row.try_get("queue_name")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        return_value: row.try_get::<Option<sqlx::types::Json<Value>>, _>("return_value")?.map(|j| j.0),
        error_type: row.try_get("error_type")?,
        error_message: row.try_get("error_message")?,
        error_traceback: row.try_get("error_traceback")?,
        task_args: row
            .try_get::<Option<sqlx::types::Json<Vec<Value>>>, _>("task_args")?
            .map(|j| j.0),
        task_kwargs: row
            .try_get::<Option<sqlx::types::Json<HashMap<String, Value>>>, _>("task_kwargs")?
            .map(|j| j.0),
        labels: row
            .try_get::<Option<sqlx::types::Json<HashMap<String, Value>>>, _>("labels")?
            .map(|j| j.0),
        progress: row.try_get::<Option<sqlx::types::Json<Value>>, _>("progress")?.map(|j| j.0),
    })
}

/// Pushes `HistoryFilters` down into a `WHERE` clause, mirroring
/// `_build_history_conditions` in the source tracker.
fn push_filters<'a>(qb: &mut QueryBuilder<'a, sqlx::Postgres>, filters: &'a HistoryFilters) {
    let mut first = true;
    macro_rules! clause {
        () => {
            if first {
                qb.push(" WHERE ");
                first = false;
            } else {
                qb.push(" AND ");
            }
        };
    }

    if let Some(name) = &filters.task_name {
        clause!();
        qb.push("task_name = ").push_bind(name);
    }
    if let Some(pat) = &filters.task_name_like {
        clause!();
        qb.push("task_name ILIKE ").push_bind(format!("%{pat}%"));
    }
    if let Some(status) = filters.status {
        clause!();
        qb.push("status = ").push_bind(status.to_string());
    }
    if let Some(statuses) = &filters.statuses {
        clause!();
        let strs: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        qb.push("status = ANY(").push_bind(strs).push(")");
    }
    if let Some(worker_id) = &filters.worker_id {
        clause!();
        qb.push("worker_id = ").push_bind(worker_id);
    }
    if let Some(error_type) = &filters.error_type {
        clause!();
        qb.push("error_type = ").push_bind(error_type);
    }
    if let Some(after) = filters.created_after {
        clause!();
        qb.push("created_at >= ").push_bind(after);
    }
    if let Some(before) = filters.created_before {
        clause!();
        qb.push("created_at <= ").push_bind(before);
    }
    if let Some(min_ms) = filters.min_duration_ms {
        clause!();
        qb.push("duration_ms >= ").push_bind(min_ms);
    }
    if let Some(max_ms) = filters.max_duration_ms {
        clause!();
        qb.push("duration_ms <= ").push_bind(max_ms);
    }
}

#[async_trait]
impl ExecutionTracker for PostgresTracker {
    async fn connect(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn record_pending(&self, record: ExecutionRecord) {
        if !self.is_connected() {
            return;
        }
        let result = sqlx::query(
            r#"
            INSERT INTO task_executions
                (task_id, task_name, status, created_at, retry_count, max_retries, task_args, task_kwargs, labels)
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $8)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(record.task_id)
        .bind(&record.task_name)
        .bind(record.created_at)
        .bind(record.retry_count as i32)
        .bind(record.max_retries as i32)
        .bind(record.task_args.map(sqlx::types::Json))
        .bind(record.task_kwargs.map(sqlx::types::Json))
        .bind(record.labels.map(sqlx::types::Json))
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(task_id = %record.task_id, error = %e, "failed to record pending task");
        }
    }

    async fn on_task_start(&self, task_id: Uuid, task_name: &str, event: TaskStartEvent) {
        if !self.is_connected() {
            return;
        }
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO task_executions
                (task_id, task_name, status, created_at, started_at, worker_id, queue_name,
                 retry_count, max_retries, task_args, task_kwargs, labels)
            VALUES ($1, $2, 'running', $3, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (task_id) DO UPDATE SET
                worker_id = EXCLUDED.worker_id,
                queue_name = EXCLUDED.queue_name,
                -- A redelivery of a `failure` row with retries remaining is a
                -- new attempt, not a revert: the tracker stores only the
                -- latest attempt (§4.3). `success`/`cancelled`, and `failure`
                -- with retries exhausted, are never reopened.
                started_at = CASE WHEN task_executions.status IN ('pending', 'running')
                                        OR (task_executions.status = 'failure' AND task_executions.retry_count < task_executions.max_retries)
                                   THEN EXCLUDED.started_at ELSE task_executions.started_at END,
                status = CASE WHEN task_executions.status IN ('pending', 'running')
                                   OR (task_executions.status = 'failure' AND task_executions.retry_count < task_executions.max_retries)
                              THEN 'running' ELSE task_executions.status END,
                retry_count = CASE WHEN task_executions.status = 'failure' AND task_executions.retry_count < task_executions.max_retries
                                    THEN EXCLUDED.retry_count ELSE task_executions.retry_count END,
                finished_at = CASE WHEN task_executions.status = 'failure' AND task_executions.retry_count < task_executions.max_retries
                                    THEN NULL ELSE task_executions.finished_at END,
                duration_ms = CASE WHEN task_executions.status = 'failure' AND task_executions.retry_count < task_executions.max_retries
                                    THEN NULL ELSE task_executions.duration_ms END,
                return_value = CASE WHEN task_executions.status = 'failure' AND task_executions.retry_count < task_executions.max_retries
                                    THEN NULL ELSE task_executions.return_value END,
                error_type = CASE WHEN task_executions.status = 'failure' AND task_executions.retry_count < task_executions.max_retries
                                    THEN NULL ELSE task_executions.error_type END,
                error_message = CASE WHEN task_executions.status = 'failure' AND task_executions.retry_count < task_executions.max_retries
                                    THEN NULL ELSE task_executions.error_message END,
                error_traceback = CASE WHEN task_executions.status = 'failure' AND task_executions.retry_count < task_executions.max_retries
                                    THEN NULL ELSE task_executions.error_traceback END
            "#,
        )
        .bind(task_id)
        .bind(task_name)
        .bind(now)
        .bind(&event.worker_id)
        .bind(&event.queue_name)
        .bind(event.retry_count as i32)
        .bind(event.max_retries as i32)
        .bind(event.args.map(sqlx::types::Json))
        .bind(event.kwargs.map(sqlx::types::Json))
        .bind(event.labels.map(sqlx::types::Json))
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(task_id = %task_id, error = %e, "failed to record task start");
        }
    }

    async fn on_task_finish(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        return_value: Option<Value>,
        error_type: Option<String>,
        error_message: Option<String>,
        error_traceback: Option<String>,
        duration_ms: i64,
    ) {
        if !self.is_connected() {
            return;
        }
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE task_executions SET
                status = $2,
                finished_at = $3,
                duration_ms = $4,
                return_value = $5,
                error_type = $6,
                error_message = $7,
                error_traceback = $8
            WHERE task_id = $1
              AND status NOT IN ('success', 'failure', 'cancelled')
            "#,
        )
        .bind(task_id)
        .bind(status.to_string())
        .bind(now)
        .bind(duration_ms)
        .bind(return_value.map(sqlx::types::Json))
        .bind(&error_type)
        .bind(&error_message)
        .bind(&error_traceback)
        .execute(&self.pool)
        .await;

        match result {
            Ok(res) if res.rows_affected() == 0 => {
                tracing::warn!(task_id = %task_id, "task finish ignored: no matching non-terminal row");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(task_id = %task_id, error = %e, "failed to record task finish"),
        }
    }

    async fn cancel_task(&self, task_id: Uuid) -> bool {
        if !self.is_connected() {
            return false;
        }
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE task_executions SET status = 'cancelled', finished_at = $2
            WHERE task_id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(task_id)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(res) => res.rows_affected() > 0,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "failed to cancel task");
                false
            }
        }
    }

    async fn get_running_tasks(&self) -> Vec<ExecutionRecord> {
        if !self.is_connected() {
            return Vec::new();
        }
        let rows = sqlx::query("SELECT * FROM task_executions WHERE status = 'running' ORDER BY started_at DESC")
            .fetch_all(&self.pool)
            .await;
        match rows {
            Ok(rows) => rows.iter().filter_map(|r| row_to_record(r).ok()).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to get running tasks");
                Vec::new()
            }
        }
    }

    async fn get_task_history(&self, filters: &HistoryFilters, limit: i64, offset: i64) -> Vec<ExecutionRecord> {
        if !self.is_connected() {
            return Vec::new();
        }
        let mut qb = QueryBuilder::new("SELECT * FROM task_executions");
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY created_at DESC, task_id ASC LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);

        match qb.build().fetch_all(&self.pool).await {
            Ok(rows) => rows.iter().filter_map(|r| row_to_record(r).ok()).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to get task history");
                Vec::new()
            }
        }
    }

    async fn count_task_history(&self, filters: &HistoryFilters) -> i64 {
        if !self.is_connected() {
            return 0;
        }
        let mut qb = QueryBuilder::new("SELECT COUNT(*) AS count FROM task_executions");
        push_filters(&mut qb, filters);

        match qb.build().fetch_one(&self.pool).await {
            Ok(row) => row.try_get::<i64, _>("count").unwrap_or(0),
            Err(e) => {
                tracing::warn!(error = %e, "failed to count task history");
                0
            }
        }
    }

    async fn get_task_details(&self, task_id: Uuid) -> Option<ExecutionRecord> {
        if !self.is_connected() {
            return None;
        }
        let row = sqlx::query("SELECT * FROM task_executions WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()?;
        row_to_record(&row).ok()
    }

    async fn get_stats(&self, window_hours: i64) -> TaskStats {
        if !self.is_connected() {
            return TaskStats {
                total_count: 0,
                success_count: 0,
                failure_count: 0,
                running_count: 0,
                cancelled_count: 0,
                pending_count: 0,
                avg_duration_ms: None,
                by_task_name: HashMap::new(),
            };
        }
        let cutoff = Utc::now() - chrono::Duration::hours(window_hours);

        let counts = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count FROM task_executions
            WHERE created_at >= $1
            GROUP BY status
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();

        let mut by_status: HashMap<String, i64> = HashMap::new();
        for row in &counts {
            if let (Ok(status), Ok(count)) = (row.try_get::<String, _>("status"), row.try_get::<i64, _>("count")) {
                by_status.insert(status, count);
            }
        }

        let by_name_rows = sqlx::query(
            r#"
            SELECT task_name, COUNT(*) AS count FROM task_executions
            WHERE created_at >= $1
            GROUP BY task_name
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();

        let by_task_name = by_name_rows
            .iter()
            .filter_map(|r| {
                let name: String = r.try_get("task_name").ok()?;
                let count: i64 = r.try_get("count").ok()?;
                Some((name, count))
            })
            .collect();

        let avg_duration_ms: Option<f64> = sqlx::query(
            r#"
            SELECT AVG(duration_ms)::float8 AS avg FROM task_executions
            WHERE created_at >= $1 AND status = 'success' AND duration_ms IS NOT NULL
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .ok()
        .and_then(|row| row.try_get::<Option<f64>, _>("avg").ok().flatten());

        let total_count = by_status.values().sum();

        TaskStats {
            total_count,
            success_count: by_status.get("success").copied().unwrap_or(0),
            failure_count: by_status.get("failure").copied().unwrap_or(0),
            running_count: by_status.get("running").copied().unwrap_or(0),
            cancelled_count: by_status.get("cancelled").copied().unwrap_or(0),
            pending_count: by_status.get("pending").copied().unwrap_or(0),
            avg_duration_ms,
            by_task_name,
        }
    }
}
