use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use taskloop_contracts::{DlqEntry, DlqStatus, TaskEnvelope, TaskError};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Captures terminally-failed envelopes; supports discard and re-enqueue
/// (§4.5). `retry` never reuses the original `task_id` — the caller
/// (`taskloop-service`) is responsible for republishing the returned
/// envelope through the broker.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn record(&self, envelope: &TaskEnvelope, error_type: &str, error_message: &str) -> Result<(), TaskError>;

    async fn list(&self, limit: i64, offset: i64, status: Option<DlqStatus>) -> (Vec<DlqEntry>, i64);

    async fn get(&self, task_id: Uuid) -> Option<DlqEntry>;

    /// Returns a fresh envelope to republish and marks the prior entry
    /// `retried`. Labels and original args/kwargs are preserved.
    async fn retry(&self, task_id: Uuid) -> Result<TaskEnvelope, TaskError>;

    async fn discard(&self, task_id: Uuid, reason: Option<String>) -> Result<(), TaskError>;
}

/// In-process DLQ backing the in-memory broker path (tests, single-process
/// deployments); mirrors `InMemoryBroker`'s scope.
#[derive(Default)]
pub struct InMemoryDeadLetterQueue {
    entries: RwLock<HashMap<Uuid, DlqEntry>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryDeadLetterQueue {
    async fn record(&self, envelope: &TaskEnvelope, error_type: &str, error_message: &str) -> Result<(), TaskError> {
        let entry = DlqEntry {
            task_id: envelope.task_id,
            task_name: envelope.task_name.clone(),
            args: envelope.args.clone(),
            kwargs: envelope.kwargs.clone(),
            labels: envelope.labels.clone(),
            queue_name: envelope.queue_name.clone(),
            error_type: error_type.to_string(),
            error_message: error_message.to_string(),
            retry_count: envelope.retry_count,
            failed_at: Utc::now(),
            status: DlqStatus::Pending,
            discard_reason: None,
        };
        self.entries.write().await.insert(envelope.task_id, entry);
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64, status: Option<DlqStatus>) -> (Vec<DlqEntry>, i64) {
        let entries = self.entries.read().await;
        let mut matching: Vec<&DlqEntry> = entries
            .values()
            .filter(|e| status.map(|s| s == e.status).unwrap_or(true))
            .collect();
        matching.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        (page, total)
    }

    async fn get(&self, task_id: Uuid) -> Option<DlqEntry> {
        self.entries.read().await.get(&task_id).cloned()
    }

    async fn retry(&self, task_id: Uuid) -> Result<TaskEnvelope, TaskError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&task_id).ok_or(TaskError::DlqEntryNotFound(task_id))?;
        let fresh = TaskEnvelope {
            task_id: Uuid::new_v4(),
            task_name: entry.task_name.clone(),
            args: entry.args.clone(),
            kwargs: entry.kwargs.clone(),
            labels: entry.labels.clone(),
            retry_count: 0,
            max_retries: 0,
            queue_name: entry.queue_name.clone(),
            enqueued_at: Utc::now(),
        };
        entry.status = DlqStatus::Retried;
        Ok(fresh)
    }

    async fn discard(&self, task_id: Uuid, reason: Option<String>) -> Result<(), TaskError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&task_id).ok_or(TaskError::DlqEntryNotFound(task_id))?;
        entry.status = DlqStatus::Discarded;
        entry.discard_reason = reason;
        Ok(())
    }
}

/// Relational DLQ: one row per failed `task_id` in `dlq_entries`.
pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

impl PostgresDeadLetterQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dlq_entries (
                task_id UUID PRIMARY KEY,
                task_name TEXT NOT NULL,
                args JSONB NOT NULL,
                kwargs JSONB NOT NULL,
                labels JSONB NOT NULL,
                queue_name TEXT NOT NULL,
                error_type TEXT NOT NULL,
                error_message TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                discard_reason TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS dlq_entries_status_failed_idx ON dlq_entries (status, failed_at DESC)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<DlqEntry, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = status_str
        .parse::<DlqStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e))))?;
    Ok(DlqEntry {
        task_id: row.try_get("task_id")?,
        task_name: row.try_get("task_name")?,
        args: row.try_get::<sqlx::types::Json<_>, _>("args")?.0,
        kwargs: row.try_get::<sqlx::types::Json<_>, _>("kwargs")?.0,
        labels: row.try_get::<sqlx::types::Json<_>, _>("labels")?.0,
        queue_name: row.try_get("queue_name")?,
        error_type: row.try_get("error_type")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        failed_at: row.try_get("failed_at")?,
        status,
        discard_reason: row.try_get("discard_reason")?,
    })
}

#[async_trait]
impl DeadLetterQueue for PostgresDeadLetterQueue {
    async fn record(&self, envelope: &TaskEnvelope, error_type: &str, error_message: &str) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            INSERT INTO dlq_entries
                (task_id, task_name, args, kwargs, labels, queue_name, error_type, error_message, retry_count, failed_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now(), 'pending')
            ON CONFLICT (task_id) DO UPDATE SET
                error_type = EXCLUDED.error_type,
                error_message = EXCLUDED.error_message,
                failed_at = now(),
                status = 'pending'
            "#,
        )
        .bind(envelope.task_id)
        .bind(&envelope.task_name)
        .bind(sqlx::types::Json(&envelope.args))
        .bind(sqlx::types::Json(&envelope.kwargs))
        .bind(sqlx::types::Json(&envelope.labels))
        .bind(&envelope.queue_name)
        .bind(error_type)
        .bind(error_message)
        .bind(envelope.retry_count as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Internal(e.into()))?;
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64, status: Option<DlqStatus>) -> (Vec<DlqEntry>, i64) {
        let rows = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM dlq_entries WHERE status = $1 ORDER BY failed_at DESC LIMIT $2 OFFSET $3")
                    .bind(s.to_string())
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM dlq_entries ORDER BY failed_at DESC LIMIT $1 OFFSET $2")
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .unwrap_or_default();

        let total: i64 = match status {
            Some(s) => sqlx::query("SELECT COUNT(*) AS count FROM dlq_entries WHERE status = $1")
                .bind(s.to_string())
                .fetch_one(&self.pool)
                .await,
            None => sqlx::query("SELECT COUNT(*) AS count FROM dlq_entries").fetch_one(&self.pool).await,
        }
        .ok()
        .and_then(|r| r.try_get::<i64, _>("count").ok())
        .unwrap_or(0);

        (rows.iter().filter_map(|r| row_to_entry(r).ok()).collect(), total)
    }

    async fn get(&self, task_id: Uuid) -> Option<DlqEntry> {
        let row = sqlx::query("SELECT * FROM dlq_entries WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()?;
        row_to_entry(&row).ok()
    }

    async fn retry(&self, task_id: Uuid) -> Result<TaskEnvelope, TaskError> {
        let entry = self.get(task_id).await.ok_or(TaskError::DlqEntryNotFound(task_id))?;
        if entry.status != DlqStatus::Pending {
            return Err(TaskError::validation(format!("dlq entry {task_id} is not pending (status: {})", entry.status)));
        }
        sqlx::query("UPDATE dlq_entries SET status = 'retried' WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| TaskError::Internal(e.into()))?;

        Ok(TaskEnvelope {
            task_id: Uuid::new_v4(),
            task_name: entry.task_name,
            args: entry.args,
            kwargs: entry.kwargs,
            labels: entry.labels,
            retry_count: 0,
            max_retries: 0,
            queue_name: entry.queue_name,
            enqueued_at: Utc::now(),
        })
    }

    async fn discard(&self, task_id: Uuid, reason: Option<String>) -> Result<(), TaskError> {
        let result = sqlx::query("UPDATE dlq_entries SET status = 'discarded', discard_reason = $2 WHERE task_id = $1")
            .bind(task_id)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(|e| TaskError::Internal(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(TaskError::DlqEntryNotFound(task_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(task_name: &str) -> TaskEnvelope {
        TaskEnvelope {
            task_id: Uuid::new_v4(),
            task_name: task_name.to_string(),
            args: Vec::new(),
            kwargs: HashMap::new(),
            labels: HashMap::new(),
            retry_count: 3,
            max_retries: 3,
            queue_name: "default".to_string(),
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn record_then_get_round_trips() {
        let dlq = InMemoryDeadLetterQueue::new();
        let envelope = envelope("export_csv");
        dlq.record(&envelope, "fatal", "bad input").await.unwrap();

        let entry = dlq.get(envelope.task_id).await.unwrap();
        assert_eq!(entry.task_name, "export_csv");
        assert_eq!(entry.error_type, "fatal");
        assert_eq!(entry.status, DlqStatus::Pending);
    }

    #[tokio::test]
    async fn retry_mints_a_fresh_id_and_marks_retried() {
        let dlq = InMemoryDeadLetterQueue::new();
        let envelope = envelope("export_csv");
        dlq.record(&envelope, "fatal", "bad input").await.unwrap();

        let fresh = dlq.retry(envelope.task_id).await.unwrap();
        assert_ne!(fresh.task_id, envelope.task_id);
        assert_eq!(fresh.task_name, "export_csv");

        let entry = dlq.get(envelope.task_id).await.unwrap();
        assert_eq!(entry.status, DlqStatus::Retried);
    }

    #[tokio::test]
    async fn retry_unknown_entry_is_not_found() {
        let dlq = InMemoryDeadLetterQueue::new();
        let err = dlq.retry(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, TaskError::DlqEntryNotFound(_)));
    }

    #[tokio::test]
    async fn discard_records_the_reason() {
        let dlq = InMemoryDeadLetterQueue::new();
        let envelope = envelope("export_csv");
        dlq.record(&envelope, "fatal", "bad input").await.unwrap();

        dlq.discard(envelope.task_id, Some("operator request".to_string())).await.unwrap();
        let entry = dlq.get(envelope.task_id).await.unwrap();
        assert_eq!(entry.status, DlqStatus::Discarded);
        assert_eq!(entry.discard_reason.as_deref(), Some("operator request"));
    }

    #[tokio::test]
    async fn list_filters_by_status_and_pages() {
        let dlq = InMemoryDeadLetterQueue::new();
        for name in ["a", "b", "c"] {
            dlq.record(&envelope(name), "fatal", "bad input").await.unwrap();
        }
        let (page, total) = dlq.list(2, 0, None).await;
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);

        let (page, total) = dlq.list(10, 0, Some(DlqStatus::Retried)).await;
        assert_eq!(total, 0);
        assert!(page.is_empty());
    }
}
