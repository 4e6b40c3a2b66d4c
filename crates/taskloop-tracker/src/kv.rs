use crate::{duration_ms, ExecutionTracker, TaskStartEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use taskloop_contracts::{ExecutionRecord, HistoryFilters, TaskStats, TaskStatus};
use uuid::Uuid;

/// KV-indexed tracker (§4.3). Key layout:
/// - `{prefix}:exec:{task_id}` — hash of scalar + JSON-encoded composite fields.
/// - `{prefix}:running:{task_id}` — short-TTL marker.
/// - `{prefix}:index:all` / `:index:name:{name}` / `:index:status:{status}` — sorted sets, score = created_at epoch.
pub struct RedisTracker {
    conn: ConnectionManager,
    prefix: String,
    ttl_seconds: i64,
    running_ttl_seconds: i64,
    connected: Arc<AtomicBool>,
}

impl RedisTracker {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>, ttl_seconds: i64, running_ttl_seconds: i64) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            ttl_seconds,
            running_ttl_seconds,
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    fn exec_key(&self, task_id: Uuid) -> String {
        format!("{}:exec:{}", self.prefix, task_id)
    }

    fn running_key(&self, task_id: Uuid) -> String {
        format!("{}:running:{}", self.prefix, task_id)
    }

    fn index_all_key(&self) -> String {
        format!("{}:index:all", self.prefix)
    }

    fn index_name_key(&self, task_name: &str) -> String {
        format!("{}:index:name:{}", self.prefix, task_name)
    }

    fn index_status_key(&self, status: TaskStatus) -> String {
        format!("{}:index:status:{}", self.prefix, status)
    }

    async fn fetch_record(&self, task_id: Uuid) -> Option<ExecutionRecord> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.exec_key(task_id)).await.ok()?;
        if fields.is_empty() {
            return None;
        }
        record_from_fields(task_id, &fields)
    }
}

/// `ZREVRANGE`/`ZREVRANGE WITHSCORES` break ties between equal scores by
/// member in reverse-lexicographic order; the relational backend orders
/// history `created_at DESC, task_id ASC`. Re-sorting the fetched page in
/// Rust keeps both backends returning the same order for same-second
/// submissions (§4.3 ordering, §8 scenario 6 parity).
fn sort_desc_score_asc_id(mut pairs: Vec<(String, f64)>) -> Vec<String> {
    pairs.sort_by(|(id_a, score_a), (id_b, score_b)| {
        score_b.partial_cmp(score_a).unwrap_or(std::cmp::Ordering::Equal).then_with(|| id_a.cmp(id_b))
    });
    pairs.into_iter().map(|(id, _)| id).collect()
}

fn opt_json<T: serde::Serialize>(v: &Option<T>) -> String {
    v.as_ref().map(|v| serde_json::to_string(v).unwrap_or_default()).unwrap_or_default()
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> Option<T> {
    if s.is_empty() {
        None
    } else {
        serde_json::from_str(s).ok()
    }
}

fn record_to_fields(record: &ExecutionRecord) -> Vec<(String, String)> {
    vec![
        ("task_id".into(), record.task_id.to_string()),
        ("task_name".into(), record.task_name.clone()),
        ("status".into(), record.status.to_string()),
        ("created_at".into(), record.created_at.to_rfc3339()),
        ("started_at".into(), record.started_at.map(|t| t.to_rfc3339()).unwrap_or_default()),
        ("finished_at".into(), record.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default()),
        ("duration_ms".into(), record.duration_ms.map(|d| d.to_string()).unwrap_or_default()),
        ("worker_id".into(), record.worker_id.clone().unwrap_or_default()),
        ("queue_name".into(), record.queue_name.clone().unwrap_or_default()),
        ("retry_count".into(), record.retry_count.to_string()),
        ("max_retries".into(), record.max_retries.to_string()),
        ("return_value".into(), opt_json(&record.return_value)),
        ("error_type".into(), record.error_type.clone().unwrap_or_default()),
        ("error_message".into(), record.error_message.clone().unwrap_or_default()),
        ("error_traceback".into(), record.error_traceback.clone().unwrap_or_default()),
        ("task_args".into(), opt_json(&record.task_args)),
        ("task_kwargs".into(), opt_json(&record.task_kwargs)),
        ("labels".into(), opt_json(&record.labels)),
        ("progress".into(), opt_json(&record.progress)),
    ]
}

fn record_from_fields(task_id: Uuid, f: &HashMap<String, String>) -> Option<ExecutionRecord> {
    let get = |k: &str| f.get(k).cloned().unwrap_or_default();
    let status: TaskStatus = get("status").parse().ok()?;
    let parse_ts = |s: String| -> Option<DateTime<Utc>> {
        if s.is_empty() {
            None
        } else {
            DateTime::parse_from_rfc3339(&s).ok().map(|t| t.with_timezone(&Utc))
        }
    };
    Some(ExecutionRecord {
        task_id,
        task_name: get("task_name"),
        status,
        created_at: parse_ts(get("created_at")).unwrap_or_else(Utc::now),
        started_at: parse_ts(get("started_at")),
        finished_at: parse_ts(get("finished_at")),
        duration_ms: get("duration_ms").parse().ok(),
        worker_id: Some(get("worker_id")).filter(|s| !s.is_empty()),
        queue_name: Some(get("queue_name")).filter(|s| !s.is_empty()),
        retry_count: get("retry_count").parse().unwrap_or(0),
        max_retries: get("max_retries").parse().unwrap_or(0),
        return_value: parse_json::<Value>(&get("return_value")),
        error_type: Some(get("error_type")).filter(|s| !s.is_empty()),
        error_message: Some(get("error_message")).filter(|s| !s.is_empty()),
        error_traceback: Some(get("error_traceback")).filter(|s| !s.is_empty()),
        task_args: parse_json(&get("task_args")),
        task_kwargs: parse_json(&get("task_kwargs")),
        labels: parse_json(&get("labels")),
        progress: parse_json(&get("progress")),
    })
}

#[async_trait]
impl ExecutionTracker for RedisTracker {
    async fn connect(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
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
        if self.fetch_record(record.task_id).await.is_some() {
            return;
        }
        let mut conn = self.conn.clone();
        let exec_key = self.exec_key(record.task_id);
        let score = record.created_at.timestamp() as f64;

        let mut pipe = redis::pipe();
        pipe.hset_multiple(&exec_key, &record_to_fields(&record))
            .ignore()
            .expire(&exec_key, self.ttl_seconds)
            .ignore()
            .zadd(self.index_all_key(), record.task_id.to_string(), score)
            .ignore()
            .zadd(self.index_name_key(&record.task_name), record.task_id.to_string(), score)
            .ignore()
            .zadd(self.index_status_key(TaskStatus::Pending), record.task_id.to_string(), score)
            .ignore();

        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
            tracing::warn!(task_id = %record.task_id, error = %e, "failed to record pending task");
        }
    }

    async fn on_task_start(&self, task_id: Uuid, task_name: &str, event: TaskStartEvent) {
        if !self.is_connected() {
            return;
        }
        let existing = self.fetch_record(task_id).await;
        if let Some(existing) = &existing {
            // A redelivery of a task whose previous attempt ended in `failure`
            // with retries remaining is a new attempt, not a revert: the
            // tracker stores only the latest attempt (§4.3 concurrency &
            // races). `success`/`cancelled` — or `failure` with retries
            // exhausted — are never reopened.
            let reopenable = existing.status == TaskStatus::Failure && event.retry_count < event.max_retries;
            if existing.status.is_terminal() && !reopenable {
                // MAY update worker/queue so operators can see where a
                // cancelled-but-already-running task executed, but MUST NOT
                // revert status.
                let mut conn = self.conn.clone();
                let exec_key = self.exec_key(task_id);
                let _: redis::RedisResult<()> = redis::pipe()
                    .hset(&exec_key, "worker_id", event.worker_id.clone().unwrap_or_default())
                    .hset(&exec_key, "queue_name", event.queue_name.clone().unwrap_or_default())
                    .expire(&exec_key, self.ttl_seconds)
                    .query_async(&mut conn)
                    .await;
                return;
            }
        }

        let now = Utc::now();
        let record = ExecutionRecord {
            task_id,
            task_name: task_name.to_string(),
            status: TaskStatus::Running,
            created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
            started_at: Some(now),
            finished_at: None,
            duration_ms: None,
            worker_id: event.worker_id,
            queue_name: event.queue_name,
            retry_count: event.retry_count,
            max_retries: event.max_retries,
            return_value: None,
            error_type: None,
            error_message: None,
            error_traceback: None,
            task_args: event.args,
            task_kwargs: event.kwargs,
            labels: event.labels,
            progress: None,
        };

        let mut conn = self.conn.clone();
        let exec_key = self.exec_key(task_id);
        let running_key = self.running_key(task_id);
        let score = now.timestamp() as f64;

        let mut pipe = redis::pipe();
        pipe.hset_multiple(&exec_key, &record_to_fields(&record))
            .ignore()
            .expire(&exec_key, self.ttl_seconds)
            .ignore()
            .set_ex(&running_key, now.to_rfc3339(), self.running_ttl_seconds as u64)
            .ignore()
            .zadd(self.index_all_key(), task_id.to_string(), score)
            .ignore()
            .zadd(self.index_name_key(task_name), task_id.to_string(), score)
            .ignore()
            .zrem(
                self.index_status_key(existing.as_ref().map(|e| e.status).unwrap_or(TaskStatus::Pending)),
                task_id.to_string(),
            )
            .ignore()
            .zadd(self.index_status_key(TaskStatus::Running), task_id.to_string(), score)
            .ignore();

        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
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
        duration_ms_val: i64,
    ) {
        if !self.is_connected() {
            return;
        }
        let Some(existing) = self.fetch_record(task_id).await else {
            tracing::warn!(task_id = %task_id, "task execution record not found on finish");
            return;
        };
        if existing.status.is_terminal() {
            // Already success/failure/cancelled: last writer does not win.
            return;
        }
        if !existing.status.can_transition_to(status) {
            tracing::warn!(task_id = %task_id, from = %existing.status, to = %status, "rejected invalid tracker transition");
            return;
        }

        let now = Utc::now();
        let mut conn = self.conn.clone();
        let exec_key = self.exec_key(task_id);
        let score = now.timestamp() as f64;

        let mut pipe = redis::pipe();
        pipe.hset(&exec_key, "status", status.to_string())
            .ignore()
            .hset(&exec_key, "finished_at", now.to_rfc3339())
            .ignore()
            .hset(&exec_key, "duration_ms", duration_ms_val.to_string())
            .ignore()
            .hset(&exec_key, "return_value", opt_json(&return_value))
            .ignore()
            .hset(&exec_key, "error_type", error_type.unwrap_or_default())
            .ignore()
            .hset(&exec_key, "error_message", error_message.unwrap_or_default())
            .ignore()
            .hset(&exec_key, "error_traceback", error_traceback.unwrap_or_default())
            .ignore()
            .expire(&exec_key, self.ttl_seconds)
            .ignore()
            .del(self.running_key(task_id))
            .ignore()
            .zrem(self.index_status_key(TaskStatus::Running), task_id.to_string())
            .ignore()
            .zadd(self.index_status_key(status), task_id.to_string(), score)
            .ignore();

        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to record task finish");
        }
    }

    async fn cancel_task(&self, task_id: Uuid) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(existing) = self.fetch_record(task_id).await else {
            return false;
        };
        if !matches!(existing.status, TaskStatus::Pending | TaskStatus::Running) {
            return false;
        }

        let now = Utc::now();
        let mut conn = self.conn.clone();
        let exec_key = self.exec_key(task_id);
        let score = now.timestamp() as f64;

        let mut pipe = redis::pipe();
        pipe.hset(&exec_key, "status", TaskStatus::Cancelled.to_string())
            .ignore()
            .hset(&exec_key, "finished_at", now.to_rfc3339())
            .ignore();
        if existing.status == TaskStatus::Running {
            pipe.zrem(self.index_status_key(TaskStatus::Running), task_id.to_string())
                .ignore()
                .del(self.running_key(task_id))
                .ignore();
        } else {
            pipe.zrem(self.index_status_key(TaskStatus::Pending), task_id.to_string()).ignore();
        }
        pipe.zadd(self.index_status_key(TaskStatus::Cancelled), task_id.to_string(), score)
            .ignore();

        match pipe.query_async::<_, ()>(&mut conn).await {
            Ok(()) => true,
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
        let mut conn = self.conn.clone();
        let ids: Vec<String> = match conn
            .zrevrange(self.index_status_key(TaskStatus::Running), 0, -1)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "failed to get running tasks");
                return Vec::new();
            }
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(task_id) = id.parse::<Uuid>() {
                if let Some(record) = self.fetch_record(task_id).await {
                    out.push(record);
                }
            }
        }
        out
    }

    async fn get_task_history(&self, filters: &HistoryFilters, limit: i64, offset: i64) -> Vec<ExecutionRecord> {
        if !self.is_connected() {
            return Vec::new();
        }
        // Most selective index in preference order: name > status > all.
        let index_key = if let Some(name) = &filters.task_name {
            self.index_name_key(name)
        } else if let Some(status) = filters.status {
            self.index_status_key(status)
        } else {
            self.index_all_key()
        };

        let fetch_limit = if filters.has_secondary_filters() {
            (offset + limit) * 3
        } else {
            offset + limit
        };

        let mut conn = self.conn.clone();
        let ids: Vec<String> = match conn.zrevrange_withscores(&index_key, 0, (fetch_limit - 1).max(0)).await {
            Ok(ids_scores) => sort_desc_score_asc_id(ids_scores),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read tracker index");
                return Vec::new();
            }
        };

        let mut matched = Vec::new();
        let mut skipped = 0i64;
        for id in ids {
            let Ok(task_id) = id.parse::<Uuid>() else { continue };
            let Some(record) = self.fetch_record(task_id).await else { continue };
            if !filters.matches(&record) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            matched.push(record);
            if matched.len() as i64 >= limit {
                break;
            }
        }
        matched
    }

    async fn count_task_history(&self, filters: &HistoryFilters) -> i64 {
        if !self.is_connected() {
            return 0;
        }
        let index_key = if let Some(name) = &filters.task_name {
            self.index_name_key(name)
        } else if let Some(status) = filters.status {
            self.index_status_key(status)
        } else {
            self.index_all_key()
        };
        let mut conn = self.conn.clone();
        let ids: Vec<String> = match conn.zrevrange(&index_key, 0, -1).await {
            Ok(ids) => ids,
            Err(_) => return 0,
        };
        // Order doesn't affect the count; tie-break correction only matters
        // to `get_task_history`'s page contents.
        let mut count = 0i64;
        for id in ids {
            let Ok(task_id) = id.parse::<Uuid>() else { continue };
            if let Some(record) = self.fetch_record(task_id).await {
                if filters.matches(&record) {
                    count += 1;
                }
            }
        }
        count
    }

    async fn get_task_details(&self, task_id: Uuid) -> Option<ExecutionRecord> {
        if !self.is_connected() {
            return None;
        }
        self.fetch_record(task_id).await
    }

    async fn get_stats(&self, window_hours: i64) -> TaskStats {
        if !self.is_connected() {
            return empty_stats();
        }
        let mut conn = self.conn.clone();
        let cutoff = (Utc::now() - chrono::Duration::hours(window_hours)).timestamp() as f64;

        // `index:all` is scored by created_at, so a reverse range bounded below
        // by the cutoff gives exactly the window without a full-table scan.
        let ids: Vec<String> = match conn.zrangebyscore(self.index_all_key(), cutoff, "+inf").await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read tracker index for stats");
                return empty_stats();
            }
        };

        let mut success_count = 0i64;
        let mut failure_count = 0i64;
        let mut running_count = 0i64;
        let mut cancelled_count = 0i64;
        let mut pending_count = 0i64;
        let mut by_task_name: HashMap<String, i64> = HashMap::new();
        let mut durations = Vec::new();

        for id in &ids {
            let Ok(task_id) = id.parse::<Uuid>() else { continue };
            let Some(record) = self.fetch_record(task_id).await else { continue };
            match record.status {
                TaskStatus::Success => {
                    success_count += 1;
                    if let Some(d) = record.duration_ms {
                        durations.push(d);
                    }
                }
                TaskStatus::Failure => failure_count += 1,
                TaskStatus::Running => running_count += 1,
                TaskStatus::Cancelled => cancelled_count += 1,
                TaskStatus::Pending => pending_count += 1,
            }
            *by_task_name.entry(record.task_name).or_insert(0) += 1;
        }

        let avg_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
        };

        TaskStats {
            total_count: ids.len() as i64,
            success_count,
            failure_count,
            running_count,
            cancelled_count,
            pending_count,
            avg_duration_ms,
            by_task_name,
        }
    }
}

fn empty_stats() -> TaskStats {
    TaskStats {
        total_count: 0,
        success_count: 0,
        failure_count: 0,
        running_count: 0,
        cancelled_count: 0,
        pending_count: 0,
        avg_duration_ms: None,
        by_task_name: HashMap::new(),
    }
}

pub use duration_ms as compute_duration_ms;

#[cfg(test)]
mod tests {
    use super::sort_desc_score_asc_id;

    #[test]
    fn orders_by_score_descending() {
        let pairs = vec![("a".to_string(), 1.0), ("b".to_string(), 3.0), ("c".to_string(), 2.0)];
        assert_eq!(sort_desc_score_asc_id(pairs), vec!["b", "c", "a"]);
    }

    #[test]
    fn breaks_ties_by_id_ascending_to_match_the_relational_backend() {
        let pairs = vec![
            ("zzz".to_string(), 5.0),
            ("aaa".to_string(), 5.0),
            ("mmm".to_string(), 5.0),
        ];
        assert_eq!(sort_desc_score_asc_id(pairs), vec!["aaa", "mmm", "zzz"]);
    }

    #[test]
    fn ties_only_affect_members_with_equal_scores() {
        let pairs = vec![("b".to_string(), 2.0), ("a".to_string(), 2.0), ("z".to_string(), 1.0)];
        assert_eq!(sort_desc_score_asc_id(pairs), vec!["a", "b", "z"]);
    }
}
