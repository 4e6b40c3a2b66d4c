use crate::{ResultBackend, TtlSeconds};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use taskloop_contracts::{ProgressEntry, ResultEntry, TaskError};
use uuid::Uuid;

const PROGRESS_KEY_SUFFIX: &str = ":progress";

/// KV result backend. Keys are `{prefix}:{task_id}` and
/// `{prefix}:{task_id}:progress`, matching §4.2. Uses a multiplexed
/// connection manager so every call shares one logical connection and
/// survives transient disconnects transparently.
pub struct RedisResultBackend {
    conn: ConnectionManager,
    prefix: String,
    keep_results: bool,
}

impl RedisResultBackend {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>, keep_results: bool) -> Result<Self, TaskError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| TaskError::tracker_unavailable(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| TaskError::tracker_unavailable(format!("redis connect failed: {e}")))?;
        Ok(Self { conn, prefix: prefix.into(), keep_results })
    }

    fn result_key(&self, task_id: Uuid) -> String {
        format!("{}:{}", self.prefix, task_id)
    }

    fn progress_key(&self, task_id: Uuid) -> String {
        format!("{}:{}{}", self.prefix, task_id, PROGRESS_KEY_SUFFIX)
    }
}

#[async_trait]
impl ResultBackend for RedisResultBackend {
    async fn set_result(&self, task_id: Uuid, entry: ResultEntry, ttl: TtlSeconds) -> Result<(), TaskError> {
        let value = serde_json::to_vec(&entry).map_err(|e| TaskError::Internal(e.into()))?;
        let mut conn = self.conn.clone();
        match ttl {
            Some(secs) if secs > 0 => {
                conn.set_ex::<_, _, ()>(self.result_key(task_id), value, secs as u64)
                    .await
            }
            _ => conn.set::<_, _, ()>(self.result_key(task_id), value).await,
        }
        .map_err(|e| TaskError::Internal(anyhow::anyhow!("redis set_result failed: {e}")))
    }

    async fn get_result(&self, task_id: Uuid, keep: bool) -> Result<ResultEntry, TaskError> {
        let mut conn = self.conn.clone();
        let key = self.result_key(task_id);
        let keep = keep || self.keep_results;

        let value: Option<Vec<u8>> = if keep {
            conn.get(&key).await
        } else {
            conn.get_del(&key).await
        }
        .map_err(|e| TaskError::Internal(anyhow::anyhow!("redis get_result failed: {e}")))?;

        let value = value.ok_or(TaskError::ResultMissing(task_id))?;
        serde_json::from_slice(&value).map_err(|e| TaskError::Internal(e.into()))
    }

    async fn is_ready(&self, task_id: Uuid) -> Result<bool, TaskError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(self.result_key(task_id))
            .await
            .map_err(|e| TaskError::Internal(anyhow::anyhow!("redis exists failed: {e}")))?;
        Ok(exists)
    }

    async fn set_progress(&self, task_id: Uuid, entry: ProgressEntry, ttl: TtlSeconds) -> Result<(), TaskError> {
        let value = serde_json::to_vec(&entry).map_err(|e| TaskError::Internal(e.into()))?;
        let mut conn = self.conn.clone();
        match ttl {
            Some(secs) if secs > 0 => {
                conn.set_ex::<_, _, ()>(self.progress_key(task_id), value, secs as u64)
                    .await
            }
            _ => conn.set::<_, _, ()>(self.progress_key(task_id), value).await,
        }
        .map_err(|e| TaskError::Internal(anyhow::anyhow!("redis set_progress failed: {e}")))
    }

    async fn get_progress(&self, task_id: Uuid) -> Result<Option<ProgressEntry>, TaskError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn
            .get(self.progress_key(task_id))
            .await
            .map_err(|e| TaskError::Internal(anyhow::anyhow!("redis get_progress failed: {e}")))?;
        value
            .map(|v| serde_json::from_slice(&v).map_err(|e| TaskError::Internal(e.into())))
            .transpose()
    }
}
