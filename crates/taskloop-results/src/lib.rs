// Result backend (C3): stores serialized return values and progress keyed
// by task_id, independent of the tracker row. Two implementations behind
// one interface, same split as the tracker (C4).

pub mod postgres;
pub mod redis_backend;

use async_trait::async_trait;
use taskloop_contracts::{ProgressEntry, ResultEntry, TaskError};
use uuid::Uuid;

pub use postgres::PostgresResultBackend;
pub use redis_backend::RedisResultBackend;

/// TTL applied to a result/progress entry, in seconds. `None` means the
/// backend default (no expiry for the relational backend; the configured
/// default for the KV backend).
pub type TtlSeconds = Option<i64>;

#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Overwrites any existing entry for `task_id`.
    async fn set_result(&self, task_id: Uuid, entry: ResultEntry, ttl: TtlSeconds) -> Result<(), TaskError>;

    /// Reads the result. When `keep` is false, deletes atomically with the
    /// read (read-and-delete) so a consuming client cannot observe it twice.
    async fn get_result(&self, task_id: Uuid, keep: bool) -> Result<ResultEntry, TaskError>;

    async fn is_ready(&self, task_id: Uuid) -> Result<bool, TaskError>;

    async fn set_progress(&self, task_id: Uuid, entry: ProgressEntry, ttl: TtlSeconds) -> Result<(), TaskError>;

    async fn get_progress(&self, task_id: Uuid) -> Result<Option<ProgressEntry>, TaskError>;
}
