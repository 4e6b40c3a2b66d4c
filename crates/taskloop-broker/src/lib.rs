// Broker abstraction (C2): submit/consume against a queue system, with
// connection lifecycle, prefetch, and ack/nack. Two transports ship behind
// one interface, selected at startup the same way `taskloop-worker`'s
// handler registry and `taskloop-tracker`'s backends are selected.

pub mod amqp;
pub mod config;
pub mod inmemory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use taskloop_contracts::{TaskEnvelope, TaskError};

pub use config::{BrokerConfig, BrokerKind};

/// Backoff schedule applied to `submit` on transient failures before
/// surfacing `TaskError::BrokerUnavailable` to the caller.
pub const SUBMIT_RETRY_SCHEDULE_MS: &[u64] = &[50, 200, 800, 2000];

/// A handle returned alongside each delivered envelope. Exactly one of
/// `ack`/`nack` must be called; an envelope neither acked nor nacked within
/// the broker's visibility window is redelivered.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> Result<(), TaskError>;
    async fn nack(&self, requeue: bool) -> Result<(), TaskError>;
}

pub type Delivery = (TaskEnvelope, Box<dyn AckHandle>);
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TaskError>>;

/// Submit/consume against a queue system. Implementations own their own
/// connection lifecycle; `startup`/`shutdown` are idempotent.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn startup(&self) -> Result<(), TaskError>;
    async fn shutdown(&self) -> Result<(), TaskError>;

    /// Enqueues durably. Retries transient errors per
    /// `SUBMIT_RETRY_SCHEDULE_MS` before failing with `BrokerUnavailable`.
    async fn submit(&self, envelope: TaskEnvelope) -> Result<(), TaskError>;

    /// Opens a cooperative delivery stream for `queue`. `prefetch` bounds
    /// the number of unacked deliveries in flight per consumer; prefetch=1
    /// yields FIFO-within-queue ordering.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, TaskError>;
}

/// Runs `op` with the shared submit backoff schedule, retrying only while
/// `is_transient` holds. Used by every `Broker::submit` implementation so
/// the retry/backoff policy lives in one place.
pub async fn submit_with_retry<F, Fut>(mut op: F, is_transient: impl Fn(&TaskError) -> bool) -> Result<(), TaskError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), TaskError>>,
{
    let mut last_err = None;
    for delay_ms in SUBMIT_RETRY_SCHEDULE_MS {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if is_transient(&e) => {
                tracing::warn!(delay_ms, error = %e, "submit failed, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(*delay_ms)).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    match op().await {
        Ok(()) => Ok(()),
        Err(e) => Err(last_err.unwrap_or(e)),
    }
}

/// Constructs the configured broker implementation.
pub async fn create_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>, TaskError> {
    match config.kind {
        BrokerKind::InMemory => Ok(Arc::new(inmemory::InMemoryBroker::new())),
        BrokerKind::Amqp => {
            let url = config
                .amqp_url
                .as_deref()
                .ok_or_else(|| TaskError::broker_unavailable("AMQP_URL not configured"))?;
            Ok(Arc::new(amqp::AmqpBroker::connect(url).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_inmemory() {
        std::env::remove_var("BROKER_KIND");
        let cfg = BrokerConfig::from_env();
        assert!(matches!(cfg.kind, BrokerKind::InMemory));
    }

    #[test]
    fn config_parses_amqp() {
        std::env::set_var("BROKER_KIND", "amqp");
        std::env::set_var("AMQP_URL", "amqp://localhost");
        let cfg = BrokerConfig::from_env();
        assert!(matches!(cfg.kind, BrokerKind::Amqp));
        std::env::remove_var("BROKER_KIND");
        std::env::remove_var("AMQP_URL");
    }
}
