// Taskloop server binary: wires the broker, tracker, result backend, DLQ,
// worker loop, scheduler, and HTTP control plane together, mirroring
// `everruns-api::main`'s wiring (tracing init, env config, module-specific
// states, router assembly).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use taskloop_api::{build_router, AppState};
use taskloop_broker::{create_broker, BrokerConfig};
use taskloop_contracts::TaskName;
use taskloop_results::{PostgresResultBackend, RedisResultBackend, ResultBackend};
use taskloop_scheduler::Scheduler;
use taskloop_service::{ServiceConfig, TaskManagementService};
use taskloop_tracker::{ExecutionTracker, PostgresTracker, RedisTracker};
use taskloop_worker::dlq::{DeadLetterQueue, InMemoryDeadLetterQueue, PostgresDeadLetterQueue};
use taskloop_worker::{HandlerRegistry, TaskContext, TaskHandler, Worker, WorkerConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Placeholder handler registered for every predefined `TaskName`, since
/// concrete business logic is out of scope here (§1 Non-goals) but the
/// server still needs to be runnable and triggerable out of the box.
struct StubHandler {
    name: &'static str,
}

#[async_trait]
impl TaskHandler for StubHandler {
    async fn call(&self, ctx: TaskContext) -> Result<Value, taskloop_worker::HandlerError> {
        tracing::info!(task_name = self.name, task_id = %ctx.task_id, "stub handler invoked, no-op");
        Ok(Value::Null)
    }
}

fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for name in [
        TaskName::BackupDatabase,
        TaskName::CheckDueReminders,
        TaskName::WarmCache,
        TaskName::InvalidateCache,
        TaskName::ExportCsv,
        TaskName::ExportJson,
        TaskName::CleanupTempFiles,
        TaskName::CleanupOldBackups,
        TaskName::CleanupOldExports,
        TaskName::CleanupExpiredData,
        TaskName::RunAllCleanup,
    ] {
        registry.register(name.as_str(), Arc::new(StubHandler { name: name.as_str() }));
    }
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "taskloop_api=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("taskloop-server starting...");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let pool = sqlx::PgPool::connect(&database_url).await.context("failed to connect to postgres")?;

    let redis_url = std::env::var("REDIS_URL").ok();

    let tracker: Arc<dyn ExecutionTracker> = match &redis_url {
        Some(url) if std::env::var("TRACKER_KIND").as_deref() == Ok("redis") => {
            Arc::new(RedisTracker::connect(url, "taskloop", 86_400, 300).await.context("failed to connect redis tracker")?)
        }
        _ => {
            let tracker = PostgresTracker::new(pool.clone());
            tracker.ensure_schema().await.context("failed to provision task_executions table")?;
            Arc::new(tracker)
        }
    };

    let results: Arc<dyn ResultBackend> = match &redis_url {
        Some(url) if std::env::var("RESULT_KIND").as_deref() == Ok("redis") => {
            Arc::new(RedisResultBackend::connect(url, "taskloop:result", true).await.context("failed to connect redis result backend")?)
        }
        _ => {
            let backend = PostgresResultBackend::new(pool.clone());
            backend.ensure_schema().await.context("failed to provision task_results table")?;
            Arc::new(backend)
        }
    };

    let dlq: Arc<dyn DeadLetterQueue> = if std::env::var("DLQ_KIND").as_deref() == Ok("inmemory") {
        Arc::new(InMemoryDeadLetterQueue::new())
    } else {
        let dlq = PostgresDeadLetterQueue::new(pool.clone());
        dlq.ensure_schema().await.context("failed to provision dead_letter_queue table")?;
        Arc::new(dlq)
    };

    let broker_config = BrokerConfig::from_env();
    let broker = create_broker(&broker_config).await.context("failed to construct broker")?;
    broker.startup().await.context("failed to start broker")?;

    let registry = default_registry();

    let worker_config = WorkerConfig::default();
    let worker = Arc::new(Worker::new(broker.clone(), tracker.clone(), results.clone(), dlq.clone(), registry.clone(), worker_config));
    tokio::spawn(async move {
        if let Err(e) = worker.run().await {
            tracing::error!(error = %e, "worker loop exited");
        }
    });

    let scheduler = Arc::new(Scheduler::new(Vec::new(), broker.clone(), tracker.clone(), "default"));
    {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                tracing::error!(error = %e, "scheduler exited");
            }
        });
    }

    let service = Arc::new(TaskManagementService::new(tracker, broker, results, dlq, scheduler, registry, ServiceConfig::default()));

    let state = AppState::new(service);
    let app = build_router(state);

    let addr = std::env::var("TASKLOOP_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind to address")?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
