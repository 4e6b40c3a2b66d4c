// Scheduler (C7): cron/interval/date triggers that publish envelopes on
// schedule, coexisting with the broker and surviving restarts by reloading
// job definitions from configuration rather than persisting fire history.

pub mod trigger;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use taskloop_broker::Broker;
use taskloop_contracts::{ScheduledJob, TaskEnvelope, TaskError};
use taskloop_tracker::ExecutionTracker;
use tokio::sync::RwLock;

/// A job as registered at process startup: trigger, target handler, and the
/// arguments to publish on every fire. The mutable scheduling state
/// (`next_run_time`, `paused`) lives on the same `ScheduledJob` value so
/// `list_jobs`/`get_job` can return one self-contained record.
pub type JobDefinition = ScheduledJob;

/// Single-threaded dispatcher: wakes at the earliest `next_run_time` across
/// all registered, non-paused jobs, publishes via the broker, and
/// recomputes. Operators run exactly one scheduler instance per deployment
/// (§5); there is no leader election here.
pub struct Scheduler {
    jobs: RwLock<HashMap<String, ScheduledJob>>,
    broker: Arc<dyn Broker>,
    tracker: Arc<dyn ExecutionTracker>,
    default_queue: String,
    /// Polled when no job is registered or all are paused, so a later
    /// `resume` is still noticed without a fresh wakeup signal.
    idle_poll: std::time::Duration,
}

impl Scheduler {
    pub fn new(
        definitions: Vec<JobDefinition>,
        broker: Arc<dyn Broker>,
        tracker: Arc<dyn ExecutionTracker>,
        default_queue: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let mut jobs = HashMap::with_capacity(definitions.len());
        for mut def in definitions {
            if !def.paused {
                def.next_run_time = Self::next_due(&def.trigger_spec, now, def.misfire_grace_seconds);
            }
            jobs.insert(def.job_id.clone(), def);
        }
        Self {
            jobs: RwLock::new(jobs),
            broker,
            tracker,
            default_queue: default_queue.into(),
            idle_poll: std::time::Duration::from_secs(30),
        }
    }

    /// Runs until the process terminates. Never returns `Err` under normal
    /// operation; individual fire failures are logged and skipped so one
    /// bad job can't wedge the dispatcher.
    pub async fn run(self: Arc<Self>) -> Result<(), TaskError> {
        loop {
            let wake_at = self.earliest_wake().await;
            match wake_at {
                Some(at) if at > Utc::now() => {
                    let delay = (at - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(delay).await;
                }
                Some(_) => {
                    // Already due; fall through and fire immediately.
                }
                None => {
                    tokio::time::sleep(self.idle_poll).await;
                    continue;
                }
            }
            self.tick().await;
        }
    }

    /// Picks the next time a job with this trigger should fire as seen from
    /// `now`: if a past occurrence was missed (process down, paused job
    /// resumed late) but still falls within `misfire_grace_seconds`, that
    /// occurrence is the one returned so it fires exactly once; otherwise
    /// this falls back to the ordinary next future occurrence (§4.6).
    fn next_due(trigger_spec: &taskloop_contracts::TriggerSpec, now: DateTime<Utc>, misfire_grace_seconds: i64) -> Option<DateTime<Utc>> {
        trigger::catch_up_occurrence(trigger_spec, now, misfire_grace_seconds).or_else(|| trigger::next_run_after(trigger_spec, now))
    }

    async fn earliest_wake(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| !j.paused)
            .filter_map(|j| j.next_run_time)
            .min()
    }

    /// Fires every due, non-paused job exactly once and recomputes its
    /// `next_run_time`. Exposed for tests that want to drive the dispatcher
    /// without sleeping.
    pub async fn tick(&self) {
        let now = Utc::now();
        let due: Vec<ScheduledJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| !j.paused && j.next_run_time.map(|t| t <= now).unwrap_or(false))
            .cloned()
            .collect();

        for job in due {
            self.fire(&job, now).await;
        }
    }

    async fn fire(&self, job: &ScheduledJob, now: DateTime<Utc>) {
        let scheduled_for = job.next_run_time.unwrap_or(now);
        let late_by = (now - scheduled_for).num_seconds();
        if late_by > job.misfire_grace_seconds {
            tracing::warn!(
                job_id = %job.job_id,
                late_by_seconds = late_by,
                grace_seconds = job.misfire_grace_seconds,
                "misfire outside grace window, coalescing to a single fire"
            );
        }

        if self.at_instance_cap(job).await {
            tracing::info!(job_id = %job.job_id, max_instances = job.max_instances, "skipping fire: max_instances reached");
        } else if let Err(e) = self.publish(job, now).await {
            tracing::error!(job_id = %job.job_id, error = %e, "failed to publish scheduled envelope");
        }

        self.reschedule(job, now).await;
    }

    /// Counts non-terminal (pending or running) executions labeled with
    /// this job's id, per §4.6's `max_instances` cap.
    async fn at_instance_cap(&self, job: &ScheduledJob) -> bool {
        if job.max_instances == 0 {
            return false;
        }
        let labeled = |r: &taskloop_contracts::ExecutionRecord| {
            r.labels.as_ref().and_then(|l| l.get("job_id")).and_then(|v| v.as_str()) == Some(job.job_id.as_str())
        };

        let running = self.tracker.get_running_tasks().await;
        let mut count = running.iter().filter(|r| labeled(r)).count();

        let pending_filters = taskloop_contracts::HistoryFilters { status: Some(taskloop_contracts::TaskStatus::Pending), ..Default::default() };
        let pending = self.tracker.get_task_history(&pending_filters, 1000, 0).await;
        count += pending.iter().filter(|r| labeled(r)).count();

        count as u32 >= job.max_instances
    }

    async fn publish(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Result<(), TaskError> {
        let mut labels: HashMap<String, Value> = HashMap::new();
        labels.insert("job_id".to_string(), Value::String(job.job_id.clone()));
        labels.insert("job_name".to_string(), Value::String(job.job_name.clone()));

        let envelope = TaskEnvelope {
            task_id: uuid::Uuid::new_v4(),
            task_name: job.handler_name.clone(),
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
            labels,
            retry_count: 0,
            max_retries: 0,
            queue_name: self.default_queue.clone(),
            enqueued_at: now,
        };
        self.tracker.record_pending(taskloop_contracts::ExecutionRecord::pending(&envelope)).await;
        self.broker.submit(envelope).await
    }

    async fn reschedule(&self, job: &ScheduledJob, fired_at: DateTime<Utc>) {
        let next = trigger::next_run_after(&job.trigger_spec, fired_at);
        if let Some(entry) = self.jobs.write().await.get_mut(&job.job_id) {
            entry.next_run_time = next;
        }
    }

    pub async fn pause(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(job) => {
                job.paused = true;
                true
            }
            None => false,
        }
    }

    pub async fn resume(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(job) => {
                job.paused = false;
                job.next_run_time = Self::next_due(&job.trigger_spec, Utc::now(), job.misfire_grace_seconds);
                true
            }
            None => false,
        }
    }

    pub async fn list_jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    pub async fn get_job(&self, job_id: &str) -> Option<ScheduledJob> {
        self.jobs.read().await.get(job_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloop_broker::inmemory::InMemoryBroker;
    use taskloop_contracts::TriggerSpec;
    use taskloop_tracker::kv::RedisTracker;

    fn job(job_id: &str, period_seconds: i64) -> ScheduledJob {
        ScheduledJob {
            job_id: job_id.to_string(),
            job_name: job_id.to_string(),
            handler_name: "cleanup_temp_files".to_string(),
            args: Vec::new(),
            kwargs: HashMap::new(),
            trigger_spec: TriggerSpec::Interval { period_seconds },
            next_run_time: None,
            paused: false,
            misfire_grace_seconds: 60,
            max_instances: 1,
        }
    }

    // `RedisTracker` needs a live connection so it's only usable as a type
    // reference here; scheduler unit tests exercise pause/resume/list,
    // which never touch the tracker.
    fn unused_tracker() -> Arc<dyn ExecutionTracker> {
        struct Unreachable;
        #[async_trait::async_trait]
        impl ExecutionTracker for Unreachable {
            async fn connect(&self) -> anyhow::Result<()> {
                Ok(())
            }
            async fn disconnect(&self) {}
            fn is_connected(&self) -> bool {
                true
            }
            async fn record_pending(&self, _: taskloop_contracts::ExecutionRecord) {}
            async fn on_task_start(&self, _: uuid::Uuid, _: &str, _: taskloop_tracker::TaskStartEvent) {}
            async fn on_task_finish(
                &self,
                _: uuid::Uuid,
                _: taskloop_contracts::TaskStatus,
                _: Option<Value>,
                _: Option<String>,
                _: Option<String>,
                _: Option<String>,
                _: i64,
            ) {
            }
            async fn cancel_task(&self, _: uuid::Uuid) -> bool {
                false
            }
            async fn get_running_tasks(&self) -> Vec<taskloop_contracts::ExecutionRecord> {
                Vec::new()
            }
            async fn get_task_history(
                &self,
                _: &taskloop_contracts::HistoryFilters,
                _: i64,
                _: i64,
            ) -> Vec<taskloop_contracts::ExecutionRecord> {
                Vec::new()
            }
            async fn count_task_history(&self, _: &taskloop_contracts::HistoryFilters) -> i64 {
                0
            }
            async fn get_task_details(&self, _: uuid::Uuid) -> Option<taskloop_contracts::ExecutionRecord> {
                None
            }
            async fn get_stats(&self, _: i64) -> taskloop_contracts::TaskStats {
                unimplemented!()
            }
        }
        let _ = RedisTracker::connect; // keep the real backend referenced for doc purposes
        Arc::new(Unreachable)
    }

    fn scheduler_with(jobs: Vec<ScheduledJob>) -> Scheduler {
        Scheduler::new(jobs, Arc::new(InMemoryBroker::new()), unused_tracker(), "default")
    }

    #[tokio::test]
    async fn new_computes_next_run_time_for_unpaused_jobs() {
        let s = scheduler_with(vec![job("nightly", 3600)]);
        let j = s.get_job("nightly").await.unwrap();
        assert!(j.next_run_time.is_some());
    }

    #[tokio::test]
    async fn new_catches_up_a_missed_fire_within_grace() {
        // A job whose trigger fired 90s ago, with a 600s grace window: a
        // scheduler starting up now must treat that fire as still due
        // instead of jumping straight to the next interval.
        let missed_at = Utc::now() - chrono::Duration::seconds(90);
        let mut def = job("catch-up", 3600);
        def.trigger_spec = TriggerSpec::Date { at: missed_at };
        def.misfire_grace_seconds = 600;
        let s = scheduler_with(vec![def]);
        let j = s.get_job("catch-up").await.unwrap();
        assert_eq!(j.next_run_time, Some(missed_at));
        assert!(j.next_run_time.unwrap() <= Utc::now());
    }

    #[tokio::test]
    async fn new_drops_a_missed_fire_outside_grace() {
        let missed_at = Utc::now() - chrono::Duration::seconds(3600);
        let mut def = job("too-late", 3600);
        def.trigger_spec = TriggerSpec::Date { at: missed_at };
        def.misfire_grace_seconds = 60;
        let s = scheduler_with(vec![def]);
        let j = s.get_job("too-late").await.unwrap();
        assert!(j.next_run_time.is_none());
    }

    #[tokio::test]
    async fn paused_job_has_no_next_run_time() {
        let mut def = job("paused-job", 60);
        def.paused = true;
        let s = scheduler_with(vec![def]);
        let j = s.get_job("paused-job").await.unwrap();
        assert!(j.next_run_time.is_none());
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips() {
        let s = scheduler_with(vec![job("job-a", 60)]);
        assert!(s.pause("job-a").await);
        assert!(s.get_job("job-a").await.unwrap().paused);
        assert!(s.resume("job-a").await);
        let j = s.get_job("job-a").await.unwrap();
        assert!(!j.paused);
        assert!(j.next_run_time.is_some());
    }

    #[tokio::test]
    async fn pause_unknown_job_returns_false() {
        let s = scheduler_with(vec![]);
        assert!(!s.pause("missing").await);
        assert!(!s.resume("missing").await);
    }

    #[tokio::test]
    async fn tick_fires_due_job_and_reschedules() {
        let s = scheduler_with(vec![job("due-now", 60)]);
        {
            let mut jobs = s.jobs.write().await;
            jobs.get_mut("due-now").unwrap().next_run_time = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        s.tick().await;
        let j = s.get_job("due-now").await.unwrap();
        assert!(j.next_run_time.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn list_jobs_is_sorted_by_id() {
        let s = scheduler_with(vec![job("zeta", 60), job("alpha", 60)]);
        let jobs = s.list_jobs().await;
        assert_eq!(jobs[0].job_id, "alpha");
        assert_eq!(jobs[1].job_id, "zeta");
    }
}
