//! Periodic scheduler loop.
//!
//! One ticker (default 30s) drives three action classes per tick, each in
//! its own transaction scope: firing due schedules, retention GC of
//! expired terminal jobs, and failing tasks stuck in `running` past the
//! task timeout. Errors inside a tick are logged and never crash the
//! loop.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use tokio_util::sync::CancellationToken;

use conductor_db::models::{Schedule, ScheduleType, TaskStatus};
use conductor_db::queries::jobs as job_db;
use conductor_db::queries::schedules as schedule_db;
use conductor_db::queries::tasks as task_db;

use crate::orchestrator::Orchestrator;
use crate::state::dispatch;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    /// Terminal jobs older than this are purged.
    pub retention: chrono::Duration,
    /// Running tasks started earlier than this are considered stuck.
    pub task_timeout: chrono::Duration,
    /// Upper bound on jobs purged per tick.
    pub gc_batch_size: i64,
    pub max_retries: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            retention: chrono::Duration::days(7),
            task_timeout: chrono::Duration::minutes(10),
            gc_batch_size: 100,
            max_retries: 3,
        }
    }
}

/// The scheduler, owning the periodic loop.
pub struct Scheduler {
    orchestrator: Orchestrator,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, config: SchedulerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Run ticks until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(tick = ?self.config.tick, "scheduler started");
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("scheduler stopped");
                    return;
                }
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
    }

    /// One tick. Every action class catches and logs its own errors.
    pub async fn tick(&self, now: DateTime<Utc>) {
        if let Err(err) = self.fire_due_schedules(now).await {
            tracing::error!(error = %err, "schedule firing failed");
        }
        if let Err(err) = self.run_retention_gc(now).await {
            tracing::error!(error = %err, "retention GC failed");
        }
        if let Err(err) = self.fail_stuck_tasks(now).await {
            tracing::error!(error = %err, "stuck task scan failed");
        }
        if let Err(err) = self.reconcile_dead_letters().await {
            tracing::error!(error = %err, "dead letter reconciliation failed");
        }
    }

    // -------------------------------------------------------------------
    // Due schedules
    // -------------------------------------------------------------------

    /// Fire every enabled schedule whose `next_run_at` has passed.
    ///
    /// One-shot types (`once`, `delayed`) start the scheduled job itself
    /// and retire. Cron schedules clone the job's DAG into a fresh job
    /// per firing and advance to the next cron occurrence.
    async fn fire_due_schedules(&self, now: DateTime<Utc>) -> Result<()> {
        let due = schedule_db::list_due_schedules(self.orchestrator.pool(), now).await?;

        for schedule in due {
            if let Err(err) = self.fire_one(&schedule, now).await {
                tracing::error!(
                    job_id = %schedule.job_id,
                    error = %err,
                    "failed to fire schedule"
                );
            }
        }
        Ok(())
    }

    async fn fire_one(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<()> {
        match schedule.schedule_type {
            ScheduleType::Once | ScheduleType::Delayed => {
                tracing::info!(job_id = %schedule.job_id, "starting scheduled job");
                self.orchestrator
                    .start_job(schedule.job_id)
                    .await
                    .with_context(|| format!("starting scheduled job {}", schedule.job_id))?;
                schedule_db::advance_schedule(self.orchestrator.pool(), schedule.job_id, now, None)
                    .await?;
            }
            ScheduleType::Cron => {
                let clone = self.orchestrator.clone_job(schedule.job_id).await?;
                tracing::info!(
                    job_id = %schedule.job_id,
                    spawned_job_id = %clone.id,
                    "spawned job from cron schedule"
                );
                self.orchestrator.start_job(clone.id).await?;

                let next = schedule
                    .cron_expr
                    .as_deref()
                    .and_then(|expr| next_cron_occurrence(expr, now));
                if next.is_none() {
                    tracing::warn!(
                        job_id = %schedule.job_id,
                        cron = schedule.cron_expr.as_deref().unwrap_or(""),
                        "cron expression yields no further occurrences, disabling"
                    );
                }
                schedule_db::advance_schedule(self.orchestrator.pool(), schedule.job_id, now, next)
                    .await?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Retention GC
    // -------------------------------------------------------------------

    /// Purge terminal jobs past the retention window, one transaction per
    /// batch. Idempotent: a second run over the same window is a no-op.
    async fn run_retention_gc(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - self.config.retention;
        let expired = job_db::list_expired_job_ids(
            self.orchestrator.pool(),
            cutoff,
            self.config.gc_batch_size,
        )
        .await?;

        if expired.is_empty() {
            return Ok(0);
        }

        let purged = job_db::purge_jobs(self.orchestrator.pool(), &expired).await?;
        tracing::info!(purged, cutoff = %cutoff, "retention GC purged expired jobs");
        Ok(purged)
    }

    // -------------------------------------------------------------------
    // Stuck tasks
    // -------------------------------------------------------------------

    /// Fail tasks stuck in `running` past the task timeout and retry the
    /// ones with budget left; the failure is classified retryable.
    async fn fail_stuck_tasks(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - self.config.task_timeout;
        let stuck =
            task_db::list_stuck_running_tasks(self.orchestrator.pool(), cutoff).await?;

        for task in stuck {
            let error = "task timeout: worker heartbeat expired";
            tracing::warn!(
                task_id = %task.id,
                job_id = %task.job_id,
                started_at = ?task.started_at,
                "failing stuck task"
            );
            dispatch::fail_task(self.orchestrator.pool(), task.id, error).await?;
            self.orchestrator
                .publish_task_event(&task, TaskStatus::Failed, Some(error));

            if task.retry_count < self.config.max_retries {
                self.orchestrator.retry_task(task.id, false).await?;
            } else {
                self.orchestrator.derive_job(task.job_id).await?;
                self.orchestrator.scan_job(task.job_id).await?;
            }
        }
        Ok(())
    }
}

impl Scheduler {
    /// Fail tasks whose dispatch message landed in the DLQ.
    ///
    /// Workers nack undeliverable messages; once a message exhausts its
    /// redeliveries the broker routes it to the dead-letter table, and
    /// this pass annotates the referenced task.
    async fn reconcile_dead_letters(&self) -> Result<()> {
        let dead = self.orchestrator.broker().dead_letters(100).await?;
        for letter in dead {
            let Some(task_id) = letter.task_id else {
                continue;
            };
            let Some(task) = task_db::get_task(self.orchestrator.pool(), task_id).await? else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            self.orchestrator.mark_dead_lettered(task_id, letter.id).await?;
        }
        Ok(())
    }
}

/// Next occurrence of a cron expression strictly after `now`.
///
/// Accepts standard 5-field expressions by prepending a seconds field for
/// the `cron` crate's 6/7-field grammar.
pub fn next_cron_occurrence(expr: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_owned()
    };
    let schedule = CronSchedule::from_str(&normalized).ok()?;
    schedule.after(&now).next()
}

/// Compute the initial `next_run_at` for a new schedule.
pub fn initial_next_run(
    schedule_type: ScheduleType,
    cron_expr: Option<&str>,
    run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule_type {
        ScheduleType::Once => Some(run_at.unwrap_or(now)),
        ScheduleType::Delayed => run_at,
        ScheduleType::Cron => cron_expr.and_then(|expr| next_cron_occurrence(expr, now)),
    }
}
