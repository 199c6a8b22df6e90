//! Job store contract
//!
//! The store is the durable side of the queue: jobs, their states, and the
//! repeating schedules. Workers and schedulers are thin loops over this
//! trait, so the same worker code runs against Redis in production and the
//! in-memory store in tests.

use super::job::{Job, JobOptions, JobState};
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Template for jobs produced by a repeating schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTemplate {
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

/// A registered repeating schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Stable key; re-registering with the same key replaces the schedule
    pub key: String,
    pub every_ms: u64,
    pub next_run: DateTime<Utc>,
    /// How many times this schedule has fired
    pub firings: u32,
    pub template: ScheduleTemplate,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a job. Returns None when a dedup key suppressed the enqueue
    /// because a job with the same key is already waiting or active.
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Option<Uuid>>;

    /// Atomically claim the next due job of a queue, marking it Active.
    async fn claim(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Record liveness of an active job.
    async fn heartbeat(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Mark an active job completed and release its dedup key.
    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Record a failed attempt. Retryable failures below the attempt ceiling
    /// are rescheduled with exponential backoff; everything else lands in the
    /// failed list. Returns the resulting state.
    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
        retryable: bool,
    ) -> Result<JobState>;

    /// Requeue Active jobs whose last heartbeat is older than the cutoff.
    /// This is what tolerates worker-process crashes mid-job. Returns the
    /// number of requeued jobs.
    async fn requeue_stalled(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Operator-visible list of terminally failed jobs of a queue.
    async fn failed_jobs(&self, queue: &str) -> Result<Vec<Job>>;

    /// Register or replace a repeating schedule. Idempotent on `key`.
    async fn upsert_schedule(
        &self,
        key: &str,
        every: Duration,
        template: ScheduleTemplate,
    ) -> Result<()>;

    /// Remove a schedule. Canceling a non-existent key is a no-op.
    async fn cancel_schedule(&self, key: &str) -> Result<()>;

    /// Schedules whose next_run has passed.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;

    /// Advance a schedule after firing it.
    async fn mark_schedule_fired(&self, key: &str, next_run: DateTime<Utc>) -> Result<()>;
}
