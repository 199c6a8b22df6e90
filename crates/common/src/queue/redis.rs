//! Redis-backed job store
//!
//! Layout, all under a configurable key prefix:
//! - `job:{id}`              serialized job envelope
//! - `queue:{name}:waiting`  sorted set of job ids, scored by run_at (ms)
//! - `queue:{name}:active`   sorted set of job ids, scored by last heartbeat (ms)
//! - `queue:{name}:failed`   set of terminally failed job ids
//! - `dedup:{queue}:{key}`   dedup-key holder, released on completion
//! - `schedules`             hash of schedule key -> serialized schedule
//!
//! Claiming uses ZRANGEBYSCORE + ZREM: the worker that removes the member
//! wins the job, losers retry. Heartbeats live in the active-set score, so
//! stalled-job detection is a single range query.

use super::job::{backoff_delay, Job, JobOptions, JobState};
use super::store::{JobStore, Schedule, ScheduleTemplate};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Redis job store
pub struct RedisJobStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisJobStore {
    /// Connect to Redis and build the store
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            prefix: prefix.to_string(),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    fn job_key(&self, id: Uuid) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn waiting_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:waiting", self.prefix, queue)
    }

    fn active_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:active", self.prefix, queue)
    }

    fn failed_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:failed", self.prefix, queue)
    }

    fn dedup_key(&self, queue: &str, key: &str) -> String {
        format!("{}:dedup:{}:{}", self.prefix, queue, key)
    }

    fn schedules_key(&self) -> String {
        format!("{}:schedules", self.prefix)
    }

    async fn load_job(&self, id: Uuid) -> Result<Job> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(self.job_key(id)).await?;
        let raw = raw.ok_or_else(|| AppError::Queue {
            message: format!("Unknown job {}", id),
        })?;
        serde_json::from_str(&raw).map_err(|e| AppError::Queue {
            message: format!("Corrupt job {}: {}", id, e),
        })
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn();
        let raw = serde_json::to_string(job)?;
        let _: () = conn.set(self.job_key(job.id), raw).await?;
        Ok(())
    }

    async fn release_dedup(&self, job: &Job) -> Result<()> {
        if let Some(key) = &job.dedup_key {
            let mut conn = self.conn();
            let _: () = conn.del(self.dedup_key(&job.queue, key)).await?;
        }
        Ok(())
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Option<Uuid>> {
        let job = Job::new(queue, name, payload, &opts);
        let mut conn = self.conn();

        if let Some(key) = &opts.dedup_key {
            // Holder is released on completion or terminal failure; while it
            // exists, the same logical job is still in flight.
            let acquired: bool = conn
                .set_nx(self.dedup_key(queue, key), job.id.to_string())
                .await?;
            if !acquired {
                debug!(queue, dedup_key = %key, "Enqueue suppressed by dedup key");
                return Ok(None);
            }
        }

        self.save_job(&job).await?;
        let _: () = conn
            .zadd(self.waiting_key(queue), job.id.to_string(), millis(job.run_at))
            .await?;

        debug!(queue, job_id = %job.id, name, "Job enqueued");
        Ok(Some(job.id))
    }

    async fn claim(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut conn = self.conn();

        // A lost ZREM race means another worker claimed the member between
        // our read and remove; retry a couple of times before reporting an
        // empty queue.
        for _ in 0..3 {
            let ids: Vec<String> = conn
                .zrangebyscore_limit(self.waiting_key(queue), "-inf", millis(now), 0, 1)
                .await?;
            let Some(raw_id) = ids.into_iter().next() else {
                return Ok(None);
            };

            let removed: i64 = conn.zrem(self.waiting_key(queue), &raw_id).await?;
            if removed == 0 {
                continue;
            }

            let id = Uuid::parse_str(&raw_id).map_err(|e| AppError::Queue {
                message: format!("Malformed job id in queue {}: {}", queue, e),
            })?;

            let mut job = self.load_job(id).await?;
            job.state = JobState::Active;
            job.claimed_at = Some(now);
            job.heartbeat_at = Some(now);
            self.save_job(&job).await?;

            let _: () = conn
                .zadd(self.active_key(queue), raw_id, millis(now))
                .await?;
            return Ok(Some(job));
        }

        Ok(None)
    }

    async fn heartbeat(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        // The active-set score is the authoritative heartbeat; the envelope
        // is not rewritten on every beat.
        let job = self.load_job(job_id).await?;
        let mut conn = self.conn();
        let _: () = conn
            .zadd(self.active_key(&job.queue), job_id.to_string(), millis(now))
            .await?;
        Ok(())
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        let mut job = self.load_job(job_id).await?;
        job.state = JobState::Completed;
        self.save_job(&job).await?;

        let mut conn = self.conn();
        let _: () = conn
            .zrem(self.active_key(&job.queue), job_id.to_string())
            .await?;
        self.release_dedup(&job).await?;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
        retryable: bool,
    ) -> Result<JobState> {
        let mut job = self.load_job(job_id).await?;
        let mut conn = self.conn();

        job.attempts_made += 1;
        job.last_error = Some(error.to_string());

        let _: () = conn
            .zrem(self.active_key(&job.queue), job_id.to_string())
            .await?;

        if retryable && job.attempts_made < job.max_attempts {
            let delay = backoff_delay(
                Duration::from_millis(job.backoff_base_ms),
                job.attempts_made,
            );
            job.state = JobState::Waiting;
            job.run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            job.claimed_at = None;
            job.heartbeat_at = None;
            self.save_job(&job).await?;

            let _: () = conn
                .zadd(
                    self.waiting_key(&job.queue),
                    job_id.to_string(),
                    millis(job.run_at),
                )
                .await?;
            Ok(JobState::Waiting)
        } else {
            job.state = JobState::Failed;
            self.save_job(&job).await?;

            let _: () = conn
                .sadd(self.failed_key(&job.queue), job_id.to_string())
                .await?;
            self.release_dedup(&job).await?;
            Ok(JobState::Failed)
        }
    }

    async fn requeue_stalled(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.conn();
        let stalled: Vec<String> = conn
            .zrangebyscore(self.active_key(queue), "-inf", millis(cutoff))
            .await?;

        let mut requeued = 0;
        for raw_id in stalled {
            let removed: i64 = conn.zrem(self.active_key(queue), &raw_id).await?;
            if removed == 0 {
                continue;
            }
            let id = match Uuid::parse_str(&raw_id) {
                Ok(id) => id,
                Err(_) => continue,
            };
            let mut job = self.load_job(id).await?;
            job.state = JobState::Waiting;
            job.run_at = cutoff;
            job.claimed_at = None;
            job.heartbeat_at = None;
            self.save_job(&job).await?;

            let _: () = conn
                .zadd(self.waiting_key(queue), raw_id, millis(cutoff))
                .await?;
            requeued += 1;
        }

        Ok(requeued)
    }

    async fn failed_jobs(&self, queue: &str) -> Result<Vec<Job>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.smembers(self.failed_key(queue)).await?;

        let loads = ids
            .iter()
            .filter_map(|raw_id| Uuid::parse_str(raw_id).ok())
            .map(|id| self.load_job(id));
        futures::future::try_join_all(loads).await
    }

    async fn upsert_schedule(
        &self,
        key: &str,
        every: Duration,
        template: ScheduleTemplate,
    ) -> Result<()> {
        let mut conn = self.conn();

        // Preserve the firing counter across re-registration
        let existing: Option<String> = conn.hget(self.schedules_key(), key).await?;
        let firings = existing
            .and_then(|raw| serde_json::from_str::<Schedule>(&raw).ok())
            .map(|s| s.firings)
            .unwrap_or(0);

        let schedule = Schedule {
            key: key.to_string(),
            every_ms: every.as_millis() as u64,
            next_run: Utc::now() + chrono::Duration::from_std(every).unwrap_or_default(),
            firings,
            template,
        };

        let raw = serde_json::to_string(&schedule)?;
        let _: () = conn.hset(self.schedules_key(), key, raw).await?;
        Ok(())
    }

    async fn cancel_schedule(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.hdel(self.schedules_key(), key).await?;
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let mut conn = self.conn();
        let raw: Vec<String> = conn.hvals(self.schedules_key()).await?;

        let mut due = Vec::new();
        for item in raw {
            let schedule: Schedule = serde_json::from_str(&item).map_err(|e| AppError::Queue {
                message: format!("Corrupt schedule: {}", e),
            })?;
            if schedule.next_run <= now {
                due.push(schedule);
            }
        }
        Ok(due)
    }

    async fn mark_schedule_fired(&self, key: &str, next_run: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn();
        let existing: Option<String> = conn.hget(self.schedules_key(), key).await?;
        let Some(raw) = existing else {
            // Schedule was canceled between firing and bookkeeping
            return Ok(());
        };

        let mut schedule: Schedule = serde_json::from_str(&raw).map_err(|e| AppError::Queue {
            message: format!("Corrupt schedule {}: {}", key, e),
        })?;
        schedule.firings += 1;
        schedule.next_run = next_run;

        let raw = serde_json::to_string(&schedule)?;
        let _: () = conn.hset(self.schedules_key(), key, raw).await?;
        Ok(())
    }
}
