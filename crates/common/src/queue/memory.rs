//! In-memory job store
//!
//! Backs single-process deployments and the test suite. Same contract as the
//! Redis store, including dedup, backoff scheduling and stalled-job recovery.

use super::job::{backoff_delay, Job, JobOptions, JobState};
use super::store::{JobStore, Schedule, ScheduleTemplate};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    /// (queue, dedup_key) -> job id holding the key
    dedup: HashMap<(String, String), Uuid>,
    schedules: HashMap<String, Schedule>,
}

/// Mutex-guarded in-memory job store
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("job store poisoned")
    }

    /// Test/introspection helper: fetch a job snapshot by id
    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Test/introspection helper: jobs of a queue in a given state
    pub fn jobs_in_state(&self, queue: &str, state: JobState) -> Vec<Job> {
        self.lock()
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.state == state)
            .cloned()
            .collect()
    }

    /// Test/introspection helper: registered schedule by key
    pub fn schedule(&self, key: &str) -> Option<Schedule> {
        self.lock().schedules.get(key).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Option<Uuid>> {
        let mut inner = self.lock();

        if let Some(key) = &opts.dedup_key {
            let slot = (queue.to_string(), key.clone());
            if let Some(existing) = inner.dedup.get(&slot) {
                let held = inner
                    .jobs
                    .get(existing)
                    .map(|j| matches!(j.state, JobState::Waiting | JobState::Active))
                    .unwrap_or(false);
                if held {
                    return Ok(None);
                }
            }
        }

        let job = Job::new(queue, name, payload, &opts);
        let id = job.id;
        if let Some(key) = &opts.dedup_key {
            inner.dedup.insert((queue.to_string(), key.clone()), id);
        }
        inner.jobs.insert(id, job);
        Ok(Some(id))
    }

    async fn claim(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut inner = self.lock();

        let next = inner
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.state == JobState::Waiting && j.run_at <= now)
            .min_by_key(|j| j.run_at)
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&id).expect("job disappeared under lock");
        job.state = JobState::Active;
        job.claimed_at = Some(now);
        job.heartbeat_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.heartbeat_at = Some(now);
        }
        Ok(())
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let dedup_slot = {
            let job = inner.jobs.get_mut(&job_id).ok_or_else(|| AppError::Queue {
                message: format!("Unknown job {}", job_id),
            })?;
            job.state = JobState::Completed;
            job.dedup_key
                .clone()
                .map(|k| (job.queue.clone(), k))
        };
        if let Some(slot) = dedup_slot {
            inner.dedup.remove(&slot);
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
        retryable: bool,
    ) -> Result<JobState> {
        let mut inner = self.lock();
        let (state, dedup_slot) = {
            let job = inner.jobs.get_mut(&job_id).ok_or_else(|| AppError::Queue {
                message: format!("Unknown job {}", job_id),
            })?;

            job.attempts_made += 1;
            job.last_error = Some(error.to_string());

            if retryable && job.attempts_made < job.max_attempts {
                let delay = backoff_delay(
                    Duration::from_millis(job.backoff_base_ms),
                    job.attempts_made,
                );
                job.state = JobState::Waiting;
                job.run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                job.claimed_at = None;
                job.heartbeat_at = None;
                (JobState::Waiting, None)
            } else {
                job.state = JobState::Failed;
                let slot = job.dedup_key.clone().map(|k| (job.queue.clone(), k));
                (JobState::Failed, slot)
            }
        };
        if let Some(slot) = dedup_slot {
            inner.dedup.remove(&slot);
        }
        Ok(state)
    }

    async fn requeue_stalled(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let mut requeued = 0;

        for job in inner.jobs.values_mut() {
            if job.queue != queue || job.state != JobState::Active {
                continue;
            }
            let stalled = job
                .heartbeat_at
                .map(|hb| hb < cutoff)
                .unwrap_or(true);
            if stalled {
                job.state = JobState::Waiting;
                job.run_at = cutoff;
                job.claimed_at = None;
                job.heartbeat_at = None;
                requeued += 1;
            }
        }

        Ok(requeued)
    }

    async fn failed_jobs(&self, queue: &str) -> Result<Vec<Job>> {
        Ok(self.jobs_in_state(queue, JobState::Failed))
    }

    async fn upsert_schedule(
        &self,
        key: &str,
        every: Duration,
        template: ScheduleTemplate,
    ) -> Result<()> {
        let mut inner = self.lock();
        let schedule = Schedule {
            key: key.to_string(),
            every_ms: every.as_millis() as u64,
            next_run: Utc::now() + chrono::Duration::from_std(every).unwrap_or_default(),
            firings: inner.schedules.get(key).map(|s| s.firings).unwrap_or(0),
            template,
        };
        inner.schedules.insert(key.to_string(), schedule);
        Ok(())
    }

    async fn cancel_schedule(&self, key: &str) -> Result<()> {
        self.lock().schedules.remove(key);
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        Ok(self
            .lock()
            .schedules
            .values()
            .filter(|s| s.next_run <= now)
            .cloned()
            .collect())
    }

    async fn mark_schedule_fired(&self, key: &str, next_run: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(schedule) = inner.schedules.get_mut(key) {
            schedule.firings += 1;
            schedule.next_run = next_run;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> ScheduleTemplate {
        ScheduleTemplate {
            queue: "ocr-poll".to_string(),
            name: "poll".to_string(),
            payload: json!({"page": 1}),
            max_attempts: 1,
        }
    }

    #[tokio::test]
    async fn test_enqueue_claim_complete() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue("q", "job", json!({}), JobOptions::default())
            .await
            .unwrap()
            .unwrap();

        let job = store.claim("q", Utc::now()).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Active);

        store.complete(id).await.unwrap();
        assert_eq!(store.job(id).unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_dedup_key_suppresses_duplicate() {
        let store = MemoryJobStore::new();
        let opts = JobOptions::with_dedup_key("merge:doc-1");

        let first = store.enqueue("q", "merge", json!({}), opts.clone()).await.unwrap();
        assert!(first.is_some());

        let second = store.enqueue("q", "merge", json!({}), opts.clone()).await.unwrap();
        assert!(second.is_none());

        // After completion the key is released and a new enqueue succeeds
        store.claim("q", Utc::now()).await.unwrap();
        store.complete(first.unwrap()).await.unwrap();
        let third = store.enqueue("q", "merge", json!({}), opts).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_failed_job_retries_with_backoff_then_lands_in_failed_list() {
        let store = MemoryJobStore::new();
        let opts = JobOptions {
            max_attempts: 2,
            backoff_base: Duration::from_secs(10),
            ..Default::default()
        };
        let id = store.enqueue("q", "job", json!({}), opts).await.unwrap().unwrap();

        let now = Utc::now();
        store.claim("q", now).await.unwrap().unwrap();
        let state = store.fail(id, "timeout", now, true).await.unwrap();
        assert_eq!(state, JobState::Waiting);

        // Backoff pushed run_at into the future, so an immediate claim is empty
        assert!(store.claim("q", now).await.unwrap().is_none());

        let later = now + chrono::Duration::seconds(11);
        store.claim("q", later).await.unwrap().unwrap();
        let state = store.fail(id, "timeout again", later, true).await.unwrap();
        assert_eq!(state, JobState::Failed);

        let failed = store.failed_jobs("q").await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("timeout again"));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_skips_backoff() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue("q", "job", json!({}), JobOptions::default())
            .await
            .unwrap()
            .unwrap();

        let now = Utc::now();
        store.claim("q", now).await.unwrap();
        let state = store.fail(id, "missing parent document", now, false).await.unwrap();
        assert_eq!(state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_stalled_job_is_requeued() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue("q", "job", json!({}), JobOptions::default())
            .await
            .unwrap()
            .unwrap();

        let claimed_at = Utc::now();
        store.claim("q", claimed_at).await.unwrap().unwrap();

        // Heartbeat is fresh: nothing to requeue
        let requeued = store
            .requeue_stalled("q", claimed_at - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(requeued, 0);

        // Cutoff after the last heartbeat: the job went stale
        let requeued = store
            .requeue_stalled("q", claimed_at + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(store.job(id).unwrap().state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_schedule_upsert_is_idempotent() {
        let store = MemoryJobStore::new();
        store
            .upsert_schedule("ocr-poll:p1", Duration::from_secs(120), template())
            .await
            .unwrap();
        store
            .upsert_schedule("ocr-poll:p1", Duration::from_secs(120), template())
            .await
            .unwrap();

        let due = store
            .due_schedules(Utc::now() + chrono::Duration::seconds(121))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_missing_schedule_is_noop() {
        let store = MemoryJobStore::new();
        store.cancel_schedule("never-registered").await.unwrap();
    }

    #[tokio::test]
    async fn test_schedule_firing_advances_next_run() {
        let store = MemoryJobStore::new();
        store
            .upsert_schedule("tick", Duration::from_millis(10), template())
            .await
            .unwrap();

        let soon = Utc::now() + chrono::Duration::seconds(1);
        let due = store.due_schedules(soon).await.unwrap();
        assert_eq!(due.len(), 1);

        store
            .mark_schedule_fired("tick", soon + chrono::Duration::seconds(120))
            .await
            .unwrap();
        assert!(store.due_schedules(soon).await.unwrap().is_empty());
        assert_eq!(store.schedule("tick").unwrap().firings, 1);
    }
}
