//! Repeating-job scheduler
//!
//! Fires due schedules by enqueueing their job template and advancing
//! next_run by the fixed interval. Schedule state lives in the job store, so
//! registrations and cancellations survive process restarts and a crashed
//! scheduler resumes where it left off.

use super::job::JobOptions;
use super::store::JobStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    /// Run until the shutdown signal flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler started");
        let mut tick = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    self.fire_due().await;
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Fire every due schedule once. Public for tests and manual ticks.
    pub async fn fire_due(&self) {
        let now = Utc::now();
        let due = match self.store.due_schedules(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to read due schedules");
                return;
            }
        };

        for schedule in due {
            // The firing counter rides along in the payload so processors can
            // enforce their attempt ceilings (the OCR poller relies on this).
            let mut payload = schedule.template.payload.clone();
            if let Some(map) = payload.as_object_mut() {
                map.insert(
                    "attempt".to_string(),
                    serde_json::Value::from(schedule.firings + 1),
                );
            }

            let opts = JobOptions {
                // One in-flight job per schedule key
                dedup_key: Some(format!("schedule:{}", schedule.key)),
                max_attempts: schedule.template.max_attempts,
                ..Default::default()
            };

            match self
                .store
                .enqueue(&schedule.template.queue, &schedule.template.name, payload, opts)
                .await
            {
                Ok(Some(job_id)) => {
                    debug!(
                        schedule = %schedule.key,
                        job_id = %job_id,
                        firing = schedule.firings + 1,
                        "Schedule fired"
                    );
                }
                Ok(None) => {
                    debug!(schedule = %schedule.key, "Previous firing still in flight");
                }
                Err(e) => {
                    error!(schedule = %schedule.key, error = %e, "Failed to fire schedule");
                    continue;
                }
            }

            let next_run = now
                + chrono::Duration::milliseconds(schedule.every_ms as i64);
            if let Err(e) = self.store.mark_schedule_fired(&schedule.key, next_run).await {
                error!(schedule = %schedule.key, error = %e, "Failed to advance schedule");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::JobState;
    use crate::queue::memory::MemoryJobStore;
    use crate::queue::store::ScheduleTemplate;
    use serde_json::json;

    fn template(queue: &str) -> ScheduleTemplate {
        ScheduleTemplate {
            queue: queue.to_string(),
            name: "poll".to_string(),
            payload: json!({"page_record_id": "e3b0c442"}),
            max_attempts: 1,
        }
    }

    #[tokio::test]
    async fn test_due_schedule_enqueues_job_with_attempt() {
        let store = Arc::new(MemoryJobStore::new());
        store
            .upsert_schedule("ocr-poll:p1", Duration::ZERO, template("ocr-poll"))
            .await
            .unwrap();

        let scheduler = Scheduler::new(store.clone(), Duration::from_secs(5));
        scheduler.fire_due().await;

        let jobs = store.jobs_in_state("ocr-poll", JobState::Waiting);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload["attempt"], json!(1));
        assert_eq!(store.schedule("ocr-poll:p1").unwrap().firings, 1);
    }

    #[tokio::test]
    async fn test_schedule_does_not_stack_firings() {
        let store = Arc::new(MemoryJobStore::new());
        store
            .upsert_schedule("ocr-poll:p1", Duration::ZERO, template("ocr-poll"))
            .await
            .unwrap();

        let scheduler = Scheduler::new(store.clone(), Duration::from_secs(5));
        scheduler.fire_due().await;

        // Force the schedule due again without consuming the first job
        store
            .mark_schedule_fired("ocr-poll:p1", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        scheduler.fire_due().await;

        // The dedup key kept a single in-flight job
        let jobs = store.jobs_in_state("ocr-poll", JobState::Waiting);
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_canceled_schedule_stops_firing() {
        let store = Arc::new(MemoryJobStore::new());
        store
            .upsert_schedule("ocr-poll:p1", Duration::ZERO, template("ocr-poll"))
            .await
            .unwrap();
        store.cancel_schedule("ocr-poll:p1").await.unwrap();

        let scheduler = Scheduler::new(store.clone(), Duration::from_secs(5));
        scheduler.fire_due().await;

        assert!(store.jobs_in_state("ocr-poll", JobState::Waiting).is_empty());
    }
}
