//! Queue worker
//!
//! Binds a processor to one named queue. Concurrency is derived from free
//! system memory at worker start and is not adjusted mid-run. Claimed jobs
//! heartbeat while running; a background scan requeues jobs whose worker
//! stopped heartbeating.

use super::job::Job;
use super::store::JobStore;
use crate::errors::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Processor bound to a queue
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<()>;
}

/// Worker tuning knobs
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub per_job_memory_bytes: u64,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Active jobs silent longer than this are considered stalled
    pub stall_threshold: Duration,
}

impl WorkerConfig {
    pub fn for_queue(queue: &str, queue_cfg: &crate::config::QueueConfig) -> Self {
        Self {
            queue: queue.to_string(),
            min_concurrency: queue_cfg.min_concurrency,
            max_concurrency: queue_cfg.max_concurrency,
            per_job_memory_bytes: queue_cfg.per_job_memory_mb * 1024 * 1024,
            poll_interval: Duration::from_millis(queue_cfg.poll_interval_ms),
            heartbeat_interval: Duration::from_secs(queue_cfg.heartbeat_secs),
            stall_threshold: Duration::from_secs(queue_cfg.stall_threshold_secs),
        }
    }
}

/// Concurrency limit from available memory:
/// min(max, max(min, free * 0.8 / per_job_budget))
pub fn concurrency_from_memory(
    free_bytes: u64,
    per_job_bytes: u64,
    min_concurrency: usize,
    max_concurrency: usize,
) -> usize {
    let budget = (free_bytes as f64 * 0.8) / per_job_bytes.max(1) as f64;
    let fits = budget.floor() as usize;
    fits.max(min_concurrency).min(max_concurrency)
}

/// Worker bound to one named queue
pub struct Worker {
    store: Arc<dyn JobStore>,
    processor: Arc<dyn JobProcessor>,
    config: WorkerConfig,
    concurrency: usize,
}

impl Worker {
    /// Build a worker, sizing concurrency from current free memory.
    pub fn new(
        store: Arc<dyn JobStore>,
        processor: Arc<dyn JobProcessor>,
        config: WorkerConfig,
    ) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let concurrency = concurrency_from_memory(
            system.available_memory(),
            config.per_job_memory_bytes,
            config.min_concurrency,
            config.max_concurrency,
        );

        info!(
            queue = %config.queue,
            concurrency,
            available_memory = system.available_memory(),
            "Worker initialized"
        );

        Self {
            store,
            processor,
            config,
            concurrency,
        }
    }

    /// Effective concurrency limit computed at construction
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run until the shutdown signal flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut stall_tick = tokio::time::interval(self.config.stall_threshold / 2);

        info!(queue = %self.config.queue, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Reap finished job tasks
            while tasks.try_join_next().is_some() {}

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = stall_tick.tick() => {
                    self.scan_stalled().await;
                }
                permit = semaphore.clone().acquire_owned() => {
                    let permit = permit.expect("semaphore closed");
                    match self.store.claim(&self.config.queue, Utc::now()).await {
                        Ok(Some(job)) => {
                            let worker = self.clone();
                            tasks.spawn(async move {
                                worker.run_job(job).await;
                                drop(permit);
                            });
                        }
                        Ok(None) => {
                            drop(permit);
                            tokio::time::sleep(self.config.poll_interval).await;
                        }
                        Err(e) => {
                            drop(permit);
                            error!(queue = %self.config.queue, error = %e, "Failed to claim job");
                            tokio::time::sleep(self.config.poll_interval).await;
                        }
                    }
                }
            }
        }

        // Drain in-flight jobs before returning
        while tasks.join_next().await.is_some() {}
        info!(queue = %self.config.queue, "Worker stopped");
    }

    async fn scan_stalled(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stall_threshold).unwrap_or_default();
        match self.store.requeue_stalled(&self.config.queue, cutoff).await {
            Ok(0) => {}
            Ok(n) => warn!(queue = %self.config.queue, requeued = n, "Requeued stalled jobs"),
            Err(e) => error!(queue = %self.config.queue, error = %e, "Stalled-job scan failed"),
        }
    }

    async fn run_job(&self, job: Job) {
        debug!(queue = %self.config.queue, job_id = %job.id, name = %job.name, "Job claimed");

        let heartbeat = {
            let store = self.store.clone();
            let job_id = job.id;
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.tick().await; // first tick fires immediately
                loop {
                    tick.tick().await;
                    if let Err(e) = store.heartbeat(job_id, Utc::now()).await {
                        warn!(job_id = %job_id, error = %e, "Heartbeat failed");
                    }
                }
            })
        };

        let outcome = self.processor.process(&job).await;
        heartbeat.abort();

        match outcome {
            Ok(()) => {
                metrics::counter!(
                    "casetrace_queue_jobs_processed_total",
                    "queue" => self.config.queue.clone()
                )
                .increment(1);
                if let Err(e) = self.store.complete(job.id).await {
                    error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                }
            }
            Err(err) => {
                let retryable = err.is_retryable();
                metrics::counter!(
                    "casetrace_queue_jobs_errored_total",
                    "queue" => self.config.queue.clone()
                )
                .increment(1);
                error!(
                    queue = %self.config.queue,
                    job_id = %job.id,
                    name = %job.name,
                    attempt = job.attempts_made + 1,
                    retryable,
                    error = %err,
                    "Job failed"
                );
                match self
                    .store
                    .fail(job.id, &err.to_string(), Utc::now(), retryable)
                    .await
                {
                    Ok(super::job::JobState::Failed) => {
                        metrics::counter!(
                            "casetrace_queue_jobs_failed_total",
                            "queue" => self.config.queue.clone()
                        )
                        .increment(1);
                    }
                    Ok(_) => {}
                    Err(e) => error!(job_id = %job.id, error = %e, "Failed to record job failure"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::queue::job::{JobOptions, JobState};
    use crate::queue::memory::MemoryJobStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_concurrency_from_memory() {
        // 8 GiB free, 256 MiB per job: 0.8 * 8192 / 256 = 25.6 -> capped at max
        assert_eq!(concurrency_from_memory(8 * GIB, 256 * 1024 * 1024, 1, 8), 8);
        // 1 GiB free, 256 MiB per job: 3.2 -> 3
        assert_eq!(concurrency_from_memory(GIB, 256 * 1024 * 1024, 1, 8), 3);
        // Tiny box: floor wins, min keeps at least one slot
        assert_eq!(concurrency_from_memory(64 * 1024 * 1024, 256 * 1024 * 1024, 1, 8), 1);
    }

    struct CountingProcessor {
        seen: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl JobProcessor for CountingProcessor {
        async fn process(&self, _job: &Job) -> Result<()> {
            let n = self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(AppError::Download {
                    url: "https://example.com/a.pdf".to_string(),
                    message: "reset".to_string(),
                });
            }
            Ok(())
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            queue: "q".to_string(),
            min_concurrency: 1,
            max_concurrency: 2,
            per_job_memory_bytes: 1,
            poll_interval: Duration::from_millis(5),
            heartbeat_interval: Duration::from_millis(50),
            stall_threshold: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_worker_processes_and_completes_job() {
        let store = Arc::new(MemoryJobStore::new());
        let processor = Arc::new(CountingProcessor {
            seen: AtomicUsize::new(0),
            fail_first: false,
        });

        let id = store
            .enqueue("q", "job", json!({}), JobOptions::default())
            .await
            .unwrap()
            .unwrap();

        let worker = Arc::new(Worker::new(
            store.clone() as Arc<dyn JobStore>,
            processor.clone() as Arc<dyn JobProcessor>,
            test_config(),
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));

        // Give the worker a few poll cycles
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(processor.seen.load(Ordering::SeqCst), 1);
        assert_eq!(store.job(id).unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_worker_records_failed_attempt() {
        let store = Arc::new(MemoryJobStore::new());
        let processor = Arc::new(CountingProcessor {
            seen: AtomicUsize::new(0),
            fail_first: true,
        });

        let opts = JobOptions {
            max_attempts: 3,
            backoff_base: Duration::from_secs(300),
            ..Default::default()
        };
        let id = store.enqueue("q", "job", json!({}), opts).await.unwrap().unwrap();

        let worker = Arc::new(Worker::new(
            store.clone() as Arc<dyn JobStore>,
            processor.clone() as Arc<dyn JobProcessor>,
            test_config(),
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // One transient failure: the job is waiting again with backoff, not failed
        let job = store.job(id).unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 1);
        assert!(job.last_error.is_some());
    }
}
