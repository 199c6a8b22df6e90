//! Job envelope and enqueue options

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Enqueued, waiting for its run_at to pass
    Waiting,
    /// Claimed by a worker, heartbeating
    Active,
    Completed,
    /// Attempts exhausted or failed terminally; kept for the operator-visible
    /// failed-job list, never silently dropped
    Failed,
}

/// A unit of queued work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Exponential backoff base, in milliseconds
    pub backoff_base_ms: u64,
    /// Suppresses duplicate enqueues while a job with the same key is pending
    pub dedup_key: Option<String>,
    pub run_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(queue: &str, name: &str, payload: serde_json::Value, opts: &JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            name: name.to_string(),
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: opts.max_attempts,
            backoff_base_ms: opts.backoff_base.as_millis() as u64,
            dedup_key: opts.dedup_key.clone(),
            run_at: now + chrono::Duration::from_std(opts.delay).unwrap_or_default(),
            claimed_at: None,
            heartbeat_at: None,
            last_error: None,
            created_at: now,
        }
    }

    /// Parse the payload into a typed message
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> crate::errors::Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| crate::errors::AppError::Queue {
            message: format!("Failed to parse payload of job {}: {}", self.id, e),
        })
    }
}

/// Options for enqueueing a job
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub dedup_key: Option<String>,
    pub max_attempts: u32,
    /// Base delay for exponential backoff between retries
    pub backoff_base: Duration,
    /// Initial delay before the job becomes due
    pub delay: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            dedup_key: None,
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            delay: Duration::ZERO,
        }
    }
}

impl JobOptions {
    pub fn with_dedup_key(key: impl Into<String>) -> Self {
        Self {
            dedup_key: Some(key.into()),
            ..Default::default()
        }
    }
}

/// Delay before retry attempt `attempts_made` (1-based): base * 2^(n-1)
pub fn backoff_delay(base: Duration, attempts_made: u32) -> Duration {
    let exp = attempts_made.saturating_sub(1).min(16);
    base.saturating_mul(2_u32.saturating_pow(exp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(20));
        assert_eq!(backoff_delay(base, 4), Duration::from_secs(40));
    }

    #[test]
    fn test_backoff_is_capped() {
        // Very large attempt counts must not overflow
        let base = Duration::from_secs(5);
        let d = backoff_delay(base, 1000);
        assert!(d >= backoff_delay(base, 17));
    }

    #[test]
    fn test_job_serialization_round_trip() {
        let job = Job::new(
            "page-extract",
            "extract",
            serde_json::json!({"page_number": 3}),
            &JobOptions::with_dedup_key("page:abc:3"),
        );

        let json = serde_json::to_string(&job).unwrap();
        let parsed: Job = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.queue, "page-extract");
        assert_eq!(parsed.dedup_key.as_deref(), Some("page:abc:3"));
        assert_eq!(parsed.state, JobState::Waiting);
    }

    #[test]
    fn test_delayed_job_run_at() {
        let opts = JobOptions {
            delay: Duration::from_secs(60),
            ..Default::default()
        };
        let job = Job::new("q", "j", serde_json::Value::Null, &opts);
        assert!(job.run_at > job.created_at);
    }
}
