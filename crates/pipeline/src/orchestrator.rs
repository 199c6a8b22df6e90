//! Case orchestrator
//!
//! The once-per-minute case tick does two things:
//! 1. Claims the oldest pending case (the conditional claim is the
//!    idempotency guard: ticks firing while a case is `processing` no-op)
//!    and enqueues a split job per pending document.
//! 2. Sweeps `processing` cases for work that was skipped on an earlier
//!    pass: completed pages still awaiting structuring, documents ready to
//!    merge, and cases whose finalization was interrupted.

use crate::merge::{finalize_case_if_ready, maybe_enqueue_document_merge};
use crate::splitter::SplitJob;
use crate::structuring::StructureJob;
use casetrace_common::db::models::DocumentStatus;
use casetrace_common::errors::Result;
use casetrace_common::queue::{
    Job, JobOptions, JobProcessor, JobStore, Schedule, ScheduleTemplate, QUEUE_CASE_TICK,
    QUEUE_DOCUMENT_SPLIT, QUEUE_PAGE_STRUCTURE,
};
use casetrace_common::Repository;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Stable schedule key of the case tick
pub const CASE_TICK_SCHEDULE: &str = "case-tick";

/// Register (or re-register) the repeating case tick. Idempotent by key.
pub async fn register_case_tick(store: &Arc<dyn JobStore>, interval: Duration) -> Result<()> {
    store
        .upsert_schedule(
            CASE_TICK_SCHEDULE,
            interval,
            ScheduleTemplate {
                queue: QUEUE_CASE_TICK.to_string(),
                name: "process-next-case".to_string(),
                payload: serde_json::json!({}),
                max_attempts: 1,
            },
        )
        .await
}

/// case-tick queue processor
pub struct CaseTickProcessor {
    repository: Repository,
    store: Arc<dyn JobStore>,
}

impl CaseTickProcessor {
    pub fn new(repository: Repository, store: Arc<dyn JobStore>) -> Self {
        Self { repository, store }
    }

    #[instrument(skip(self))]
    async fn tick(&self) -> Result<()> {
        if let Some(case) = self.repository.claim_next_pending_case().await? {
            info!(case_id = %case.id, "Claimed pending case");
            self.start_case(case.id).await?;
        }

        self.sweep_processing_cases().await
    }

    /// Kick off extraction for a freshly claimed case
    async fn start_case(&self, case_id: Uuid) -> Result<()> {
        self.repository
            .set_case_state(case_id, "Queued for extraction")
            .await?;

        let documents = self.repository.documents_for_case(case_id).await?;
        if documents.is_empty() {
            // Nothing to extract; the case finalizes with an empty bundle
            return finalize_case_if_ready(&self.repository, case_id).await;
        }

        for document in documents {
            if document.document_status() != DocumentStatus::Pending {
                continue;
            }
            let job = SplitJob {
                document_id: document.id,
                case_id,
                document_url: document.source_url.clone(),
            };
            self.store
                .enqueue(
                    QUEUE_DOCUMENT_SPLIT,
                    "split-document",
                    serde_json::to_value(&job)?,
                    JobOptions::with_dedup_key(format!("split:{}", document.id)),
                )
                .await?;
        }
        Ok(())
    }

    /// Re-read the not-yet-completed predicates of in-flight cases and
    /// re-enqueue whatever stalled: this is the fixed-cadence retry surface
    /// for pages skipped by a structured-extraction pass.
    async fn sweep_processing_cases(&self) -> Result<()> {
        for case_id in self.repository.processing_case_ids().await? {
            let documents = self.repository.documents_for_case(case_id).await?;

            for document in &documents {
                if document.is_terminal() {
                    continue;
                }

                for page in self.repository.unstructured_pages(document.id).await? {
                    let job = StructureJob {
                        page_record_id: page.id,
                        document_id: document.id,
                        case_id,
                        page_number: page.page_number,
                        total_pages: page.total_pages,
                    };
                    let enqueued = self
                        .store
                        .enqueue(
                            QUEUE_PAGE_STRUCTURE,
                            "structure-page",
                            serde_json::to_value(&job)?,
                            JobOptions::with_dedup_key(format!("structure:{}", page.id)),
                        )
                        .await?;
                    if enqueued.is_some() {
                        debug!(
                            case_id = %case_id,
                            page_record_id = %page.id,
                            "Re-enqueued skipped structuring pass"
                        );
                    }
                }

                maybe_enqueue_document_merge(&self.repository, &self.store, document.id, case_id)
                    .await?;
            }

            // Recover a finalization interrupted between document merge and
            // case merge.
            finalize_case_if_ready(&self.repository, case_id).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobProcessor for CaseTickProcessor {
    async fn process(&self, _job: &Job) -> Result<()> {
        self.tick().await
    }
}

/// Convenience for operators: the registered tick schedule, if any
pub async fn case_tick_schedule(store: &Arc<dyn JobStore>) -> Result<Option<Schedule>> {
    let due = store.due_schedules(chrono::Utc::now() + chrono::Duration::days(3650)).await?;
    Ok(due.into_iter().find(|s| s.key == CASE_TICK_SCHEDULE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use casetrace_common::queue::MemoryJobStore;

    #[tokio::test]
    async fn test_register_case_tick_is_idempotent() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        register_case_tick(&store, Duration::from_secs(60)).await.unwrap();
        register_case_tick(&store, Duration::from_secs(60)).await.unwrap();

        let schedule = case_tick_schedule(&store).await.unwrap();
        assert!(schedule.is_some());
        assert_eq!(schedule.unwrap().every_ms, 60_000);
    }
}
