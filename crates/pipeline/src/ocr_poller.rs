//! OCR job poller
//!
//! Cloud analysis is asynchronous: the extract stage submitted a job and
//! registered a fixed-interval polling schedule keyed by the page record.
//! Each firing re-queries the analysis service. On resolution the poller
//! cancels its own schedule; an exhausted attempt ceiling or a permanent
//! analysis failure fails the page, which blocks the parent document from
//! ever reaching success while leaving sibling pages untouched.

use crate::completion::{CompletionTracker, Stage};
use crate::page_extractor::advance_resolved_page;
use casetrace_common::config::AppConfig;
use casetrace_common::errors::{AppError, Result};
use casetrace_common::metrics::record_page_processed;
use casetrace_common::ocr::{AnalysisClient, AnalysisOutcome};
use casetrace_common::queue::{Job, JobProcessor, JobStore};
use casetrace_common::Repository;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Payload of an ocr-poll job. `attempt` is stamped by the scheduler from
/// the schedule's firing counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollJob {
    pub page_record_id: Uuid,
    pub document_id: Uuid,
    pub case_id: Uuid,
    pub page_number: i32,
    pub total_pages: i32,
    #[serde(default)]
    pub attempt: u32,
}

/// What one polling pass should do
#[derive(Debug, Clone, PartialEq)]
pub enum PollAction {
    /// Job still running and attempts remain: wait for the next firing
    Wait,
    /// Analysis finished; the page resolves with this text
    Complete(String),
    /// Terminal: fail the page and cancel the schedule
    GiveUp(String),
}

/// Pure decision for one polling pass
pub fn poll_action(outcome: AnalysisOutcome, attempt: u32, max_attempts: u32) -> PollAction {
    match outcome {
        AnalysisOutcome::Succeeded { text } => PollAction::Complete(text),
        AnalysisOutcome::Failed { message, unsupported } => {
            if unsupported {
                PollAction::GiveUp(format!("unsupported document: {}", message))
            } else {
                PollAction::GiveUp(message)
            }
        }
        AnalysisOutcome::InProgress => {
            if attempt >= max_attempts {
                PollAction::GiveUp(format!(
                    "analysis did not finish within {} polling attempts",
                    max_attempts
                ))
            } else {
                PollAction::Wait
            }
        }
    }
}

/// ocr-poll queue processor
pub struct OcrPollProcessor {
    repository: Repository,
    store: Arc<dyn JobStore>,
    analysis: Arc<dyn AnalysisClient>,
    completion: CompletionTracker,
    config: Arc<AppConfig>,
}

impl OcrPollProcessor {
    pub fn new(
        repository: Repository,
        store: Arc<dyn JobStore>,
        analysis: Arc<dyn AnalysisClient>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            completion: CompletionTracker::new(repository.clone()),
            repository,
            store,
            analysis,
            config,
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn poll(&self, job: &Job) -> Result<()> {
        let payload: PollJob = job.parse_payload()?;
        let schedule_key = format!("ocr-poll:{}", payload.page_record_id);

        let Some(page) = self.repository.find_page_record(payload.page_record_id).await? else {
            // Parent finished and purged its artifacts; stop polling.
            self.store.cancel_schedule(&schedule_key).await?;
            debug!(page_record_id = %payload.page_record_id, "Page record gone, schedule canceled");
            return Ok(());
        };

        if page.is_completed || page.is_failed {
            // Canceling twice is a no-op by contract
            self.store.cancel_schedule(&schedule_key).await?;
            return Ok(());
        }

        let analysis_job_id = page.ocr_job_id.clone().ok_or_else(|| {
            AppError::RecordNotFound {
                entity: "analysis job id",
                id: payload.page_record_id.to_string(),
            }
        })?;

        let outcome = self.analysis.fetch_analysis(&analysis_job_id).await?;
        debug!(
            page_record_id = %page.id,
            analysis_job_id = %analysis_job_id,
            attempt = payload.attempt,
            ?outcome,
            "Polled analysis job"
        );

        match poll_action(outcome, payload.attempt, self.config.ocr.max_poll_attempts) {
            PollAction::Wait => Ok(()),
            PollAction::Complete(text) => {
                info!(
                    page_record_id = %page.id,
                    chars = text.len(),
                    "Cloud analysis resolved page"
                );
                self.repository
                    .resolve_page(page.id, &text, "cloud_ocr")
                    .await?;
                record_page_processed("cloud_ocr");
                self.store.cancel_schedule(&schedule_key).await?;
                self.completion
                    .update(
                        payload.case_id,
                        payload.page_number,
                        payload.total_pages,
                        Stage::Extract,
                    )
                    .await?;

                advance_resolved_page(
                    &self.repository,
                    &self.store,
                    payload.document_id,
                    payload.case_id,
                    payload.page_number,
                    payload.total_pages,
                    page.id,
                    &text,
                )
                .await
            }
            PollAction::GiveUp(reason) => {
                error!(
                    page_record_id = %page.id,
                    analysis_job_id = %analysis_job_id,
                    reason = %reason,
                    "Analysis failed terminally, page blocked"
                );
                self.repository.mark_page_failed(page.id).await?;
                self.store.cancel_schedule(&schedule_key).await?;
                self.repository
                    .set_document_status(
                        payload.document_id,
                        casetrace_common::db::models::DocumentStatus::Failed,
                        Some(&reason),
                    )
                    .await?;
                metrics::counter!("casetrace_pages_failed_total").increment(1);
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl JobProcessor for OcrPollProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        self.poll(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeded_completes() {
        let action = poll_action(
            AnalysisOutcome::Succeeded {
                text: "PATIENT: DIAZ".to_string(),
            },
            3,
            10,
        );
        assert_eq!(action, PollAction::Complete("PATIENT: DIAZ".to_string()));
    }

    #[test]
    fn test_in_progress_waits_below_ceiling() {
        assert_eq!(poll_action(AnalysisOutcome::InProgress, 4, 10), PollAction::Wait);
    }

    #[test]
    fn test_in_progress_gives_up_at_ceiling() {
        let action = poll_action(AnalysisOutcome::InProgress, 10, 10);
        assert!(matches!(action, PollAction::GiveUp(_)));
    }

    #[test]
    fn test_unsupported_document_gives_up_immediately() {
        let action = poll_action(
            AnalysisOutcome::Failed {
                message: "UNSUPPORTED_DOCUMENT".to_string(),
                unsupported: true,
            },
            1,
            10,
        );
        match action {
            PollAction::GiveUp(reason) => assert!(reason.contains("unsupported document")),
            other => panic!("expected give-up, got {:?}", other),
        }
    }

    #[test]
    fn test_provider_failure_gives_up() {
        let action = poll_action(
            AnalysisOutcome::Failed {
                message: "internal analysis error".to_string(),
                unsupported: false,
            },
            1,
            10,
        );
        assert_eq!(action, PollAction::GiveUp("internal analysis error".to_string()));
    }

    #[test]
    fn test_poll_job_defaults_attempt() {
        let value = serde_json::json!({
            "page_record_id": Uuid::new_v4(),
            "document_id": Uuid::new_v4(),
            "case_id": Uuid::new_v4(),
            "page_number": 2,
            "total_pages": 3
        });
        let job: PollJob = serde_json::from_value(value).unwrap();
        assert_eq!(job.attempt, 0);
    }
}
