//! Embedding persistence and structured extraction
//!
//! Two per-page stages behind the text-resolution stages:
//! - `EmbedProcessor` turns resolved page text into a stored vector.
//! - `StructureProcessor` assembles a similarity context window and asks the
//!   extraction model for the page's clinical/claims bundle.
//!
//! Extraction failures of the provider/schema kind skip the page for the
//! current pass only; the orchestrator's sweep re-enqueues it on a later
//! scheduling cycle.

use crate::completion::{CompletionTracker, Stage};
use crate::context::assemble_context;
use crate::merge::maybe_enqueue_document_merge;
use crate::page_extractor::EmbedJob;
use casetrace_common::config::AppConfig;
use casetrace_common::errors::{AppError, ErrorKind, Result};
use casetrace_common::queue::{
    Job, JobOptions, JobProcessor, JobStore, QUEUE_PAGE_STRUCTURE,
};
use casetrace_common::{BundleExtractor, Embedder, Repository};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Payload of a page-structure job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureJob {
    pub page_record_id: Uuid,
    pub document_id: Uuid,
    pub case_id: Uuid,
    pub page_number: i32,
    pub total_pages: i32,
}

/// page-embed queue processor
pub struct EmbedProcessor {
    repository: Repository,
    store: Arc<dyn JobStore>,
    embedder: Arc<dyn Embedder>,
    completion: CompletionTracker,
}

impl EmbedProcessor {
    pub fn new(
        repository: Repository,
        store: Arc<dyn JobStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            completion: CompletionTracker::new(repository.clone()),
            repository,
            store,
            embedder,
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn embed(&self, job: &Job) -> Result<()> {
        let payload: EmbedJob = job.parse_payload()?;

        let page = self
            .repository
            .find_page_record(payload.page_record_id)
            .await?
            .ok_or_else(|| AppError::RecordNotFound {
                entity: "page record",
                id: payload.page_record_id.to_string(),
            })?;

        let Some(text) = page.page_text.clone().filter(|t| !t.trim().is_empty()) else {
            // Nothing to index or structure for a blank page
            self.repository.mark_page_structured(page.id).await?;
            maybe_enqueue_document_merge(
                &self.repository,
                &self.store,
                payload.document_id,
                payload.case_id,
            )
            .await?;
            return Ok(());
        };

        let vector = self.embedder.embed(&text).await?;
        self.repository
            .insert_page_embedding(
                payload.document_id,
                payload.case_id,
                payload.page_number,
                &text,
                &vector,
            )
            .await?;

        debug!(
            page_record_id = %page.id,
            dimension = vector.len(),
            "Page embedding stored"
        );

        self.completion
            .update(
                payload.case_id,
                payload.page_number,
                payload.total_pages,
                Stage::Embed,
            )
            .await?;

        let structure = StructureJob {
            page_record_id: payload.page_record_id,
            document_id: payload.document_id,
            case_id: payload.case_id,
            page_number: payload.page_number,
            total_pages: payload.total_pages,
        };
        self.store
            .enqueue(
                QUEUE_PAGE_STRUCTURE,
                "structure-page",
                serde_json::to_value(&structure)?,
                JobOptions::with_dedup_key(format!("structure:{}", payload.page_record_id)),
            )
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobProcessor for EmbedProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        self.embed(job).await
    }
}

/// page-structure queue processor
pub struct StructureProcessor {
    repository: Repository,
    store: Arc<dyn JobStore>,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn BundleExtractor>,
    completion: CompletionTracker,
    config: Arc<AppConfig>,
}

impl StructureProcessor {
    pub fn new(
        repository: Repository,
        store: Arc<dyn JobStore>,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn BundleExtractor>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            completion: CompletionTracker::new(repository.clone()),
            repository,
            store,
            embedder,
            extractor,
            config,
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn structure(&self, job: &Job) -> Result<()> {
        let payload: StructureJob = job.parse_payload()?;

        let page = self
            .repository
            .find_page_record(payload.page_record_id)
            .await?
            .ok_or_else(|| AppError::RecordNotFound {
                entity: "page record",
                id: payload.page_record_id.to_string(),
            })?;

        if page.structuring_done {
            debug!(page_record_id = %page.id, "Page already structured, skipping");
            return Ok(());
        }

        let Some(text) = page.page_text.clone().filter(|t| !t.trim().is_empty()) else {
            self.repository.mark_page_structured(page.id).await?;
            maybe_enqueue_document_merge(
                &self.repository,
                &self.store,
                payload.document_id,
                payload.case_id,
            )
            .await?;
            return Ok(());
        };

        // Query vector: the one stored at embed time, or a fresh one if the
        // embedding row went missing.
        let vector = match self
            .repository
            .page_embedding_vector(payload.document_id, payload.page_number)
            .await?
        {
            Some(vector) => vector,
            None => self.embedder.embed(&text).await?,
        };

        let neighbors = self
            .repository
            .nearest_pages(
                payload.case_id,
                &vector,
                self.config.extraction.context_pages,
            )
            .await?;
        let context = assemble_context(&neighbors, self.config.extraction.max_context_chars);

        let bundle = match self.extractor.extract(&text, &context).await {
            Ok(bundle) => bundle,
            Err(e) if matches!(e.kind(), ErrorKind::Schema | ErrorKind::Transient) => {
                // Skipped for this pass; a later scheduling cycle retries.
                warn!(
                    page_record_id = %page.id,
                    error = %e,
                    "Structured extraction skipped for this pass"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        info!(
            page_record_id = %page.id,
            patients = bundle.patients.len(),
            conditions = bundle.conditions.len(),
            claims = bundle.claims.len(),
            "Page bundle extracted"
        );

        self.repository
            .set_page_bundle(page.id, serde_json::to_value(&bundle)?)
            .await?;
        metrics::counter!("casetrace_bundles_extracted_total").increment(1);

        self.completion
            .update(
                payload.case_id,
                payload.page_number,
                payload.total_pages,
                Stage::Structure,
            )
            .await?;

        maybe_enqueue_document_merge(
            &self.repository,
            &self.store,
            payload.document_id,
            payload.case_id,
        )
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobProcessor for StructureProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        self.structure(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structure_job_round_trip() {
        let job = StructureJob {
            page_record_id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            case_id: Uuid::new_v4(),
            page_number: 4,
            total_pages: 9,
        };
        let value = serde_json::to_value(&job).unwrap();
        let parsed: StructureJob = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.page_record_id, job.page_record_id);
        assert_eq!(parsed.page_number, 4);
    }
}
