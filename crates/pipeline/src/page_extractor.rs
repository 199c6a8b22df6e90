//! Page text extractor
//!
//! Per page, tries extraction strategies in a fixed priority order: native
//! PDF text, then local OCR, then the asynchronous cloud path. The record
//! tracks which strategy won. Pages resolved synchronously continue straight
//! to embedding; the cloud path parks the page behind a polling schedule.

use crate::completion::{CompletionTracker, Stage};
use crate::merge::maybe_enqueue_document_merge;
use crate::native_text;
use crate::ocr_poller::PollJob;
use crate::splitter::{detect_format, download_document, DocumentFormat};
use casetrace_common::config::AppConfig;
use casetrace_common::errors::{AppError, Result};
use casetrace_common::metrics::record_page_processed;
use casetrace_common::ocr::{AnalysisClient, PageOcrEngine, PageSource};
use casetrace_common::queue::{
    Job, JobOptions, JobProcessor, JobStore, ScheduleTemplate, QUEUE_OCR_POLL, QUEUE_PAGE_EMBED,
};
use casetrace_common::Repository;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Payload of a page-extract job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageJob {
    pub page_number: i32,
    pub total_pages: i32,
    pub document_id: Uuid,
    pub case_id: Uuid,
    pub document_url: String,
}

/// Payload of a page-embed job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedJob {
    pub page_record_id: Uuid,
    pub document_id: Uuid,
    pub case_id: Uuid,
    pub page_number: i32,
    pub total_pages: i32,
}

/// Which strategy resolved a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    Native,
    LocalOcr,
    CloudOcr,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Native => "native",
            ExtractionMethod::LocalOcr => "local_ocr",
            ExtractionMethod::CloudOcr => "cloud_ocr",
        }
    }
}

/// Uniform contract over the synchronous extraction strategies.
/// `Ok(None)` means "nothing found, try the next one"; errors are logged and
/// also fall through, so a broken strategy never blocks the chain.
#[async_trait::async_trait]
pub trait TextExtractionStrategy: Send + Sync {
    fn method(&self) -> ExtractionMethod;
    async fn extract(&self, page: &PageSource) -> Result<Option<String>>;
}

/// Native PDF text extraction on the sliced page
pub struct NativeTextStrategy;

#[async_trait::async_trait]
impl TextExtractionStrategy for NativeTextStrategy {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Native
    }

    async fn extract(&self, page: &PageSource) -> Result<Option<String>> {
        match page {
            PageSource::Pdf(bytes) => native_text::extract_page_text(bytes, 1),
            // Image containers have no embedded text layer
            PageSource::Image { .. } => Ok(None),
        }
    }
}

/// Local OCR behind the `PageOcrEngine` seam
pub struct LocalOcrStrategy {
    engine: Arc<dyn PageOcrEngine>,
}

impl LocalOcrStrategy {
    pub fn new(engine: Arc<dyn PageOcrEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl TextExtractionStrategy for LocalOcrStrategy {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::LocalOcr
    }

    async fn extract(&self, page: &PageSource) -> Result<Option<String>> {
        let text = self.engine.recognize(page).await?;
        if text.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(text))
        }
    }
}

/// Walk the strategy chain in priority order. A strategy error is logged and
/// the chain continues; only an empty chain result falls through to the
/// cloud path.
pub async fn resolve_text(
    strategies: &[Arc<dyn TextExtractionStrategy>],
    page: &PageSource,
) -> Option<(ExtractionMethod, String)> {
    for strategy in strategies {
        match strategy.extract(page).await {
            Ok(Some(text)) if !text.trim().is_empty() => {
                return Some((strategy.method(), text));
            }
            Ok(_) => {
                debug!(method = strategy.method().as_str(), "Strategy found no text");
            }
            Err(e) => {
                warn!(
                    method = strategy.method().as_str(),
                    error = %e,
                    "Strategy failed, falling through"
                );
            }
        }
    }
    None
}

/// Page-extract queue processor
pub struct PageExtractProcessor {
    repository: Repository,
    store: Arc<dyn JobStore>,
    analysis: Arc<dyn AnalysisClient>,
    strategies: Vec<Arc<dyn TextExtractionStrategy>>,
    completion: CompletionTracker,
    client: reqwest::Client,
    config: Arc<AppConfig>,
}

impl PageExtractProcessor {
    pub fn new(
        repository: Repository,
        store: Arc<dyn JobStore>,
        analysis: Arc<dyn AnalysisClient>,
        local_ocr: Option<Arc<dyn PageOcrEngine>>,
        config: Arc<AppConfig>,
    ) -> Self {
        let mut strategies: Vec<Arc<dyn TextExtractionStrategy>> = vec![Arc::new(NativeTextStrategy)];
        if let Some(engine) = local_ocr {
            strategies.push(Arc::new(LocalOcrStrategy::new(engine)));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.pipeline.download_timeout_secs))
            .build()
            .expect("reqwest client");

        Self {
            completion: CompletionTracker::new(repository.clone()),
            repository,
            store,
            analysis,
            strategies,
            client,
            config,
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn extract(&self, job: &Job) -> Result<()> {
        let payload: PageJob = job.parse_payload()?;

        self.repository
            .find_document(payload.document_id)
            .await?
            .ok_or_else(|| AppError::RecordNotFound {
                entity: "document",
                id: payload.document_id.to_string(),
            })?;

        // A retried job whose earlier attempt already resolved the page
        if let Some(existing) = self
            .repository
            .page_by_number(payload.document_id, payload.page_number)
            .await?
        {
            if existing.is_completed || existing.ocr_job_id.is_some() {
                debug!(
                    page_record_id = %existing.id,
                    "Page already resolved or awaiting analysis, skipping"
                );
                return Ok(());
            }
        }

        let bytes = download_document(
            &self.client,
            &payload.document_url,
            Duration::from_secs(self.config.pipeline.download_max_elapsed_secs),
        )
        .await?;

        let page = build_page_source(&bytes, payload.page_number)?;

        let record = self
            .repository
            .find_or_create_page_record(
                payload.document_id,
                payload.case_id,
                payload.page_number,
                payload.total_pages,
                match &page {
                    PageSource::Pdf(b) => b.clone(),
                    PageSource::Image { bytes, .. } => bytes.clone(),
                },
            )
            .await?;

        match resolve_text(&self.strategies, &page).await {
            Some((method, text)) => {
                info!(
                    page_record_id = %record.id,
                    method = method.as_str(),
                    chars = text.len(),
                    "Page resolved synchronously"
                );
                self.repository
                    .resolve_page(record.id, &text, method.as_str())
                    .await?;
                record_page_processed(method.as_str());
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
                    record.id,
                    &text,
                )
                .await
            }
            None => self.submit_cloud_analysis(&payload, record.id, &page).await,
        }
    }

    /// Submit the asynchronous analysis job and register its polling
    /// schedule, keyed per page so registration is idempotent.
    async fn submit_cloud_analysis(
        &self,
        payload: &PageJob,
        page_record_id: Uuid,
        page: &PageSource,
    ) -> Result<()> {
        let analysis_job_id = self
            .analysis
            .start_analysis(page, &page_record_id.to_string())
            .await?;

        self.repository
            .set_page_ocr_job(page_record_id, &analysis_job_id)
            .await?;

        let poll = PollJob {
            page_record_id,
            document_id: payload.document_id,
            case_id: payload.case_id,
            page_number: payload.page_number,
            total_pages: payload.total_pages,
            attempt: 0,
        };
        self.store
            .upsert_schedule(
                &format!("ocr-poll:{}", page_record_id),
                self.config.ocr_poll_interval(),
                ScheduleTemplate {
                    queue: QUEUE_OCR_POLL.to_string(),
                    name: "poll-analysis".to_string(),
                    payload: serde_json::to_value(&poll)?,
                    max_attempts: 1,
                },
            )
            .await?;

        metrics::counter!("casetrace_analysis_jobs_submitted_total").increment(1);
        info!(
            page_record_id = %page_record_id,
            analysis_job_id = %analysis_job_id,
            "Page parked behind analysis polling"
        );
        Ok(())
    }
}

/// Advance a page that just resolved to text, from either the synchronous
/// chain or the cloud poller: pages with text continue to embedding, blank
/// pages finish their per-page journey on the spot.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn advance_resolved_page(
    repository: &Repository,
    store: &Arc<dyn JobStore>,
    document_id: Uuid,
    case_id: Uuid,
    page_number: i32,
    total_pages: i32,
    page_record_id: Uuid,
    text: &str,
) -> Result<()> {
    if text.trim().is_empty() {
        repository.mark_page_structured(page_record_id).await?;
        maybe_enqueue_document_merge(repository, store, document_id, case_id).await?;
        return Ok(());
    }

    let embed = EmbedJob {
        page_record_id,
        document_id,
        case_id,
        page_number,
        total_pages,
    };
    store
        .enqueue(
            QUEUE_PAGE_EMBED,
            "embed-page",
            serde_json::to_value(&embed)?,
            JobOptions::with_dedup_key(format!("embed:{}", page_record_id)),
        )
        .await?;
    Ok(())
}

/// Slice one page out of the source container
fn build_page_source(bytes: &[u8], page_number: i32) -> Result<PageSource> {
    match detect_format(bytes)? {
        DocumentFormat::Pdf => Ok(PageSource::Pdf(native_text::slice_page(
            bytes,
            page_number as u32,
        )?)),
        DocumentFormat::Tiff => Ok(PageSource::Image {
            bytes: bytes.to_vec(),
            frame: (page_number - 1).max(0) as usize,
        }),
    }
}

#[async_trait::async_trait]
impl JobProcessor for PageExtractProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        self.extract(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_pdf;

    struct FixedStrategy {
        method: ExtractionMethod,
        result: Option<&'static str>,
        fails: bool,
    }

    #[async_trait::async_trait]
    impl TextExtractionStrategy for FixedStrategy {
        fn method(&self) -> ExtractionMethod {
            self.method
        }

        async fn extract(&self, _page: &PageSource) -> Result<Option<String>> {
            if self.fails {
                return Err(AppError::OcrEngine {
                    message: "engine unavailable".to_string(),
                });
            }
            Ok(self.result.map(ToString::to_string))
        }
    }

    fn page() -> PageSource {
        PageSource::Pdf(sample_pdf(&["ignored"]))
    }

    #[tokio::test]
    async fn test_first_strategy_with_text_wins() {
        let strategies: Vec<Arc<dyn TextExtractionStrategy>> = vec![
            Arc::new(FixedStrategy {
                method: ExtractionMethod::Native,
                result: Some("native text"),
                fails: false,
            }),
            Arc::new(FixedStrategy {
                method: ExtractionMethod::LocalOcr,
                result: Some("ocr text"),
                fails: false,
            }),
        ];

        let (method, text) = resolve_text(&strategies, &page()).await.unwrap();
        assert_eq!(method, ExtractionMethod::Native);
        assert_eq!(text, "native text");
    }

    #[tokio::test]
    async fn test_empty_result_falls_through_to_next_strategy() {
        let strategies: Vec<Arc<dyn TextExtractionStrategy>> = vec![
            Arc::new(FixedStrategy {
                method: ExtractionMethod::Native,
                result: None,
                fails: false,
            }),
            Arc::new(FixedStrategy {
                method: ExtractionMethod::LocalOcr,
                result: Some("recovered by ocr"),
                fails: false,
            }),
        ];

        let (method, text) = resolve_text(&strategies, &page()).await.unwrap();
        assert_eq!(method, ExtractionMethod::LocalOcr);
        assert_eq!(text, "recovered by ocr");
    }

    #[tokio::test]
    async fn test_strategy_error_does_not_break_the_chain() {
        let strategies: Vec<Arc<dyn TextExtractionStrategy>> = vec![
            Arc::new(FixedStrategy {
                method: ExtractionMethod::Native,
                fails: true,
                result: None,
            }),
            Arc::new(FixedStrategy {
                method: ExtractionMethod::LocalOcr,
                result: Some("still extracted"),
                fails: false,
            }),
        ];

        let resolved = resolve_text(&strategies, &page()).await;
        assert_eq!(resolved.unwrap().0, ExtractionMethod::LocalOcr);
    }

    #[tokio::test]
    async fn test_exhausted_chain_returns_none() {
        let strategies: Vec<Arc<dyn TextExtractionStrategy>> = vec![Arc::new(FixedStrategy {
            method: ExtractionMethod::Native,
            result: None,
            fails: false,
        })];

        assert!(resolve_text(&strategies, &page()).await.is_none());
    }

    #[tokio::test]
    async fn test_native_strategy_reads_sliced_page() {
        let page = PageSource::Pdf(sample_pdf(&["Discharge summary for patient"]));
        let strategy = NativeTextStrategy;
        let text = strategy.extract(&page).await.unwrap().unwrap();
        assert!(text.contains("Discharge summary"));
    }

    #[tokio::test]
    async fn test_native_strategy_skips_image_frames() {
        let page = PageSource::Image {
            bytes: vec![0x49, 0x49, 0x2a, 0x00],
            frame: 0,
        };
        assert!(NativeTextStrategy.extract(&page).await.unwrap().is_none());
    }

    #[test]
    fn test_build_page_source_slices_pdf() {
        let bytes = sample_pdf(&["one", "two"]);
        match build_page_source(&bytes, 2).unwrap() {
            PageSource::Pdf(sliced) => {
                assert_eq!(crate::native_text::count_pdf_pages(&sliced).unwrap(), 1);
            }
            other => panic!("expected pdf page source, got {:?}", other),
        }
    }
}
