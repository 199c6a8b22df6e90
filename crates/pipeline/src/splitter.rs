//! Page splitter
//!
//! Downloads a document's source bytes, determines the page count, and
//! enqueues exactly one page-processing job per page. Page records are not
//! created here; the first page-processing attempt creates them, so a failed
//! split can be retried without leaving duplicates behind.

use crate::native_text::count_pdf_pages;
use crate::page_extractor::PageJob;
use backoff::{future::retry, ExponentialBackoff};
use casetrace_common::config::PipelineConfig;
use casetrace_common::errors::{AppError, Result};
use casetrace_common::queue::{Job, JobOptions, JobProcessor, JobStore, QUEUE_PAGE_EXTRACT};
use casetrace_common::Repository;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Payload of a document-split job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitJob {
    pub document_id: Uuid,
    pub case_id: Uuid,
    pub document_url: String,
}

/// Container format of a source document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    /// Multi-page image container
    Tiff,
}

/// Sniff the container format from magic bytes
pub fn detect_format(bytes: &[u8]) -> Result<DocumentFormat> {
    if bytes.starts_with(b"%PDF") {
        return Ok(DocumentFormat::Pdf);
    }
    if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
        return Ok(DocumentFormat::Tiff);
    }
    Err(AppError::UnsupportedDocument {
        message: format!(
            "Unrecognized container (leading bytes {:02x?})",
            &bytes[..bytes.len().min(4)]
        ),
    })
}

/// Count the pages of a source document, special-casing multi-page image
/// containers.
pub fn count_pages(bytes: &[u8]) -> Result<usize> {
    match detect_format(bytes)? {
        DocumentFormat::Pdf => count_pdf_pages(bytes),
        DocumentFormat::Tiff => count_tiff_frames(bytes),
    }
}

fn count_tiff_frames(bytes: &[u8]) -> Result<usize> {
    let mut decoder =
        tiff::decoder::Decoder::new(Cursor::new(bytes)).map_err(|e| AppError::UnsupportedDocument {
            message: format!("Unreadable TIFF: {}", e),
        })?;

    let mut frames = 1;
    while decoder.more_images() {
        decoder
            .next_image()
            .map_err(|e| AppError::UnsupportedDocument {
                message: format!("Corrupt TIFF frame {}: {}", frames, e),
            })?;
        frames += 1;
    }
    Ok(frames)
}

/// Download source bytes with exponential backoff on transient failures.
/// Client errors (4xx) are permanent; everything else retries.
pub async fn download_document(
    client: &reqwest::Client,
    url: &str,
    max_elapsed: Duration,
) -> Result<Vec<u8>> {
    let policy = ExponentialBackoff {
        max_elapsed_time: Some(max_elapsed),
        ..Default::default()
    };

    retry(policy, || async {
        let response = client.get(url).send().await.map_err(|e| {
            backoff::Error::transient(AppError::Download {
                url: url.to_string(),
                message: e.to_string(),
            })
        })?;

        let status = response.status();
        if status.is_client_error() {
            return Err(backoff::Error::permanent(AppError::Download {
                url: url.to_string(),
                message: format!("HTTP {}", status),
            }));
        }
        if !status.is_success() {
            return Err(backoff::Error::transient(AppError::Download {
                url: url.to_string(),
                message: format!("HTTP {}", status),
            }));
        }

        let bytes = response.bytes().await.map_err(|e| {
            backoff::Error::transient(AppError::Download {
                url: url.to_string(),
                message: e.to_string(),
            })
        })?;

        Ok(bytes.to_vec())
    })
    .await
}

/// Document-split queue processor
pub struct SplitProcessor {
    repository: Repository,
    store: Arc<dyn JobStore>,
    client: reqwest::Client,
    config: PipelineConfig,
}

impl SplitProcessor {
    pub fn new(repository: Repository, store: Arc<dyn JobStore>, config: PipelineConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .build()
            .expect("reqwest client");

        Self {
            repository,
            store,
            client,
            config,
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn split(&self, job: &Job) -> Result<()> {
        let payload: SplitJob = job.parse_payload()?;

        let document = self
            .repository
            .find_document(payload.document_id)
            .await?
            .ok_or_else(|| AppError::RecordNotFound {
                entity: "document",
                id: payload.document_id.to_string(),
            })?;

        self.repository
            .set_case_state(payload.case_id, "Splitting document into pages")
            .await?;

        let bytes = download_document(
            &self.client,
            &payload.document_url,
            Duration::from_secs(self.config.download_max_elapsed_secs),
        )
        .await?;

        let total_pages = match count_pages(&bytes) {
            Ok(0) => {
                self.repository
                    .set_document_status(
                        document.id,
                        casetrace_common::db::models::DocumentStatus::Failed,
                        Some("document has no pages"),
                    )
                    .await?;
                return Err(AppError::EmptyDocument);
            }
            Ok(n) => n,
            Err(e) => {
                if !e.is_retryable() {
                    self.repository
                        .set_document_status(
                            document.id,
                            casetrace_common::db::models::DocumentStatus::Failed,
                            Some(&e.to_string()),
                        )
                        .await?;
                }
                return Err(e);
            }
        };

        info!(
            document_id = %document.id,
            total_pages,
            "Document split, enqueueing page jobs"
        );

        for page_number in 1..=total_pages {
            let page_job = PageJob {
                page_number: page_number as i32,
                total_pages: total_pages as i32,
                document_id: document.id,
                case_id: payload.case_id,
                document_url: payload.document_url.clone(),
            };

            // Dedup keyed per page: a re-run of the split after page jobs
            // already started cannot double-enqueue a page.
            let opts = JobOptions::with_dedup_key(format!(
                "page:{}:{}",
                document.id, page_number
            ));

            let enqueued = self
                .store
                .enqueue(
                    QUEUE_PAGE_EXTRACT,
                    "extract-page",
                    serde_json::to_value(&page_job)?,
                    opts,
                )
                .await?;

            if enqueued.is_none() {
                warn!(
                    document_id = %document.id,
                    page_number,
                    "Page job already enqueued, skipping"
                );
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl JobProcessor for SplitProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        self.split(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_pdf;

    #[test]
    fn test_detect_pdf_format() {
        let bytes = sample_pdf(&["hello"]);
        assert_eq!(detect_format(&bytes).unwrap(), DocumentFormat::Pdf);
    }

    #[test]
    fn test_detect_tiff_format() {
        assert_eq!(
            detect_format(b"II*\0restofheader").unwrap(),
            DocumentFormat::Tiff
        );
        assert_eq!(
            detect_format(b"MM\0*restofheader").unwrap(),
            DocumentFormat::Tiff
        );
    }

    #[test]
    fn test_unknown_format_is_unsupported() {
        let err = detect_format(b"GIF89a").unwrap_err();
        assert!(matches!(err, AppError::UnsupportedDocument { .. }));
    }

    #[test]
    fn test_count_pages_pdf() {
        let bytes = sample_pdf(&["a", "b", "c", "d"]);
        assert_eq!(count_pages(&bytes).unwrap(), 4);
    }

    #[test]
    fn test_split_job_payload_round_trip() {
        let job = SplitJob {
            document_id: Uuid::new_v4(),
            case_id: Uuid::new_v4(),
            document_url: "https://records.example.com/case/doc.pdf".to_string(),
        };
        let value = serde_json::to_value(&job).unwrap();
        let parsed: SplitJob = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.document_id, job.document_id);
        assert_eq!(parsed.document_url, job.document_url);
    }
}
