//! OCR collaborators
//!
//! Two seams, matching the two fallback paths of the page text extractor:
//! - `PageOcrEngine`: local, synchronous within the calling job (Tesseract)
//! - `AnalysisClient`: cloud, asynchronous submit/poll (Textract)

mod tesseract;
mod textract;

pub use tesseract::TesseractEngine;
pub use textract::TextractClient;

use crate::errors::Result;
use async_trait::async_trait;

/// Raw bytes of a single page, tagged with their container format
#[derive(Debug, Clone)]
pub enum PageSource {
    /// A single-page PDF sliced out of the source document
    Pdf(Vec<u8>),
    /// One frame of a multi-page image container (whole container bytes plus
    /// the 0-based frame index)
    Image { bytes: Vec<u8>, frame: usize },
}

impl PageSource {
    pub fn len(&self) -> usize {
        match self {
            PageSource::Pdf(bytes) => bytes.len(),
            PageSource::Image { bytes, .. } => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Local OCR engine: page in, text out, within the calling job
#[async_trait]
pub trait PageOcrEngine: Send + Sync {
    async fn recognize(&self, page: &PageSource) -> Result<String>;
}

/// Outcome of polling an asynchronous analysis job
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    InProgress,
    Succeeded { text: String },
    Failed { message: String, unsupported: bool },
}

/// Cloud document-analysis collaborator: submit returns an opaque job id,
/// results are fetched by id until the job resolves
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    /// Submit a page for analysis; `reference` names the artifact upstream
    async fn start_analysis(&self, page: &PageSource, reference: &str) -> Result<String>;

    /// Query the analysis job; pagination by continuation token is handled
    /// internally and the assembled text is returned whole
    async fn fetch_analysis(&self, job_id: &str) -> Result<AnalysisOutcome>;
}
