//! Cloud OCR via AWS Textract asynchronous text detection
//!
//! Textract's async API reads from S3, so submit uploads the page bytes
//! first. Results are paginated by a continuation token; line blocks are
//! concatenated in block order.

use super::{AnalysisClient, AnalysisOutcome, PageSource};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_textract::types::{Block, BlockType, DocumentLocation, JobStatus, S3Object};
use tracing::{debug, info};

pub struct TextractClient {
    textract: aws_sdk_textract::Client,
    s3: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl TextractClient {
    pub fn new(
        textract: aws_sdk_textract::Client,
        s3: aws_sdk_s3::Client,
        config: &crate::config::OcrConfig,
    ) -> Result<Self> {
        let bucket = config
            .s3_bucket
            .clone()
            .ok_or_else(|| AppError::Configuration {
                message: "ocr.s3_bucket is required for cloud analysis".to_string(),
            })?;

        Ok(Self {
            textract,
            s3,
            bucket,
            prefix: config.s3_prefix.clone(),
        })
    }

    /// Build both AWS clients from the ambient AWS configuration
    pub async fn from_env(config: &crate::config::OcrConfig) -> Result<Self> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(
            aws_sdk_textract::Client::new(&aws_config),
            aws_sdk_s3::Client::new(&aws_config),
            config,
        )
    }

    fn object_key(&self, reference: &str, page: &PageSource) -> String {
        let ext = match page {
            PageSource::Pdf(_) => "pdf",
            PageSource::Image { .. } => "tif",
        };
        format!("{}/{}.{}", self.prefix, reference, ext)
    }
}

#[async_trait]
impl AnalysisClient for TextractClient {
    async fn start_analysis(&self, page: &PageSource, reference: &str) -> Result<String> {
        let key = self.object_key(reference, page);
        let bytes = match page {
            PageSource::Pdf(bytes) => bytes.clone(),
            PageSource::Image { bytes, .. } => bytes.clone(),
        };

        self.s3
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| AppError::OcrEngine {
                message: format!(
                    "S3 upload failed: {}",
                    aws_sdk_s3::error::DisplayErrorContext(&e)
                ),
            })?;

        let response = self
            .textract
            .start_document_text_detection()
            .document_location(
                DocumentLocation::builder()
                    .s3_object(
                        S3Object::builder()
                            .bucket(&self.bucket)
                            .name(&key)
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                let message = format!("{}", aws_sdk_textract::error::DisplayErrorContext(&e));
                if message.contains("UnsupportedDocument") {
                    AppError::UnsupportedDocument { message }
                } else {
                    AppError::OcrEngine { message }
                }
            })?;

        let job_id = response.job_id().unwrap_or_default().to_string();
        if job_id.is_empty() {
            return Err(AppError::OcrEngine {
                message: "Textract returned an empty job id".to_string(),
            });
        }

        info!(job_id = %job_id, key = %key, "Analysis job submitted");
        Ok(job_id)
    }

    async fn fetch_analysis(&self, job_id: &str) -> Result<AnalysisOutcome> {
        let mut next_token: Option<String> = None;
        let mut lines: Vec<String> = Vec::new();

        loop {
            let response = self
                .textract
                .get_document_text_detection()
                .job_id(job_id)
                .set_next_token(next_token.clone())
                .send()
                .await
                .map_err(|e| AppError::OcrEngine {
                    message: format!(
                        "Analysis query failed: {}",
                        aws_sdk_textract::error::DisplayErrorContext(&e)
                    ),
                })?;

            match response.job_status() {
                Some(JobStatus::InProgress) => return Ok(AnalysisOutcome::InProgress),
                Some(JobStatus::Succeeded) | Some(JobStatus::PartialSuccess) => {}
                Some(JobStatus::Failed) => {
                    let message = response
                        .status_message()
                        .unwrap_or("analysis failed")
                        .to_string();
                    let unsupported = message.contains("UNSUPPORTED")
                        || message.contains("UnsupportedDocument");
                    return Ok(AnalysisOutcome::Failed {
                        message,
                        unsupported,
                    });
                }
                other => {
                    return Err(AppError::OcrEngine {
                        message: format!("Unexpected analysis status: {:?}", other),
                    })
                }
            }

            lines.extend(lines_from_blocks(response.blocks()));

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(job_id = %job_id, line_count = lines.len(), "Analysis result assembled");
        Ok(AnalysisOutcome::Succeeded {
            text: lines.join("\n"),
        })
    }
}

/// Pull the text of LINE blocks, preserving block order
fn lines_from_blocks(blocks: &[Block]) -> Vec<String> {
    blocks
        .iter()
        .filter(|b| b.block_type() == Some(&BlockType::Line))
        .filter_map(|b| b.text().map(ToString::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_from_blocks_filters_non_lines() {
        let blocks = vec![
            Block::builder()
                .block_type(BlockType::Page)
                .build(),
            Block::builder()
                .block_type(BlockType::Line)
                .text("PATIENT: DIAZ, MARIA")
                .build(),
            Block::builder()
                .block_type(BlockType::Word)
                .text("PATIENT:")
                .build(),
            Block::builder()
                .block_type(BlockType::Line)
                .text("DOB: 01/31/1960")
                .build(),
        ];

        let lines = lines_from_blocks(&blocks);
        assert_eq!(lines, vec!["PATIENT: DIAZ, MARIA", "DOB: 01/31/1960"]);
    }
}
