//! Local OCR via the Tesseract CLI
//!
//! Single-page PDFs are rasterized with pdftoppm first; single-frame images
//! go to Tesseract directly. Frames of multi-page image containers are left
//! to the cloud path, which reads the container natively.

use super::{PageOcrEngine, PageSource};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

pub struct TesseractEngine {
    tesseract_cmd: String,
    pdftoppm_cmd: String,
    language: String,
    dpi: u32,
}

impl TesseractEngine {
    pub fn new(config: &crate::config::OcrConfig) -> Self {
        Self {
            tesseract_cmd: config.tesseract_cmd.clone(),
            pdftoppm_cmd: config.pdftoppm_cmd.clone(),
            language: config.language.clone(),
            dpi: config.dpi,
        }
    }

    /// Rasterize a single-page PDF to PNG for Tesseract
    async fn rasterize_pdf(&self, pdf_path: &Path, out_dir: &Path) -> Result<PathBuf> {
        let out_prefix = out_dir.join("page");

        let output = Command::new(&self.pdftoppm_cmd)
            .arg("-png")
            .arg("-singlefile")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(pdf_path)
            .arg(&out_prefix)
            .output()
            .await
            .map_err(|e| AppError::OcrEngine {
                message: format!("Failed to run {}: {}", self.pdftoppm_cmd, e),
            })?;

        if !output.status.success() {
            return Err(AppError::OcrEngine {
                message: format!(
                    "{} exited with {}: {}",
                    self.pdftoppm_cmd,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(out_prefix.with_extension("png"))
    }

    async fn run_tesseract(&self, image_path: &Path) -> Result<String> {
        let output = Command::new(&self.tesseract_cmd)
            .arg(image_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .output()
            .await
            .map_err(|e| AppError::OcrEngine {
                message: format!("Failed to run {}: {}", self.tesseract_cmd, e),
            })?;

        if !output.status.success() {
            return Err(AppError::OcrEngine {
                message: format!(
                    "{} exited with {}: {}",
                    self.tesseract_cmd,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl PageOcrEngine for TesseractEngine {
    async fn recognize(&self, page: &PageSource) -> Result<String> {
        let scratch = tempfile::tempdir().map_err(|e| AppError::OcrEngine {
            message: format!("Failed to create scratch directory: {}", e),
        })?;

        let image_path = match page {
            PageSource::Pdf(bytes) => {
                let pdf_path = scratch.path().join("page.pdf");
                tokio::fs::write(&pdf_path, bytes)
                    .await
                    .map_err(|e| AppError::OcrEngine {
                        message: format!("Failed to stage page bytes: {}", e),
                    })?;
                self.rasterize_pdf(&pdf_path, scratch.path()).await?
            }
            PageSource::Image { bytes, frame } => {
                if *frame > 0 {
                    // Tesseract has no frame selector; later frames go to the
                    // cloud path instead.
                    warn!(frame, "Local OCR skips non-initial image frames");
                    return Ok(String::new());
                }
                let img_path = scratch.path().join("page.tif");
                tokio::fs::write(&img_path, bytes)
                    .await
                    .map_err(|e| AppError::OcrEngine {
                        message: format!("Failed to stage page bytes: {}", e),
                    })?;
                img_path
            }
        };

        let text = self.run_tesseract(&image_path).await?;
        debug!(chars = text.len(), "Local OCR finished");
        Ok(text)
    }
}
