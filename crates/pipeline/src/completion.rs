//! Completion tracker
//!
//! Each page contributes `100 / total_pages`, scaled down by the number of
//! documents in the case and the number of pipeline stages a page passes
//! through. Increments are applied database-side and capped at 95; the last
//! 5% belongs to the final case-level merge, which alone writes 100.

use casetrace_common::errors::{AppError, Result};
use casetrace_common::Repository;
use tracing::debug;
use uuid::Uuid;

/// Pipeline stages a page passes through for progress accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Embed,
    Structure,
}

/// Number of per-page stages contributing to completion
pub const STAGE_COUNT: u32 = 3;

impl Stage {
    pub fn label(&self, page_number: i32, total_pages: i32) -> String {
        match self {
            Stage::Extract => format!("Extracting text from page {} of {}", page_number, total_pages),
            Stage::Embed => format!("Indexing page {} of {}", page_number, total_pages),
            Stage::Structure => format!("Structuring page {} of {}", page_number, total_pages),
        }
    }
}

/// Whole-percentage contribution of one page completing one stage.
///
/// `total_pages == 0` and `document_count == 0` are defined errors, never a
/// division by zero.
pub fn page_contribution(total_pages: i32, document_count: u64) -> Result<i32> {
    if total_pages <= 0 {
        return Err(AppError::InvalidProgress {
            message: format!("total_pages must be positive, got {}", total_pages),
        });
    }
    if document_count == 0 {
        return Err(AppError::InvalidProgress {
            message: "case has no documents".to_string(),
        });
    }

    let per_page = 100.0 / total_pages as f64;
    let scaled = per_page / (document_count as f64 * STAGE_COUNT as f64);
    Ok(scaled.round() as i32)
}

/// Capping rule mirrored by the repository's atomic update
pub fn capped_completion(current: i32, delta: i32) -> i32 {
    (current + delta).min(95)
}

/// Applies completion increments and stage labels for a case
#[derive(Clone)]
pub struct CompletionTracker {
    repository: Repository,
}

impl CompletionTracker {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    /// Record one page finishing one stage.
    pub async fn update(
        &self,
        case_id: Uuid,
        page_number: i32,
        total_pages: i32,
        stage: Stage,
    ) -> Result<()> {
        let document_count = self.repository.case_document_count(case_id).await?;
        let points = page_contribution(total_pages, document_count)?;

        if points > 0 {
            self.repository
                .increment_case_completion(case_id, points)
                .await?;
        }
        self.repository
            .set_case_state(case_id, &stage.label(page_number, total_pages))
            .await?;

        debug!(
            case_id = %case_id,
            page_number,
            total_pages,
            ?stage,
            points,
            "Completion updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_pages_is_a_defined_error() {
        let err = page_contribution(0, 1).unwrap_err();
        assert!(matches!(err, AppError::InvalidProgress { .. }));
    }

    #[test]
    fn test_zero_documents_is_a_defined_error() {
        let err = page_contribution(10, 0).unwrap_err();
        assert!(matches!(err, AppError::InvalidProgress { .. }));
    }

    #[test]
    fn test_single_page_single_document() {
        // 100 / 1 page / (1 doc * 3 stages) = 33.3 -> 33
        assert_eq!(page_contribution(1, 1).unwrap(), 33);
    }

    #[test]
    fn test_contribution_scales_with_pages_and_documents() {
        // 100 / 10 pages / (2 docs * 3 stages) = 1.67 -> 2
        assert_eq!(page_contribution(10, 2).unwrap(), 2);
        // Large documents round to zero per stage
        assert_eq!(page_contribution(200, 3).unwrap(), 0);
    }

    #[test]
    fn test_completion_is_monotonic_and_capped() {
        let mut completion = 0;
        let delta = page_contribution(1, 1).unwrap();

        for _ in 0..10 {
            let next = capped_completion(completion, delta);
            assert!(next >= completion);
            assert!(next <= 95);
            completion = next;
        }
        assert_eq!(completion, 95);
    }

    #[test]
    fn test_cap_holds_until_final_merge() {
        // Even an absurd increment cannot cross 95
        assert_eq!(capped_completion(94, 50), 95);
        assert_eq!(capped_completion(0, 100), 95);
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(
            Stage::Extract.label(3, 12),
            "Extracting text from page 3 of 12"
        );
        assert_eq!(Stage::Structure.label(1, 1), "Structuring page 1 of 1");
    }
}
