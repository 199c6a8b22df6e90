//! Error types for Casetrace services
//!
//! Provides:
//! - Distinct error types for different failure modes
//! - A retry classification consulted by the queue workers
//! - Structured error messages for the operator-visible failed-job list

use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Retry classification for an error.
///
/// Workers consult this to decide between retry-with-backoff, terminal
/// failure, and skip-this-pass semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, rate-limit, timeout - retried with exponential backoff.
    Transient,
    /// Unsupported format or exhausted provider attempts - fails the
    /// page/document terminally.
    Permanent,
    /// Structured extraction produced output that does not fit the schema -
    /// the page is skipped for the current pass and retried on a later
    /// scheduling cycle.
    Schema,
    /// Missing parent Document/Case - the job fails immediately, no retry.
    Consistency,
    /// Bug or misconfiguration.
    Internal,
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // Data-consistency errors
    #[error("Record not found: {entity} with id {id}")]
    RecordNotFound { entity: &'static str, id: String },

    // Queue errors
    #[error("Queue error: {message}")]
    Queue { message: String },

    // Source document errors
    #[error("Download failed for {url}: {message}")]
    Download { url: String, message: String },

    #[error("Unsupported document format: {message}")]
    UnsupportedDocument { message: String },

    #[error("PDF error: {message}")]
    Pdf { message: String },

    #[error("Document has no pages")]
    EmptyDocument,

    // OCR errors
    #[error("OCR engine error: {message}")]
    OcrEngine { message: String },

    #[error("OCR analysis failed: {message}")]
    OcrFailed { message: String },

    // Provider errors
    #[error("Embedding service error: {message}")]
    Embedding { message: String },

    #[error("Extraction provider error: {message}")]
    Extraction { message: String },

    #[error("Extraction output failed schema validation: {message}")]
    SchemaValidation { message: String },

    // Progress accounting
    #[error("Invalid progress input: {message}")]
    InvalidProgress { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Classify this error for retry handling.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Configuration { .. } | AppError::Internal { .. } => ErrorKind::Internal,

            AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::Queue { .. }
            | AppError::Download { .. }
            | AppError::OcrEngine { .. }
            | AppError::Embedding { .. }
            | AppError::Extraction { .. }
            | AppError::HttpClient(_) => ErrorKind::Transient,

            AppError::UnsupportedDocument { .. }
            | AppError::Pdf { .. }
            | AppError::EmptyDocument
            | AppError::OcrFailed { .. }
            | AppError::InvalidProgress { .. } => ErrorKind::Permanent,

            AppError::SchemaValidation { .. } => ErrorKind::Schema,

            AppError::RecordNotFound { .. } => ErrorKind::Consistency,

            AppError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Whether the queue layer should retry the job carrying this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Queue {
            message: format!("Redis error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        let err = AppError::Download {
            url: "https://example.com/doc.pdf".to_string(),
            message: "connection reset".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_permanent_errors_are_not_retryable() {
        let err = AppError::UnsupportedDocument {
            message: "encrypted PDF".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_missing_parent_is_consistency() {
        let err = AppError::RecordNotFound {
            entity: "document",
            id: "7c1dd2a0".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_schema_errors_skip_the_pass() {
        let err = AppError::SchemaValidation {
            message: "conditions[0].code missing".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(!err.is_retryable());
    }
}
