//! Repository pattern for database operations
//!
//! All pipeline state lives here: cases, documents, page records and page
//! embeddings. Completion updates are database-side atomic increments so
//! concurrently finishing pages never lose progress to a read-modify-write
//! race.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbBackend, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, Statement,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A neighboring page returned by vector search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageNeighbor {
    pub document_id: Uuid,
    pub page_number: i32,
    pub page_text: String,
    pub distance: f64,
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Case Operations
    // ========================================================================

    /// Create a new case
    pub async fn create_case(&self, organization_id: Uuid, owner_id: Uuid) -> Result<Case> {
        let now = chrono::Utc::now();

        let case = CaseActiveModel {
            id: Set(Uuid::new_v4()),
            organization_id: Set(organization_id),
            owner_id: Set(owner_id),
            status: Set(CaseStatus::New as i32),
            cron_status: Set(CronStatus::Pending.into()),
            percentage_completion: Set(0),
            current_extraction_state: Set(None),
            merged_bundle: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        case.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find case by ID
    pub async fn find_case(&self, id: Uuid) -> Result<Option<Case>> {
        CaseEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Atomically claim the oldest pending case for processing.
    ///
    /// The conditional update is the idempotency guard for the scheduled
    /// tick: while a case is `processing`, repeated ticks cannot claim it
    /// again, and concurrent ticks cannot claim the same case twice.
    pub async fn claim_next_pending_case(&self) -> Result<Option<Case>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE cases
            SET cron_status = 'processing', status = $1, updated_at = NOW()
            WHERE id = (
                SELECT id FROM cases
                WHERE cron_status = 'pending'
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
            vec![(CaseStatus::InProgress as i32).into()],
        );

        CaseEntity::find()
            .from_raw_sql(stmt)
            .one(self.write_conn())
            .await
            .map_err(Into::into)
    }

    /// Cases currently claimed by the orchestrator
    pub async fn processing_case_ids(&self) -> Result<Vec<Uuid>> {
        let cases = CaseEntity::find()
            .filter(CaseColumn::CronStatus.eq(String::from(CronStatus::Processing)))
            .order_by_asc(CaseColumn::CreatedAt)
            .all(self.read_conn())
            .await?;
        Ok(cases.into_iter().map(|c| c.id).collect())
    }

    /// Write the human-readable current pipeline stage for a case
    pub async fn set_case_state(&self, case_id: Uuid, label: &str) -> Result<()> {
        CaseEntity::update_many()
            .col_expr(CaseColumn::CurrentExtractionState, Expr::value(label))
            .col_expr(CaseColumn::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(CaseColumn::Id.eq(case_id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    /// Atomically add completion points to a case, capped at 95.
    ///
    /// The cap reserves the last 5% for the final case-level merge, which is
    /// the only writer allowed to set 100.
    pub async fn increment_case_completion(&self, case_id: Uuid, points: i32) -> Result<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE cases
            SET percentage_completion = LEAST(95, percentage_completion + $2),
                updated_at = NOW()
            WHERE id = $1
            "#,
            vec![case_id.into(), points.into()],
        );

        use sea_orm::ConnectionTrait;
        self.write_conn().execute(stmt).await?;
        Ok(())
    }

    /// Final merge step: set 100% completion, the merged bundle, and
    /// `cron_status = processed`.
    pub async fn finalize_case(&self, case_id: Uuid, bundle: serde_json::Value) -> Result<()> {
        CaseEntity::update_many()
            .col_expr(CaseColumn::PercentageCompletion, Expr::value(100))
            .col_expr(
                CaseColumn::CronStatus,
                Expr::value(String::from(CronStatus::Processed)),
            )
            .col_expr(CaseColumn::MergedBundle, Expr::value(bundle))
            .col_expr(
                CaseColumn::CurrentExtractionState,
                Expr::value("Extraction complete"),
            )
            .col_expr(CaseColumn::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(CaseColumn::Id.eq(case_id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    // ========================================================================
    // Document Operations
    // ========================================================================

    /// Create a new document under a case
    pub async fn create_document(&self, case_id: Uuid, source_url: String) -> Result<Document> {
        let now = chrono::Utc::now();

        let document = DocumentActiveModel {
            id: Set(Uuid::new_v4()),
            case_id: Set(case_id),
            source_url: Set(source_url),
            status: Set(DocumentStatus::Pending.into()),
            is_completed: Set(false),
            merged_bundle: Set(None),
            raw_text: Set(None),
            failure_reason: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        document.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find document by ID
    pub async fn find_document(&self, id: Uuid) -> Result<Option<Document>> {
        DocumentEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// All documents of a case, in insertion order
    pub async fn documents_for_case(&self, case_id: Uuid) -> Result<Vec<Document>> {
        DocumentEntity::find()
            .filter(DocumentColumn::CaseId.eq(case_id))
            .order_by_asc(DocumentColumn::CreatedAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Number of documents in a case
    pub async fn case_document_count(&self, case_id: Uuid) -> Result<u64> {
        DocumentEntity::find()
            .filter(DocumentColumn::CaseId.eq(case_id))
            .count(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Documents of a case that are not yet finalized (not success+completed)
    pub async fn unfinalized_document_count(&self, case_id: Uuid) -> Result<u64> {
        DocumentEntity::find()
            .filter(DocumentColumn::CaseId.eq(case_id))
            .filter(
                Condition::any()
                    .add(DocumentColumn::Status.ne(String::from(DocumentStatus::Success)))
                    .add(DocumentColumn::IsCompleted.eq(false)),
            )
            .count(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Set document status, optionally with a failure reason
    pub async fn set_document_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        DocumentEntity::update_many()
            .col_expr(DocumentColumn::Status, Expr::value(String::from(status)))
            .col_expr(
                DocumentColumn::FailureReason,
                Expr::value(failure_reason.map(ToString::to_string)),
            )
            .col_expr(DocumentColumn::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(DocumentColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    /// Terminal success: store the merged bundle and the concatenated text
    pub async fn finalize_document(
        &self,
        id: Uuid,
        bundle: serde_json::Value,
        raw_text: String,
    ) -> Result<()> {
        DocumentEntity::update_many()
            .col_expr(
                DocumentColumn::Status,
                Expr::value(String::from(DocumentStatus::Success)),
            )
            .col_expr(DocumentColumn::IsCompleted, Expr::value(true))
            .col_expr(DocumentColumn::MergedBundle, Expr::value(bundle))
            .col_expr(DocumentColumn::RawText, Expr::value(raw_text))
            .col_expr(DocumentColumn::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(DocumentColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    // ========================================================================
    // Page Record Operations
    // ========================================================================

    /// Find an existing page record or create a fresh one.
    ///
    /// Keyed on (document_id, page_number) so a retried page job reuses the
    /// record it created on an earlier attempt.
    pub async fn find_or_create_page_record(
        &self,
        document_id: Uuid,
        case_id: Uuid,
        page_number: i32,
        total_pages: i32,
        raw_bytes: Vec<u8>,
    ) -> Result<PageRecord> {
        if let Some(existing) = self.page_by_number(document_id, page_number).await? {
            return Ok(existing);
        }

        let now = chrono::Utc::now();
        let record = PageRecordActiveModel {
            id: Set(Uuid::new_v4()),
            document_id: Set(document_id),
            case_id: Set(case_id),
            page_number: Set(page_number),
            total_pages: Set(total_pages),
            raw_bytes: Set(Some(raw_bytes)),
            page_text: Set(None),
            ocr_job_id: Set(None),
            extraction_method: Set(None),
            bundle: Set(None),
            is_completed: Set(false),
            is_failed: Set(false),
            structuring_done: Set(false),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        record.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find page record by ID
    pub async fn find_page_record(&self, id: Uuid) -> Result<Option<PageRecord>> {
        PageRecordEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Find a page record by parent document and page number
    pub async fn page_by_number(
        &self,
        document_id: Uuid,
        page_number: i32,
    ) -> Result<Option<PageRecord>> {
        PageRecordEntity::find()
            .filter(PageRecordColumn::DocumentId.eq(document_id))
            .filter(PageRecordColumn::PageNumber.eq(page_number))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// All page records of a document, ascending by page number
    pub async fn pages_for_document(&self, document_id: Uuid) -> Result<Vec<PageRecord>> {
        PageRecordEntity::find()
            .filter(PageRecordColumn::DocumentId.eq(document_id))
            .order_by_asc(PageRecordColumn::PageNumber)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Resolve a page: store its text, the strategy that produced it, mark it
    /// completed and discard the raw bytes.
    pub async fn resolve_page(&self, id: Uuid, text: &str, method: &str) -> Result<()> {
        PageRecordEntity::update_many()
            .col_expr(PageRecordColumn::PageText, Expr::value(text))
            .col_expr(PageRecordColumn::ExtractionMethod, Expr::value(method))
            .col_expr(PageRecordColumn::IsCompleted, Expr::value(true))
            .col_expr(PageRecordColumn::RawBytes, Expr::value(None::<Vec<u8>>))
            .col_expr(PageRecordColumn::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(PageRecordColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    /// Store the external analysis job id for the cloud OCR path
    pub async fn set_page_ocr_job(&self, id: Uuid, job_id: &str) -> Result<()> {
        PageRecordEntity::update_many()
            .col_expr(PageRecordColumn::OcrJobId, Expr::value(job_id))
            .col_expr(PageRecordColumn::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(PageRecordColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    /// Terminal page failure. The page stays `is_completed = false`, which
    /// permanently blocks the parent document from reaching success.
    pub async fn mark_page_failed(&self, id: Uuid) -> Result<()> {
        PageRecordEntity::update_many()
            .col_expr(PageRecordColumn::IsFailed, Expr::value(true))
            .col_expr(PageRecordColumn::RawBytes, Expr::value(None::<Vec<u8>>))
            .col_expr(PageRecordColumn::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(PageRecordColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    /// Store the per-page structured bundle
    pub async fn set_page_bundle(&self, id: Uuid, bundle: serde_json::Value) -> Result<()> {
        PageRecordEntity::update_many()
            .col_expr(PageRecordColumn::Bundle, Expr::value(bundle))
            .col_expr(PageRecordColumn::StructuringDone, Expr::value(true))
            .col_expr(PageRecordColumn::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(PageRecordColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    /// Mark structuring done without a bundle (pages with no text)
    pub async fn mark_page_structured(&self, id: Uuid) -> Result<()> {
        PageRecordEntity::update_many()
            .col_expr(PageRecordColumn::StructuringDone, Expr::value(true))
            .col_expr(PageRecordColumn::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(PageRecordColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    /// Pages of a document still awaiting text resolution
    pub async fn pending_page_count(&self, document_id: Uuid) -> Result<u64> {
        PageRecordEntity::find()
            .filter(PageRecordColumn::DocumentId.eq(document_id))
            .filter(PageRecordColumn::IsCompleted.eq(false))
            .count(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Pages of a document that failed terminally
    pub async fn failed_page_count(&self, document_id: Uuid) -> Result<u64> {
        PageRecordEntity::find()
            .filter(PageRecordColumn::DocumentId.eq(document_id))
            .filter(PageRecordColumn::IsFailed.eq(true))
            .count(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Completed pages still awaiting structured extraction
    pub async fn unstructured_pages(&self, document_id: Uuid) -> Result<Vec<PageRecord>> {
        PageRecordEntity::find()
            .filter(PageRecordColumn::DocumentId.eq(document_id))
            .filter(PageRecordColumn::IsCompleted.eq(true))
            .filter(PageRecordColumn::StructuringDone.eq(false))
            .filter(PageRecordColumn::IsFailed.eq(false))
            .order_by_asc(PageRecordColumn::PageNumber)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Expected page count for a document, taken from its page records
    pub async fn recorded_page_count(&self, document_id: Uuid) -> Result<u64> {
        PageRecordEntity::find()
            .filter(PageRecordColumn::DocumentId.eq(document_id))
            .count(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Purge all ephemeral page-level artifacts of a case
    pub async fn purge_case_artifacts(&self, case_id: Uuid) -> Result<()> {
        PageRecordEntity::delete_many()
            .filter(PageRecordColumn::CaseId.eq(case_id))
            .exec(self.write_conn())
            .await?;

        PageEmbeddingEntity::delete_many()
            .filter(PageEmbeddingColumn::CaseId.eq(case_id))
            .exec(self.write_conn())
            .await?;

        Ok(())
    }

    // ========================================================================
    // Page Embedding Operations
    // ========================================================================

    /// Insert a page embedding (vector column via raw SQL)
    pub async fn insert_page_embedding(
        &self,
        document_id: Uuid,
        case_id: Uuid,
        page_number: i32,
        page_text: &str,
        embedding: &[f32],
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            INSERT INTO page_embeddings (
                id, document_id, case_id, page_number, page_text, embedding, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6::vector, NOW())
            ON CONFLICT (document_id, page_number) DO UPDATE
                SET page_text = EXCLUDED.page_text, embedding = EXCLUDED.embedding
            "#,
            vec![
                id.into(),
                document_id.into(),
                case_id.into(),
                page_number.into(),
                page_text.into(),
                vector_literal(embedding).into(),
            ],
        );

        use sea_orm::ConnectionTrait;
        self.write_conn().execute(stmt).await?;
        Ok(id)
    }

    /// Fetch the stored embedding vector for a page
    pub async fn page_embedding_vector(
        &self,
        document_id: Uuid,
        page_number: i32,
    ) -> Result<Option<Vec<f32>>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            SELECT embedding::text AS embedding
            FROM page_embeddings
            WHERE document_id = $1 AND page_number = $2
            "#,
            vec![document_id.into(), page_number.into()],
        );

        use sea_orm::ConnectionTrait;
        let row = self.read_conn().query_one(stmt).await?;

        match row {
            Some(row) => {
                let text: String = row.try_get("", "embedding")?;
                Ok(Some(parse_vector_literal(&text)?))
            }
            None => Ok(None),
        }
    }

    /// Nearest pages to an embedding within one case, ascending by distance.
    /// The queried page itself is part of the result set.
    pub async fn nearest_pages(
        &self,
        case_id: Uuid,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<PageNeighbor>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            SELECT
                pe.document_id,
                pe.page_number,
                pe.page_text,
                (pe.embedding <=> $2::vector)::float8 AS distance
            FROM page_embeddings pe
            WHERE pe.case_id = $1
            ORDER BY pe.embedding <=> $2::vector
            LIMIT $3
            "#,
            vec![
                case_id.into(),
                vector_literal(embedding).into(),
                (limit as i64).into(),
            ],
        );

        use sea_orm::ConnectionTrait;
        let rows = self.read_conn().query_all(stmt).await?;

        rows.into_iter()
            .map(|row| {
                Ok(PageNeighbor {
                    document_id: row.try_get("", "document_id")?,
                    page_number: row.try_get("", "page_number")?,
                    page_text: row.try_get("", "page_text")?,
                    distance: row.try_get("", "distance")?,
                })
            })
            .collect()
    }
}

/// Format a vector as a pgvector literal: "[1,2,3]"
fn vector_literal(embedding: &[f32]) -> String {
    format!(
        "[{}]",
        embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

/// Parse a pgvector text literal back into a vector
fn parse_vector_literal(text: &str) -> Result<Vec<f32>> {
    let inner = text.trim().trim_start_matches('[').trim_end_matches(']');
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|part| {
            part.trim().parse::<f32>().map_err(|e| AppError::Internal {
                message: format!("Malformed vector literal: {}", e),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_literal_round_trip() {
        let v = vec![0.25_f32, -1.5, 3.0];
        let literal = vector_literal(&v);
        assert_eq!(literal, "[0.25,-1.5,3]");
        assert_eq!(parse_vector_literal(&literal).unwrap(), v);
    }

    #[test]
    fn test_parse_empty_vector() {
        assert!(parse_vector_literal("[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_vector_literal("[a,b]").is_err());
    }
}
