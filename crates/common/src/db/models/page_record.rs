//! Page record entity - per-page working record, ephemeral within a Document

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "page_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub document_id: Uuid,

    pub case_id: Uuid,

    /// 1-based page number within the parent document
    pub page_number: i32,

    pub total_pages: i32,

    /// Raw single-page bytes, discarded once the page resolves
    pub raw_bytes: Option<Vec<u8>>,

    /// Extracted page text, null until resolved
    #[sea_orm(column_type = "Text", nullable)]
    pub page_text: Option<String>,

    /// External analysis job id for the cloud OCR path
    #[sea_orm(column_type = "Text", nullable)]
    pub ocr_job_id: Option<String>,

    /// Which extraction strategy produced the text: native, local_ocr, cloud_ocr
    #[sea_orm(column_type = "Text", nullable)]
    pub extraction_method: Option<String>,

    /// Per-page structured bundle
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub bundle: Option<Json>,

    pub is_completed: bool,

    pub is_failed: bool,

    /// Structured extraction ran for this page
    pub structuring_done: bool,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// A page is ready for merge once text extraction and structuring both ran
    pub fn is_merge_ready(&self) -> bool {
        self.is_completed && self.structuring_done && !self.is_failed
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::document::Entity",
        from = "Column::DocumentId",
        to = "super::document::Column::Id"
    )]
    Document,
}

impl Related<super::document::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Document.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
